//! Aggregation window for multi-part event groups (albums).
//!
//! Group members arrive as separate events sharing a group id, in no
//! guaranteed order. The first arrival starts a countdown; when it elapses the
//! buffered set is released as one unit, sorted by ascending event id.
//! Non-grouped events pass straight through as single-element units.
//!
//! Buffered members are lost if the process stops mid-window. That is an
//! accepted bounded-loss window (the countdown duration), not a correctness
//! requirement — the ledger never saw these events, so a replay re-offers them.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::domain::{InboundEvent, ReleasedUnit};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ReleaseFn = Arc<dyn Fn(ReleasedUnit) -> BoxFuture + Send + Sync>;

struct PendingGroup {
    events: Vec<InboundEvent>,
    started_at: Instant,
}

/// Arena of pending groups keyed by group id.
///
/// The outer map lock is held only to look up or insert a slot; appends and
/// the release take happen under the per-group slot lock, so unrelated groups
/// never contend.
pub struct AggregationWindow {
    timeout: Duration,
    release: ReleaseFn,
    groups: Mutex<HashMap<String, Arc<Mutex<Option<PendingGroup>>>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl AggregationWindow {
    pub fn new(timeout: Duration, release: ReleaseFn) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            release,
            groups: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Offer one inbound event. Non-grouped events are released inline (the
    /// caller awaits the delivery, preserving per-source ordering); grouped
    /// events are buffered and released later by the group's timer task.
    pub async fn offer(self: &Arc<Self>, event: InboundEvent) {
        let Some(group_id) = event.group_id.clone() else {
            (self.release)(ReleasedUnit::single(event)).await;
            return;
        };

        if self.shutdown.is_cancelled() {
            return; // draining; discard (bounded loss)
        }

        let mut event = event;
        loop {
            let slot = self.slot_for(&group_id).await;
            event = match self.try_buffer(&group_id, &slot, event).await {
                Ok(()) => return,
                // The slot was unlinked by a release between lookup and lock;
                // retry against the current slot.
                Err(bounced) => bounced,
            };
        }
    }

    /// Buffer one grouped event into `slot`, or hand it back when `slot` is
    /// no longer the mapped slot for `group_id`. That happens when the
    /// release timer empties the slot and drops its map entry after the
    /// caller's lookup; buffering there would strand the event in a slot no
    /// flush can reach.
    async fn try_buffer(
        self: &Arc<Self>,
        group_id: &str,
        slot: &Arc<Mutex<Option<PendingGroup>>>,
        event: InboundEvent,
    ) -> std::result::Result<(), InboundEvent> {
        let mut guard = slot.lock().await;
        if let Some(group) = guard.as_mut() {
            group.events.push(event);
            return Ok(());
        }

        let map = self.groups.lock().await;
        let linked = map
            .get(group_id)
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false);
        if !linked {
            return Err(event);
        }

        let cancel = self.shutdown.child_token();
        *guard = Some(PendingGroup {
            events: vec![event],
            started_at: Instant::now(),
        });
        drop(map);
        drop(guard);
        // Exactly one release timer per group, counting down from the first
        // arrival (late members do not extend it).
        self.spawn_timer(group_id.to_string(), cancel);
        Ok(())
    }

    async fn slot_for(&self, group_id: &str) -> Arc<Mutex<Option<PendingGroup>>> {
        let mut map = self.groups.lock().await;
        map.entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn spawn_timer(self: &Arc<Self>, group_id: String, cancel: CancellationToken) {
        let window = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(window.timeout) => {
                    window.flush(&group_id).await;
                }
            }
        });
    }

    async fn flush(self: &Arc<Self>, group_id: &str) {
        let slot = { self.groups.lock().await.remove(group_id) };
        let Some(slot) = slot else {
            return;
        };
        let group = { slot.lock().await.take() };
        let Some(group) = group else {
            return;
        };

        let mut events = group.events;
        events.sort_by_key(|e| e.event_id);
        println!(
            "[WINDOW] releasing group {group_id} ({} events, buffered {:?})",
            events.len(),
            group.started_at.elapsed()
        );

        (self.release)(ReleasedUnit { events }).await;
    }

    /// Discard pending groups, cancel their timers and wait for releases
    /// already in flight to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.groups.lock().await.clear();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelId, EventId, EventKind, SourceId};
    use chrono::Utc;

    fn event(id: i64, group: Option<&str>) -> InboundEvent {
        InboundEvent {
            source_id: SourceId(1),
            channel_id: ChannelId(-100),
            event_id: EventId(id),
            group_id: group.map(|s| s.to_string()),
            kind: if group.is_some() {
                EventKind::Photo
            } else {
                EventKind::Text
            },
            text: None,
            media_file_id: group.map(|_| format!("file-{id}")),
            captured_at: Utc::now(),
        }
    }

    fn collector() -> (ReleaseFn, Arc<Mutex<Vec<ReleasedUnit>>>) {
        let released: Arc<Mutex<Vec<ReleasedUnit>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = released.clone();
        let release: ReleaseFn = Arc::new(move |unit| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push(unit);
            }) as BoxFuture
        });
        (release, released)
    }

    #[tokio::test]
    async fn ungrouped_events_pass_through_immediately() {
        let (release, released) = collector();
        let window = AggregationWindow::new(Duration::from_secs(2), release);

        window.offer(event(5, None)).await;

        let got = released.lock().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].len(), 1);
        assert_eq!(got[0].events[0].event_id, EventId(5));
    }

    #[tokio::test(start_paused = true)]
    async fn group_released_once_sorted_after_timeout() {
        let (release, released) = collector();
        let window = AggregationWindow::new(Duration::from_secs(2), release);

        // Out-of-order arrival within the window.
        for id in [5, 3, 4] {
            window.offer(event(id, Some("album-1"))).await;
        }
        assert!(released.lock().await.is_empty());

        tokio::time::sleep(Duration::from_millis(2100)).await;

        let got = released.lock().await;
        assert_eq!(got.len(), 1);
        let ids: Vec<i64> = got[0].events.iter().map(|e| e.event_id.0).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_groups_release_independently() {
        let (release, released) = collector();
        let window = AggregationWindow::new(Duration::from_secs(2), release);

        window.offer(event(1, Some("a"))).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        window.offer(event(2, Some("b"))).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(released.lock().await.len(), 1); // only "a" elapsed

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(released.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn member_racing_a_release_is_rebuffered_not_lost() {
        let (release, released) = collector();
        let window = AggregationWindow::new(Duration::from_secs(2), release);

        // A release can empty a slot and drop its map entry after a late
        // member has already resolved that slot. Reproduce that state, then
        // check the member bounces instead of vanishing into the orphan.
        let stale = window.slot_for("g").await;
        window.groups.lock().await.remove("g");

        let bounced = window
            .try_buffer("g", &stale, event(2, Some("g")))
            .await
            .unwrap_err();
        assert!(stale.lock().await.is_none());
        assert_eq!(bounced.event_id, EventId(2));

        // The retry path re-resolves the slot and the member is released.
        window.offer(bounced).await;
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let got = released.lock().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].events[0].event_id, EventId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_buffered_groups() {
        let (release, released) = collector();
        let window = AggregationWindow::new(Duration::from_secs(2), release);

        window.offer(event(1, Some("doomed"))).await;
        window.shutdown().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(released.lock().await.is_empty());
    }
}
