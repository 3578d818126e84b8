//! Forwarding pipeline: intake → filter → staleness check → aggregation →
//! dedup claim → delivery → commit.
//!
//! `submit` is infallible by design: every inbound event ends in exactly one
//! journaled decision (delivered, abandoned, deferred, duplicate, stale or
//! filtered), and internal errors degrade to conservative re-processing rather
//! than propagating to the intake loop.

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    config::Config,
    domain::{ChannelId, DeliveryRecord, DeliveryStats, InboundEvent, ReleasedUnit, UserId},
    errors::DeliveryError,
    executor::{DeliveryExecutor, ExecutorSettings},
    filter::{FilterMode, KeywordFilter},
    journal::{DeliveryJournal, JournalEntry},
    ledger::{Claim, ClaimToken, DeliveryLedger},
    notify::ThrottledNotifier,
    offsets::OffsetTracker,
    ports::{NotifierPort, TransportPort},
    store::Store,
    window::{AggregationWindow, BoxFuture, ReleaseFn},
    Result,
};

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub destination: ChannelId,
    pub admin: Option<UserId>,
    pub max_retries: u32,
    pub media_group_timeout: Duration,
    /// Also the pending-claim staleness horizon: a claim older than the
    /// delivery deadline cannot still be in flight.
    pub delivery_deadline: Duration,
    pub notify_cooldown: Duration,
    pub executor: ExecutorSettings,
    pub filter_keywords: Vec<String>,
    pub filter_mode: FilterMode,
    pub filter_case_sensitive: bool,
    pub journal_path: PathBuf,
    pub journal_json: bool,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            destination: ChannelId(cfg.destination_channel),
            admin: cfg.admin_user_id.map(UserId),
            max_retries: cfg.max_retries,
            media_group_timeout: cfg.media_group_timeout,
            delivery_deadline: cfg.delivery_deadline,
            notify_cooldown: cfg.notify_cooldown,
            executor: ExecutorSettings::from_config(cfg),
            filter_keywords: cfg.filter_keywords.clone(),
            filter_mode: cfg.filter_mode,
            filter_case_sensitive: cfg.filter_case_sensitive,
            journal_path: cfg.journal_path.clone(),
            journal_json: cfg.journal_json,
        }
    }
}

struct PipelineInner {
    destination: ChannelId,
    admin: Option<UserId>,
    filter: KeywordFilter,
    offsets: OffsetTracker,
    ledger: DeliveryLedger,
    executor: DeliveryExecutor,
    journal: DeliveryJournal,
    notifier: ThrottledNotifier,
}

pub struct ForwardingPipeline {
    inner: Arc<PipelineInner>,
    window: Arc<AggregationWindow>,
}

impl ForwardingPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn TransportPort>,
        notifier: Arc<dyn NotifierPort>,
        settings: PipelineSettings,
    ) -> Self {
        let inner = Arc::new(PipelineInner {
            destination: settings.destination,
            admin: settings.admin,
            filter: KeywordFilter::new(
                settings.filter_keywords,
                settings.filter_mode,
                settings.filter_case_sensitive,
            ),
            offsets: OffsetTracker::new(store.clone()),
            ledger: DeliveryLedger::new(store, settings.max_retries, settings.delivery_deadline),
            executor: DeliveryExecutor::new(transport, settings.executor),
            journal: DeliveryJournal::new(settings.journal_path, settings.journal_json),
            notifier: ThrottledNotifier::new(notifier, settings.notify_cooldown),
        });

        let release_inner = Arc::clone(&inner);
        let release: ReleaseFn = Arc::new(move |unit| {
            let inner = Arc::clone(&release_inner);
            Box::pin(async move { inner.deliver_unit(unit).await }) as BoxFuture
        });

        let window = AggregationWindow::new(settings.media_group_timeout, release);

        Self { inner, window }
    }

    /// Offer one inbound event to the pipeline. Never fails: every outcome is
    /// journaled and absorbed here.
    pub async fn submit(&self, event: InboundEvent) {
        if !self.inner.filter.allows(event.text.as_deref()) {
            println!(
                "[PIPE] filtered event {} from source {}",
                event.event_id.0, event.source_id.0
            );
            self.inner.journal(JournalEntry::filtered(&event));
            return;
        }

        // Cheap replay cutoff before any ledger traffic. A read failure falls
        // back to processing; the ledger still guarantees no duplicate send.
        let watermark = self
            .inner
            .offsets
            .last_processed(event.source_id)
            .await
            .unwrap_or_else(|e| {
                eprintln!("[PIPE] watermark read failed: {e}");
                crate::domain::EventId(0)
            });
        if event.event_id <= watermark {
            self.inner.journal(JournalEntry::stale(&event));
            return;
        }

        self.window.offer(event).await;
    }

    pub async fn stats(&self, window: Duration) -> Result<DeliveryStats> {
        self.inner.ledger.stats(window).await
    }

    /// Failed-but-retryable deliveries, oldest first.
    pub async fn pending_retries(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        self.inner.ledger.pending_retries(limit).await
    }

    /// Drain: discard buffered groups, wait for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.window.shutdown().await;
    }
}

impl PipelineInner {
    async fn deliver_unit(&self, unit: ReleasedUnit) {
        let Some(source_id) = unit.source_id() else {
            return;
        };

        // The whole unit shares one fate, so one already-settled member means
        // the unit was settled.
        for event in &unit.events {
            if !self.ledger.should_process(source_id, event.event_id).await {
                self.journal_opt(JournalEntry::duplicate(&unit));
                return;
            }
        }

        // Claim every member before sending. Bailing on a refused claim can
        // leave earlier members pending; those claims go stale after the
        // delivery deadline and are reclaimed on the next replay.
        let mut tokens: Vec<ClaimToken> = Vec::with_capacity(unit.len());
        for event in &unit.events {
            match self.ledger.claim(source_id, event.event_id).await {
                Ok(Claim::Granted(token)) => tokens.push(token),
                Ok(Claim::InFlight) | Ok(Claim::Delivered) | Ok(Claim::Exhausted) => {
                    self.journal_opt(JournalEntry::duplicate(&unit));
                    return;
                }
                Err(e) => {
                    // claim() already degrades store failures to a grant;
                    // anything else is a bug worth surfacing, not retrying.
                    eprintln!("[PIPE] claim failed for source {}: {e}", source_id.0);
                    return;
                }
            }
        }

        match self.executor.deliver(self.destination, &unit).await {
            Ok(forwarded) => {
                for token in &tokens {
                    if let Err(e) = self.ledger.commit_success(*token, forwarded).await {
                        eprintln!("[PIPE] success commit failed: {e}");
                    }
                }
                if let Some(max_id) = unit.max_event_id() {
                    if let Err(e) = self.offsets.advance(source_id, max_id).await {
                        eprintln!("[PIPE] watermark advance failed: {e}");
                    }
                }
                println!(
                    "[PIPE] delivered {} event(s) from source {} as {}",
                    unit.len(),
                    source_id.0,
                    forwarded.0
                );
                self.journal_opt(JournalEntry::delivered(&unit, forwarded));
            }
            Err(DeliveryError::ChannelUnavailable) => {
                // No transport attempt happened; the retry budget is intact
                // and a later replay re-drives the event.
                let error = DeliveryError::ChannelUnavailable.to_string();
                for token in &tokens {
                    if let Err(e) = self.ledger.commit_failure(*token, &error, 0).await {
                        eprintln!("[PIPE] failure commit failed: {e}");
                    }
                }
                println!(
                    "[PIPE] deferred {} event(s) from source {}: circuit open",
                    unit.len(),
                    source_id.0
                );
                self.journal_opt(JournalEntry::deferred(&unit, &error));
                self.notify(&DeliveryError::ChannelUnavailable, &unit, &error)
                    .await;
            }
            Err(err) => {
                // Permanent or retry-exhausted: terminal for this pass.
                let attempts = match &err {
                    DeliveryError::RetryExhausted { attempts } => *attempts,
                    _ => 1,
                };
                let error = err.to_string();
                for token in &tokens {
                    if let Err(e) = self.ledger.commit_failure(*token, &error, attempts).await {
                        eprintln!("[PIPE] failure commit failed: {e}");
                    }
                }
                let retry_count = tokens
                    .first()
                    .map(|t| t.prior_retries + attempts)
                    .unwrap_or(attempts);
                println!(
                    "[PIPE] abandoned {} event(s) from source {} after {} attempt(s): {error}",
                    unit.len(),
                    source_id.0,
                    retry_count
                );
                self.journal_opt(JournalEntry::abandoned(&unit, retry_count, &error));
                self.notify(&err, &unit, &error).await;
            }
        }
    }

    async fn notify(&self, err: &DeliveryError, unit: &ReleasedUnit, details: &str) {
        let Some(admin) = self.admin else {
            return;
        };
        let summary = format!(
            "delivery failed for source {}, event {}: {details}",
            unit.source_id().map(|s| s.0).unwrap_or_default(),
            unit.max_event_id().map(|e| e.0).unwrap_or_default(),
        );
        if let Err(e) = self.notifier.notify(admin, err.category(), &summary).await {
            eprintln!("[PIPE] notification failed: {e}");
        }
    }

    fn journal(&self, entry: JournalEntry) {
        if let Err(e) = self.journal.write(entry) {
            eprintln!("[PIPE] journal write failed: {e}");
        }
    }

    fn journal_opt(&self, entry: Option<JournalEntry>) {
        if let Some(entry) = entry {
            self.journal(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeliveryStatus, EventId, EventKind, Source, SourceId};
    use crate::errors::ErrorCategory;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    const DEST: ChannelId = ChannelId(-200);
    const SRC: SourceId = SourceId(1);
    const SRC_CHANNEL: ChannelId = ChannelId(-100);

    struct RecordingTransport {
        units: Mutex<Vec<ReleasedUnit>>,
        fail_with: Option<DeliveryError>,
    }

    impl RecordingTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                units: Mutex::new(Vec::new()),
                fail_with: None,
            })
        }

        fn failing(err: DeliveryError) -> Arc<Self> {
            Arc::new(Self {
                units: Mutex::new(Vec::new()),
                fail_with: Some(err),
            })
        }

        async fn call_count(&self) -> usize {
            self.units.lock().await.len()
        }
    }

    #[async_trait]
    impl TransportPort for RecordingTransport {
        async fn deliver(
            &self,
            _destination: ChannelId,
            unit: &ReleasedUnit,
        ) -> std::result::Result<EventId, DeliveryError> {
            self.units.lock().await.push(unit.clone());
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(EventId(1000)),
            }
        }
    }

    struct RecordingNotifier {
        sent: Mutex<Vec<(UserId, ErrorCategory)>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotifierPort for RecordingNotifier {
        async fn notify(
            &self,
            user: UserId,
            category: ErrorCategory,
            _details: &str,
        ) -> Result<()> {
            self.sent.lock().await.push((user, category));
            Ok(())
        }
    }

    fn tmp_journal(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}.log", std::process::id()))
    }

    fn settings(prefix: &str) -> PipelineSettings {
        PipelineSettings {
            destination: DEST,
            admin: Some(UserId(7)),
            max_retries: 5,
            media_group_timeout: Duration::from_secs(2),
            delivery_deadline: Duration::from_secs(180),
            notify_cooldown: Duration::from_secs(300),
            executor: ExecutorSettings {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                failure_threshold: 100,
                recovery_timeout: Duration::from_secs(60),
                max_ops_per_second: 1000,
                deadline: Duration::from_secs(3600),
            },
            filter_keywords: Vec::new(),
            filter_mode: FilterMode::Blacklist,
            filter_case_sensitive: false,
            journal_path: tmp_journal(prefix),
            journal_json: true,
        }
    }

    async fn store_with_source() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_source(Source {
                id: SRC,
                channel_id: SRC_CHANNEL,
                last_processed_event_id: EventId(0),
                active: true,
            })
            .await
            .unwrap();
        store
    }

    fn event(id: i64, group: Option<&str>, text: Option<&str>) -> InboundEvent {
        InboundEvent {
            source_id: SRC,
            channel_id: SRC_CHANNEL,
            event_id: EventId(id),
            group_id: group.map(|s| s.to_string()),
            kind: if group.is_some() {
                EventKind::Photo
            } else {
                EventKind::Text
            },
            text: text.map(|s| s.to_string()),
            media_file_id: group.map(|_| format!("file-{id}")),
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_submission_delivers_once() {
        let store = store_with_source().await;
        let transport = RecordingTransport::ok();
        let pipeline = ForwardingPipeline::new(
            store.clone(),
            transport.clone(),
            RecordingNotifier::new(),
            settings("pipe-dup"),
        );

        pipeline.submit(event(5, None, Some("hello"))).await;
        pipeline.submit(event(5, None, Some("hello"))).await;

        assert_eq!(transport.call_count().await, 1);
        assert_eq!(store.watermark(SRC).await.unwrap(), EventId(5));
        let record = store.delivery_record(SRC, EventId(5)).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Success);
        assert_eq!(record.forwarded_event_id, Some(EventId(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_watermark_and_notify_once() {
        let store = store_with_source().await;
        let transport = RecordingTransport::failing(DeliveryError::transient("timeout"));
        let notifier = RecordingNotifier::new();
        let pipeline = ForwardingPipeline::new(
            store.clone(),
            transport.clone(),
            notifier.clone(),
            settings("pipe-exhaust"),
        );

        pipeline.submit(event(9, None, Some("hello"))).await;

        assert_eq!(transport.call_count().await, 5);
        let record = store.delivery_record(SRC, EventId(9)).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.retry_count, 5);
        // Failure never advances the watermark.
        assert_eq!(store.watermark(SRC).await.unwrap(), EventId(0));

        let sent = notifier.sent.lock().await;
        assert_eq!(sent.as_slice(), &[(UserId(7), ErrorCategory::RetryExhausted)]);
    }

    #[tokio::test(start_paused = true)]
    async fn group_is_delivered_atomically_in_order() {
        let store = store_with_source().await;
        let transport = RecordingTransport::ok();
        let pipeline = ForwardingPipeline::new(
            store.clone(),
            transport.clone(),
            RecordingNotifier::new(),
            settings("pipe-group"),
        );

        for id in [12, 10, 11] {
            pipeline.submit(event(id, Some("album"), None)).await;
        }
        assert_eq!(transport.call_count().await, 0); // still buffered

        tokio::time::sleep(Duration::from_millis(2100)).await;

        let units = transport.units.lock().await;
        assert_eq!(units.len(), 1);
        let ids: Vec<i64> = units[0].events.iter().map(|e| e.event_id.0).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        drop(units);

        for id in [10, 11, 12] {
            let record = store
                .delivery_record(SRC, EventId(id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.status, DeliveryStatus::Success);
        }
        assert_eq!(store.watermark(SRC).await.unwrap(), EventId(12));
    }

    #[tokio::test]
    async fn stale_events_are_dropped_before_the_ledger() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_source(Source {
                id: SRC,
                channel_id: SRC_CHANNEL,
                last_processed_event_id: EventId(10),
                active: true,
            })
            .await
            .unwrap();

        let transport = RecordingTransport::ok();
        let pipeline = ForwardingPipeline::new(
            store.clone(),
            transport.clone(),
            RecordingNotifier::new(),
            settings("pipe-stale"),
        );

        pipeline.submit(event(5, None, Some("replay"))).await;

        assert_eq!(transport.call_count().await, 0);
        assert!(store.delivery_record(SRC, EventId(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filtered_events_leave_no_trace_in_the_store() {
        let store = store_with_source().await;
        let transport = RecordingTransport::ok();
        let mut settings = settings("pipe-filter");
        settings.filter_keywords = vec!["rust".to_string()];
        settings.filter_mode = FilterMode::Whitelist;
        let pipeline = ForwardingPipeline::new(
            store.clone(),
            transport.clone(),
            RecordingNotifier::new(),
            settings,
        );

        pipeline.submit(event(3, None, Some("cooking tips"))).await;
        pipeline.submit(event(4, None, Some("rust tips"))).await;

        assert_eq!(transport.call_count().await, 1);
        assert!(store.delivery_record(SRC, EventId(3)).await.unwrap().is_none());
        assert_eq!(store.watermark(SRC).await.unwrap(), EventId(4));
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_open_defers_without_spending_retry_budget() {
        let store = store_with_source().await;
        // Threshold 1 and a single max attempt: the first delivery fails and
        // opens the circuit, the second is deferred without a transport call.
        let mut settings = settings("pipe-defer");
        settings.executor.failure_threshold = 1;
        settings.executor.max_attempts = 1;
        settings.max_retries = 5;

        let transport = RecordingTransport::failing(DeliveryError::transient("down"));
        let notifier = RecordingNotifier::new();
        let pipeline = ForwardingPipeline::new(
            store.clone(),
            transport.clone(),
            notifier.clone(),
            settings,
        );

        pipeline.submit(event(1, None, Some("first"))).await;
        assert_eq!(transport.call_count().await, 1);

        pipeline.submit(event(2, None, Some("second"))).await;
        assert_eq!(transport.call_count().await, 1); // circuit open, no call

        let record = store.delivery_record(SRC, EventId(2)).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.retry_count, 0); // budget untouched

        let categories: Vec<ErrorCategory> = notifier
            .sent
            .lock()
            .await
            .iter()
            .map(|(_, c)| *c)
            .collect();
        assert_eq!(
            categories,
            vec![ErrorCategory::RetryExhausted, ErrorCategory::CircuitOpen]
        );
    }
}
