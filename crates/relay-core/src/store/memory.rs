use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    domain::{DeliveryRecord, DeliveryStats, DeliveryStatus, EventId, Source, SourceId},
    store::port::{ClaimOutcome, Store},
    Result,
};

/// In-memory reference store.
///
/// All conditional writes happen under one async mutex, which gives them the
/// required atomicity within a process. A durable backend (sqlite, redis)
/// would implement the same port with per-key conditional writes.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sources: HashMap<SourceId, Source>,
    records: HashMap<(SourceId, EventId), DeliveryRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn source(&self, id: SourceId) -> Result<Option<Source>> {
        Ok(self.inner.lock().await.sources.get(&id).cloned())
    }

    async fn upsert_source(&self, source: Source) -> Result<()> {
        self.inner.lock().await.sources.insert(source.id, source);
        Ok(())
    }

    async fn watermark(&self, id: SourceId) -> Result<EventId> {
        Ok(self
            .inner
            .lock()
            .await
            .sources
            .get(&id)
            .map(|s| s.last_processed_event_id)
            .unwrap_or(EventId(0)))
    }

    async fn advance_watermark(&self, id: SourceId, event_id: EventId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(source) = inner.sources.get_mut(&id) else {
            return Ok(false);
        };
        if event_id <= source.last_processed_event_id {
            return Ok(false);
        }
        source.last_processed_event_id = event_id;
        Ok(true)
    }

    async fn delivery_record(
        &self,
        source_id: SourceId,
        event_id: EventId,
    ) -> Result<Option<DeliveryRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .records
            .get(&(source_id, event_id))
            .cloned())
    }

    async fn claim_event(
        &self,
        source_id: SourceId,
        event_id: EventId,
        now: DateTime<Utc>,
        stale_after: Duration,
        max_retries: u32,
    ) -> Result<ClaimOutcome> {
        let mut inner = self.inner.lock().await;
        let key = (source_id, event_id);

        if let Some(existing) = inner.records.get_mut(&key) {
            match existing.status {
                DeliveryStatus::Success => return Ok(ClaimOutcome::Delivered),
                DeliveryStatus::Pending => {
                    let age = now.signed_duration_since(existing.created_at);
                    let stale = chrono::Duration::from_std(stale_after)
                        .map(|d| age >= d)
                        .unwrap_or(false);
                    if !stale {
                        return Ok(ClaimOutcome::InFlight);
                    }
                    // Abandoned claim: reclaim it.
                    existing.created_at = now;
                    return Ok(ClaimOutcome::Claimed {
                        prior_retries: existing.retry_count,
                    });
                }
                DeliveryStatus::Failed => {
                    if existing.retry_count >= max_retries {
                        return Ok(ClaimOutcome::Exhausted);
                    }
                    existing.status = DeliveryStatus::Pending;
                    existing.created_at = now;
                    existing.completed_at = None;
                    return Ok(ClaimOutcome::Claimed {
                        prior_retries: existing.retry_count,
                    });
                }
            }
        }

        inner.records.insert(
            key,
            DeliveryRecord {
                source_id,
                event_id,
                status: DeliveryStatus::Pending,
                forwarded_event_id: None,
                retry_count: 0,
                error: None,
                created_at: now,
                completed_at: None,
            },
        );
        Ok(ClaimOutcome::Claimed { prior_retries: 0 })
    }

    async fn mark_success(
        &self,
        source_id: SourceId,
        event_id: EventId,
        forwarded: EventId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&(source_id, event_id)) else {
            return Ok(());
        };
        if record.status == DeliveryStatus::Success {
            return Ok(()); // terminal, immutable
        }
        record.status = DeliveryStatus::Success;
        record.forwarded_event_id = Some(forwarded);
        record.error = None;
        record.completed_at = Some(now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        source_id: SourceId,
        event_id: EventId,
        error: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&(source_id, event_id)) else {
            return Ok(());
        };
        if record.status == DeliveryStatus::Success {
            return Ok(()); // never downgrade a success
        }
        record.status = DeliveryStatus::Failed;
        record.retry_count = record.retry_count.saturating_add(attempts);
        record.error = Some(error.to_string());
        record.completed_at = Some(now);
        Ok(())
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<DeliveryStats> {
        let inner = self.inner.lock().await;
        let mut stats = DeliveryStats::default();
        for record in inner.records.values() {
            if record.created_at < since {
                continue;
            }
            match record.status {
                DeliveryStatus::Success => stats.success += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Pending => stats.pending += 1,
            }
        }
        Ok(stats)
    }

    async fn pending_retries(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<DeliveryRecord> = inner
            .records
            .values()
            .filter(|r| r.status == DeliveryStatus::Failed && r.retry_count < max_retries)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out.truncate(limit);
        Ok(out)
    }
}
