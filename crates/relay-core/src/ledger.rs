//! Dedup / idempotency ledger.
//!
//! Single source of truth for exactly-once delivery: at most one `success`
//! record per (source, event). A live `pending` record is a lightweight
//! exclusive claim; a corrupted or unreadable record is treated as unknown
//! state and conservatively re-processed, favoring a possible duplicate over
//! a silently lost event.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    domain::{DeliveryRecord, DeliveryStats, DeliveryStatus, EventId, SourceId},
    store::{ClaimOutcome, Store},
    Result,
};

/// Proof of an exclusive pending claim, consumed by `commit_*`.
#[derive(Clone, Copy, Debug)]
pub struct ClaimToken {
    pub source_id: SourceId,
    pub event_id: EventId,
    /// Retry count accumulated by earlier attempts on this key.
    pub prior_retries: u32,
}

/// Gate decision for one event.
#[derive(Clone, Debug)]
pub enum Claim {
    Granted(ClaimToken),
    /// Another worker holds a live pending claim.
    InFlight,
    /// Already delivered; must never be re-delivered.
    Delivered,
    /// Failed with the retry budget spent.
    Exhausted,
}

#[derive(Clone)]
pub struct DeliveryLedger {
    store: Arc<dyn Store>,
    max_retries: u32,
    /// Pending records older than this are treated as abandoned claims.
    pending_staleness: Duration,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn Store>, max_retries: u32, pending_staleness: Duration) -> Self {
        Self {
            store,
            max_retries,
            pending_staleness,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// False only for a committed `success` or an exhausted `failed` record.
    pub async fn should_process(&self, source_id: SourceId, event_id: EventId) -> bool {
        match self.store.delivery_record(source_id, event_id).await {
            Ok(Some(record)) => match record.status {
                DeliveryStatus::Success => false,
                DeliveryStatus::Failed => record.retry_count < self.max_retries,
                DeliveryStatus::Pending => true,
            },
            Ok(None) => true,
            Err(e) => {
                // Unknown state: re-process rather than silently drop.
                eprintln!("[LEDGER] unreadable record for {source_id:?}/{event_id:?}: {e}");
                true
            }
        }
    }

    pub async fn claim(&self, source_id: SourceId, event_id: EventId) -> Result<Claim> {
        self.claim_at(source_id, event_id, Utc::now()).await
    }

    pub async fn claim_at(
        &self,
        source_id: SourceId,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let outcome = match self
            .store
            .claim_event(
                source_id,
                event_id,
                now,
                self.pending_staleness,
                self.max_retries,
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                eprintln!("[LEDGER] claim read failed for {source_id:?}/{event_id:?}: {e}");
                // Unknown state: proceed as if no record existed.
                return Ok(Claim::Granted(ClaimToken {
                    source_id,
                    event_id,
                    prior_retries: 0,
                }));
            }
        };

        Ok(match outcome {
            ClaimOutcome::Claimed { prior_retries } => Claim::Granted(ClaimToken {
                source_id,
                event_id,
                prior_retries,
            }),
            ClaimOutcome::InFlight => Claim::InFlight,
            ClaimOutcome::Delivered => Claim::Delivered,
            ClaimOutcome::Exhausted => Claim::Exhausted,
        })
    }

    pub async fn commit_success(&self, token: ClaimToken, forwarded: EventId) -> Result<()> {
        self.store
            .mark_success(token.source_id, token.event_id, forwarded, Utc::now())
            .await
    }

    /// Commit a failure, adding `attempts` transport attempts to the record's
    /// retry count. `attempts` is zero for failures that consumed no transport
    /// call (circuit open).
    pub async fn commit_failure(
        &self,
        token: ClaimToken,
        error: &str,
        attempts: u32,
    ) -> Result<()> {
        self.store
            .mark_failed(token.source_id, token.event_id, error, attempts, Utc::now())
            .await
    }

    pub async fn stats(&self, window: Duration) -> Result<DeliveryStats> {
        let since = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.store.stats(since).await
    }

    /// Failed-but-retryable records, oldest first. Operator surface: re-driving
    /// these through the normal intake path retries them.
    pub async fn pending_retries(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        self.store.pending_retries(self.max_retries, limit).await
    }
}
