use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{DeliveryRecord, DeliveryStats, EventId, Source, SourceId},
    Result,
};

/// Result of an atomic claim-if-absent on a delivery record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A `pending` record was inserted (or a stale/retryable one reclaimed).
    /// `prior_retries` carries the retry count accumulated so far.
    Claimed { prior_retries: u32 },
    /// A live `pending` record is held by another worker.
    InFlight,
    /// A `success` record exists; the event must never be re-delivered.
    Delivered,
    /// A `failed` record exists with the retry budget spent.
    Exhausted,
}

/// Persistence port for the ledger and offset tracker.
///
/// Implementations must make `claim_event` and `advance_watermark` atomic
/// conditional writes (claim-if-absent, advance-if-greater); last-write-wins
/// semantics are not sufficient.
#[async_trait]
pub trait Store: Send + Sync {
    async fn source(&self, id: SourceId) -> Result<Option<Source>>;
    async fn upsert_source(&self, source: Source) -> Result<()>;

    /// Current watermark for a source; `EventId(0)` for unseen sources.
    async fn watermark(&self, id: SourceId) -> Result<EventId>;

    /// Advance-if-greater. Returns `true` when the watermark moved.
    async fn advance_watermark(&self, id: SourceId, event_id: EventId) -> Result<bool>;

    async fn delivery_record(
        &self,
        source_id: SourceId,
        event_id: EventId,
    ) -> Result<Option<DeliveryRecord>>;

    /// Claim-if-absent: atomically insert a `pending` record for the key, or
    /// report why the claim was refused. A `pending` record older than
    /// `stale_after` is treated as abandoned and reclaimed; a `failed` record
    /// with `retry_count < max_retries` is reclaimed as `pending` again.
    async fn claim_event(
        &self,
        source_id: SourceId,
        event_id: EventId,
        now: DateTime<Utc>,
        stale_after: Duration,
        max_retries: u32,
    ) -> Result<ClaimOutcome>;

    /// Transition a record to `success`. Immutable once set: a second call for
    /// the same key is a no-op.
    async fn mark_success(
        &self,
        source_id: SourceId,
        event_id: EventId,
        forwarded: EventId,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Transition a record to `failed`, adding `attempts` to its retry count.
    /// Never overwrites an existing `success`.
    async fn mark_failed(
        &self,
        source_id: SourceId,
        event_id: EventId,
        error: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Delivery counts for records created at or after `since`.
    async fn stats(&self, since: DateTime<Utc>) -> Result<DeliveryStats>;

    /// `failed` records still under the retry ceiling, oldest first.
    async fn pending_retries(&self, max_retries: u32, limit: usize)
        -> Result<Vec<DeliveryRecord>>;
}
