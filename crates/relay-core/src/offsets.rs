//! Per-source high-water mark of the last processed event id.
//!
//! The tracker is a cheap first-pass replay filter in front of the ledger: an
//! event at or below the watermark is dropped without touching the ledger at
//! all. It is only an optimization; the ledger stays the source of truth.

use std::sync::Arc;

use crate::{
    domain::{EventId, SourceId},
    store::Store,
    Result,
};

#[derive(Clone)]
pub struct OffsetTracker {
    store: Arc<dyn Store>,
}

impl OffsetTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Highest fully-processed event id for a source; `EventId(0)` when unseen.
    pub async fn last_processed(&self, source_id: SourceId) -> Result<EventId> {
        self.store.watermark(source_id).await
    }

    /// Advance-if-greater. Idempotent under reordered calls; returns whether
    /// the watermark actually moved.
    pub async fn advance(&self, source_id: SourceId, event_id: EventId) -> Result<bool> {
        self.store.advance_watermark(source_id, event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelId, Source};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn advance_is_monotonic_and_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_source(Source {
                id: SourceId(1),
                channel_id: ChannelId(-100),
                last_processed_event_id: EventId(0),
                active: true,
            })
            .await
            .unwrap();

        let offsets = OffsetTracker::new(store);
        assert_eq!(offsets.last_processed(SourceId(1)).await.unwrap(), EventId(0));

        assert!(offsets.advance(SourceId(1), EventId(7)).await.unwrap());
        // Reordered/duplicate calls are no-ops.
        assert!(!offsets.advance(SourceId(1), EventId(3)).await.unwrap());
        assert!(!offsets.advance(SourceId(1), EventId(7)).await.unwrap());
        assert_eq!(offsets.last_processed(SourceId(1)).await.unwrap(), EventId(7));
    }

    #[tokio::test]
    async fn unseen_source_defaults_to_zero() {
        let offsets = OffsetTracker::new(Arc::new(MemoryStore::new()));
        assert_eq!(
            offsets.last_processed(SourceId(42)).await.unwrap(),
            EventId(0)
        );
    }
}
