use async_trait::async_trait;

use crate::{
    domain::{ChannelId, EventId, ReleasedUnit, UserId},
    errors::{DeliveryError, ErrorCategory},
    Result,
};

/// Hexagonal port for the delivery transport.
///
/// Telegram (Bot API) is the first implementation. One call delivers one
/// released unit — a single event or a whole album — atomically, and returns
/// the destination-side id of the forwarded event. Implementations classify
/// their library-specific failures into the [`DeliveryError`] taxonomy,
/// including the explicit rate-limit signal with its wait duration.
#[async_trait]
pub trait TransportPort: Send + Sync {
    async fn deliver(
        &self,
        destination: ChannelId,
        unit: &ReleasedUnit,
    ) -> std::result::Result<EventId, DeliveryError>;
}

/// Port for terminal-failure notifications. Fire-and-forget; the pipeline
/// throttles before calling.
#[async_trait]
pub trait NotifierPort: Send + Sync {
    async fn notify(&self, user: UserId, category: ErrorCategory, details: &str) -> Result<()>;
}
