use std::time::Duration;

/// Ambient error type for the relay core.
///
/// Adapter crates map their specific errors into this type so the core can
/// handle failures consistently. Delivery-attempt failures use the separate
/// [`DeliveryError`] taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome classification for a single transport delivery attempt.
///
/// `RateLimited` and `Transient` never escape the delivery executor; the
/// pipeline only ever sees `Permanent`, `ChannelUnavailable` and
/// `RetryExhausted`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("rate limited, upstream asked to wait {wait:?}")]
    RateLimited { wait: Duration },

    #[error("transient delivery failure: {reason}")]
    Transient { reason: String },

    #[error("permanent delivery failure: {reason}")]
    Permanent { reason: String },

    #[error("destination unavailable (circuit open)")]
    ChannelUnavailable,

    #[error("retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

impl DeliveryError {
    pub fn transient(reason: impl Into<String>) -> Self {
        DeliveryError::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        DeliveryError::Permanent {
            reason: reason.into(),
        }
    }

    /// Whether the executor may retry this attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::RateLimited { .. } | DeliveryError::Transient { .. }
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DeliveryError::RateLimited { .. } => ErrorCategory::RateLimited,
            DeliveryError::Transient { .. } => ErrorCategory::Transient,
            DeliveryError::Permanent { .. } => ErrorCategory::Permanent,
            DeliveryError::ChannelUnavailable => ErrorCategory::CircuitOpen,
            DeliveryError::RetryExhausted { .. } => ErrorCategory::RetryExhausted,
        }
    }
}

/// Coarse failure category, used as the notification-throttle key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    RateLimited,
    Transient,
    Permanent,
    CircuitOpen,
    RetryExhausted,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::RetryExhausted => "retry_exhausted",
        }
    }
}
