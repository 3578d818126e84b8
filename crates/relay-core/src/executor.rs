//! Delivery executor: one logical delivery against the destination, with
//! retry/backoff, explicit rate-limit handling and a per-destination circuit
//! breaker.
//!
//! `RateLimited` and `Transient` outcomes are absorbed here; callers only see
//! success, `Permanent`, `ChannelUnavailable` or `RetryExhausted`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    config::Config,
    domain::{ChannelId, EventId, ReleasedUnit},
    errors::DeliveryError,
    ports::TransportPort,
};

#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    /// Transient-failure attempt ceiling per logical delivery.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Open → half-open delay.
    pub recovery_timeout: Duration,
    /// Destination throughput cap, shared across all sources.
    pub max_ops_per_second: u32,
    /// End-to-end bound for one logical delivery including all retries.
    pub deadline: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            max_ops_per_second: 30,
            deadline: Duration::from_secs(180),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.max_retries,
            base_delay: cfg.base_retry_delay,
            max_delay: cfg.max_retry_delay,
            failure_threshold: cfg.circuit_failure_threshold,
            recovery_timeout: cfg.circuit_recovery,
            max_ops_per_second: cfg.max_messages_per_second,
            deadline: cfg.delivery_deadline,
        }
    }

    /// Exponential backoff sans jitter: `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(31) as i32);
        Duration::from_secs_f64(exp.min(self.max_delay.as_secs_f64()))
    }
}

// === Circuit breaker ===

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-destination failure isolation. In-memory only: a restart at worst
/// costs one extra probe cycle.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    recovery: Duration,
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery: Duration) -> Self {
        Self {
            threshold,
            recovery,
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may go out now. While open, flips to half-open once the
    /// recovery timeout elapses and grants exactly one trial call.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false, // trial call already in flight
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or(self.recovery);
                if elapsed >= self.recovery {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        match self.state {
            // A failed trial call reopens immediately.
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            CircuitState::Closed if self.failures >= self.threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            _ => {}
        }
    }
}

// === Destination pacing ===

/// Reserves evenly spaced send slots so the destination never sees more than
/// the configured operations per second, across all sources feeding it.
#[derive(Debug)]
struct SpacingLimiter {
    interval: Duration,
    next: Instant,
}

impl SpacingLimiter {
    fn new(max_per_second: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / max_per_second.max(1),
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait required before sending.
    fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn reserve_at(&mut self, now: Instant) -> Duration {
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

// === Executor ===

pub struct DeliveryExecutor {
    transport: Arc<dyn TransportPort>,
    settings: ExecutorSettings,
    limiters: Mutex<HashMap<i64, Arc<Mutex<SpacingLimiter>>>>,
    breakers: Mutex<HashMap<i64, Arc<Mutex<CircuitBreaker>>>>,
}

impl DeliveryExecutor {
    pub fn new(transport: Arc<dyn TransportPort>, settings: ExecutorSettings) -> Self {
        Self {
            transport,
            settings,
            limiters: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for(&self, destination: ChannelId) -> Arc<Mutex<SpacingLimiter>> {
        let mut map = self.limiters.lock().await;
        map.entry(destination.0)
            .or_insert_with(|| {
                Arc::new(Mutex::new(SpacingLimiter::new(
                    self.settings.max_ops_per_second,
                )))
            })
            .clone()
    }

    async fn breaker_for(&self, destination: ChannelId) -> Arc<Mutex<CircuitBreaker>> {
        let mut map = self.breakers.lock().await;
        map.entry(destination.0)
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(
                    self.settings.failure_threshold,
                    self.settings.recovery_timeout,
                )))
            })
            .clone()
    }

    /// Perform one logical delivery (single event or whole group).
    pub async fn deliver(
        &self,
        destination: ChannelId,
        unit: &ReleasedUnit,
    ) -> std::result::Result<EventId, DeliveryError> {
        let breaker = self.breaker_for(destination).await;
        let limiter = self.limiter_for(destination).await;

        let deadline = Instant::now() + self.settings.deadline;
        let mut attempts: u32 = 0;
        // Set while this call holds the circuit's single half-open trial slot.
        let mut probing = false;

        loop {
            if !probing {
                let mut b = breaker.lock().await;
                if !b.try_acquire() {
                    return Err(DeliveryError::ChannelUnavailable);
                }
                probing = b.state() == CircuitState::HalfOpen;
            }

            let wait = { limiter.lock().await.reserve() };
            if !wait.is_zero() {
                sleep(wait).await;
            }

            match self.transport.deliver(destination, unit).await {
                Ok(forwarded) => {
                    breaker.lock().await.record_success();
                    return Ok(forwarded);
                }
                Err(DeliveryError::RateLimited { wait }) => {
                    // Explicit flow control from the upstream, not a channel
                    // failure: the breaker is untouched and the transient
                    // retry budget is not consumed.
                    let pause = wait + rate_limit_jitter();
                    println!(
                        "[EXEC] rate limited by destination {}, pausing {pause:?}",
                        destination.0
                    );
                    sleep(pause).await;
                    if Instant::now() >= deadline {
                        return Err(DeliveryError::RetryExhausted { attempts });
                    }
                }
                Err(DeliveryError::Transient { reason }) => {
                    {
                        let mut b = breaker.lock().await;
                        b.record_failure();
                        probing = false;
                    }
                    attempts += 1;
                    if attempts >= self.settings.max_attempts {
                        return Err(DeliveryError::RetryExhausted { attempts });
                    }
                    let delay = proportional_jitter(self.settings.backoff_delay(attempts - 1));
                    if Instant::now() + delay >= deadline {
                        return Err(DeliveryError::RetryExhausted { attempts });
                    }
                    println!(
                        "[EXEC] transient failure on destination {} (attempt {attempts}): {reason}; retrying in {delay:?}",
                        destination.0
                    );
                    sleep(delay).await;
                }
                Err(err @ DeliveryError::Permanent { .. }) => {
                    breaker.lock().await.record_failure();
                    return Err(err);
                }
                // Transports never produce these, but route them out rather
                // than loop on them.
                Err(other) => return Err(other),
            }
        }
    }
}

/// 1–5 s of extra pause on top of an explicit rate-limit wait.
fn rate_limit_jitter() -> Duration {
    Duration::from_secs_f64(1.0 + 4.0 * jitter_unit())
}

/// Up to +25% on a backoff delay, so retries from parallel workers spread out.
fn proportional_jitter(delay: Duration) -> Duration {
    delay.mul_f64(1.0 + 0.25 * jitter_unit())
}

fn jitter_unit() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1_000_000) / 1_000_000.0
}
