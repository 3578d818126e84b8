//! Cooldown-throttled failure notifications.
//!
//! Terminal delivery failures page the admin user, but a failing destination
//! fails for every event; without a throttle the admin gets one message per
//! dropped event. One notification per (user, failure category) per cooldown.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    domain::UserId,
    errors::ErrorCategory,
    ports::NotifierPort,
    Result,
};

/// Decides whether a notification may go out now.
pub struct NotifyThrottle {
    cooldown: Duration,
    last: Mutex<HashMap<(UserId, ErrorCategory), Instant>>,
}

impl NotifyThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, user: UserId, category: ErrorCategory) -> bool {
        self.allow_at(user, category, Instant::now()).await
    }

    pub async fn allow_at(&self, user: UserId, category: ErrorCategory, now: Instant) -> bool {
        let mut last = self.last.lock().await;
        match last.get(&(user, category)) {
            Some(&sent) if now.duration_since(sent) < self.cooldown => false,
            _ => {
                last.insert((user, category), now);
                true
            }
        }
    }
}

/// Notifier decorator applying the throttle. Suppressed notifications are
/// counted as success; the underlying notifier is never called for them.
pub struct ThrottledNotifier {
    inner: Arc<dyn NotifierPort>,
    throttle: NotifyThrottle,
}

impl ThrottledNotifier {
    pub fn new(inner: Arc<dyn NotifierPort>, cooldown: Duration) -> Self {
        Self {
            inner,
            throttle: NotifyThrottle::new(cooldown),
        }
    }
}

#[async_trait]
impl NotifierPort for ThrottledNotifier {
    async fn notify(&self, user: UserId, category: ErrorCategory, details: &str) -> Result<()> {
        if !self.throttle.allow(user, category).await {
            println!(
                "[NOTIFY] suppressed {} notification for user {} (cooldown)",
                category.as_str(),
                user.0
            );
            return Ok(());
        }
        self.inner.notify(user, category, details).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingNotifier {
        sent: Mutex<Vec<(UserId, ErrorCategory)>>,
    }

    #[async_trait]
    impl NotifierPort for CountingNotifier {
        async fn notify(&self, user: UserId, category: ErrorCategory, _details: &str) -> Result<()> {
            self.sent.lock().await.push((user, category));
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_notification_within_cooldown_is_suppressed() {
        let throttle = NotifyThrottle::new(Duration::from_secs(300));
        let start = Instant::now();
        let user = UserId(7);

        assert!(
            throttle
                .allow_at(user, ErrorCategory::RetryExhausted, start)
                .await
        );
        assert!(
            !throttle
                .allow_at(
                    user,
                    ErrorCategory::RetryExhausted,
                    start + Duration::from_secs(299)
                )
                .await
        );
        assert!(
            throttle
                .allow_at(
                    user,
                    ErrorCategory::RetryExhausted,
                    start + Duration::from_secs(300)
                )
                .await
        );
    }

    #[tokio::test]
    async fn categories_throttle_independently() {
        let throttle = NotifyThrottle::new(Duration::from_secs(300));
        let now = Instant::now();
        let user = UserId(7);

        assert!(throttle.allow_at(user, ErrorCategory::Permanent, now).await);
        assert!(throttle.allow_at(user, ErrorCategory::CircuitOpen, now).await);
        assert!(!throttle.allow_at(user, ErrorCategory::Permanent, now).await);
    }

    #[tokio::test]
    async fn throttled_notifier_skips_inner_on_suppression() {
        let inner = Arc::new(CountingNotifier {
            sent: Mutex::new(Vec::new()),
        });
        let notifier = ThrottledNotifier::new(inner.clone(), Duration::from_secs(300));

        for _ in 0..3 {
            notifier
                .notify(UserId(1), ErrorCategory::Permanent, "boom")
                .await
                .unwrap();
        }
        assert_eq!(inner.sent.lock().await.len(), 1);
    }
}
