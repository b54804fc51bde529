//! Core limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{LoginGuardError, Result};
use crate::store::{Counter, CounterStore, StoreError, StoreResult};

/// Points consumed by one attempt.
const POINTS_PER_ATTEMPT: u64 = 1;

/// Configuration for a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Points that may be consumed before the key is blocked
    pub points: u64,
    /// Window in which points accumulate, in seconds
    pub duration_secs: u64,
    /// How long an exhausted key stays blocked, in seconds.
    /// Zero keeps the remainder of the window as the block.
    #[serde(default)]
    pub block_duration_secs: u64,
    /// Namespace for this limiter's keys in the counter store
    pub key_prefix: String,
}

impl LimiterConfig {
    pub fn new(points: u64, duration_secs: u64, block_duration_secs: u64, key_prefix: &str) -> Self {
        Self {
            points,
            duration_secs,
            block_duration_secs,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Reject parameters that would make the limiter meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.points == 0 {
            return Err(LoginGuardError::Config(format!(
                "limiter '{}': points must be positive",
                self.key_prefix
            )));
        }
        if self.duration_secs == 0 {
            return Err(LoginGuardError::Config(format!(
                "limiter '{}': duration_secs must be positive",
                self.key_prefix
            )));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(LoginGuardError::Config(
                "limiter key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn block_duration(&self) -> Option<Duration> {
        (self.block_duration_secs > 0).then(|| Duration::from_secs(self.block_duration_secs))
    }
}

/// State of a key after a consume or a peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Points consumed in the current window
    pub consumed_points: u64,
    /// Points left before the key is exhausted
    pub remaining_points: u64,
    /// Milliseconds until the counter expires
    pub ms_before_next: u64,
}

impl RateLimitResult {
    /// Whole seconds a caller should wait, rounded up, never below one.
    pub fn retry_after_secs(&self) -> u64 {
        self.ms_before_next.div_ceil(1000).max(1)
    }
}

/// A limiter over a shared counter store.
///
/// The counter's own expiry is both the accumulation window and the block
/// timer: when a consume exhausts the budget the expiry is replaced by the
/// block duration, so no second timestamp is stored.
pub struct Limiter {
    /// Name used in logs
    name: String,
    config: LimiterConfig,
    store: Arc<dyn CounterStore>,
    /// Upper bound on every store call
    timeout: Duration,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("backend", &self.store.backend_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Limiter {
    /// Create a limiter, validating its configuration.
    pub fn new(
        name: &str,
        config: LimiterConfig,
        store: Arc<dyn CounterStore>,
        timeout: Duration,
    ) -> Result<Self> {
        config.validate()?;
        if timeout.is_zero() {
            return Err(LoginGuardError::Config(format!(
                "limiter '{name}': store timeout must be positive"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            config,
            store,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Consume one point for `key`.
    pub async fn consume(&self, key: &str) -> StoreResult<RateLimitResult> {
        let store_key = self.store_key(key);
        let counter = self
            .bounded(self.store.consume(&store_key, POINTS_PER_ATTEMPT, self.config.duration()))
            .await?;
        let mut result = self.to_result(counter);

        let previous = counter.points.saturating_sub(POINTS_PER_ATTEMPT);
        let just_exhausted = counter.points >= self.config.points && previous < self.config.points;

        if just_exhausted {
            if let Some(block_duration) = self.config.block_duration() {
                if let Some(blocked) = self.bounded(self.store.block(&store_key, block_duration)).await? {
                    result = self.to_result(blocked);
                }
            }
            warn!(
                limiter = %self.name,
                key = %key,
                points = counter.points,
                block_ms = result.ms_before_next,
                "Limiter exhausted, key blocked"
            );
        } else {
            trace!(
                limiter = %self.name,
                key = %key,
                consumed = result.consumed_points,
                remaining = result.remaining_points,
                "Consumed point"
            );
        }

        Ok(result)
    }

    /// Read the state of `key` without consuming.
    pub async fn peek(&self, key: &str) -> StoreResult<Option<RateLimitResult>> {
        let counter = self.bounded(self.store.get(&self.store_key(key))).await?;
        Ok(counter.map(|c| self.to_result(c)))
    }

    /// Forget every point consumed for `key`.
    pub async fn reset(&self, key: &str) -> StoreResult<()> {
        self.bounded(self.store.delete(&self.store_key(key))).await?;
        debug!(limiter = %self.name, key = %key, "Limiter reset");
        Ok(())
    }

    /// Whether a consume went past the budget.
    pub fn is_blocked(&self, result: &RateLimitResult) -> bool {
        result.consumed_points > self.config.points
    }

    /// Whether the budget is used up, so the next consume would be blocked.
    pub fn is_exhausted(&self, result: &RateLimitResult) -> bool {
        result.consumed_points >= self.config.points
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    fn to_result(&self, counter: Counter) -> RateLimitResult {
        RateLimitResult {
            consumed_points: counter.points,
            remaining_points: self.config.points.saturating_sub(counter.points),
            ms_before_next: counter.ttl.as_millis() as u64,
        }
    }

    async fn bounded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                backend: self.store.backend_name(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;
    use async_trait::async_trait;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn limiter(points: u64, block_secs: u64) -> Limiter {
        let config = LimiterConfig::new(points, 60, block_secs, "test");
        Limiter::new("test", config, Arc::new(MemoryCounterStore::new()), TIMEOUT).unwrap()
    }

    /// A store whose calls never complete.
    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn consume(&self, _key: &str, _points: u64, _ttl: Duration) -> StoreResult<Counter> {
            futures::future::pending().await
        }
        async fn get(&self, _key: &str) -> StoreResult<Option<Counter>> {
            futures::future::pending().await
        }
        async fn delete(&self, _key: &str) -> StoreResult<()> {
            futures::future::pending().await
        }
        async fn block(&self, _key: &str, _ttl: Duration) -> StoreResult<Option<Counter>> {
            futures::future::pending().await
        }
        fn backend_name(&self) -> &'static str {
            "hanging"
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(LimiterConfig::new(5, 60, 0, "ok").validate().is_ok());
        assert!(matches!(
            LimiterConfig::new(0, 60, 0, "p").validate(),
            Err(LoginGuardError::Config(_))
        ));
        assert!(matches!(
            LimiterConfig::new(5, 0, 0, "d").validate(),
            Err(LoginGuardError::Config(_))
        ));
        assert!(matches!(
            LimiterConfig::new(5, 60, 0, " ").validate(),
            Err(LoginGuardError::Config(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = LimiterConfig::new(5, 60, 0, "test");
        let result = Limiter::new("test", config, Arc::new(MemoryCounterStore::new()), Duration::ZERO);
        assert!(matches!(result, Err(LoginGuardError::Config(_))));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let result = |ms| RateLimitResult {
            consumed_points: 1,
            remaining_points: 0,
            ms_before_next: ms,
        };
        assert_eq!(result(0).retry_after_secs(), 1);
        assert_eq!(result(1).retry_after_secs(), 1);
        assert_eq!(result(1000).retry_after_secs(), 1);
        assert_eq!(result(1001).retry_after_secs(), 2);
        assert_eq!(result(3_600_000).retry_after_secs(), 3600);
    }

    #[tokio::test]
    async fn test_consume_within_limit() {
        let limiter = limiter(10, 0);

        let result = limiter.consume("k").await.unwrap();
        assert_eq!(result.consumed_points, 1);
        assert_eq!(result.remaining_points, 9);
        assert!(result.ms_before_next > 0);
        assert!(!limiter.is_blocked(&result));
        assert!(!limiter.is_exhausted(&result));
    }

    #[tokio::test]
    async fn test_blocked_only_after_points_consumed() {
        let limiter = limiter(5, 0);

        for i in 1..=5 {
            let result = limiter.consume("k").await.unwrap();
            assert!(!limiter.is_blocked(&result), "Consume {} should not block", i);
        }

        let result = limiter.consume("k").await.unwrap();
        assert!(limiter.is_blocked(&result));
        assert!(result.ms_before_next > 0);
        assert_eq!(result.remaining_points, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_applies_block_duration() {
        let limiter = limiter(3, 3600);

        limiter.consume("k").await.unwrap();
        let second = limiter.consume("k").await.unwrap();
        assert_eq!(second.ms_before_next, 60_000);

        let third = limiter.consume("k").await.unwrap();
        assert!(limiter.is_exhausted(&third));
        assert_eq!(third.ms_before_next, 3_600_000);

        // Further consumes do not extend the block
        tokio::time::advance(Duration::from_secs(100)).await;
        let fourth = limiter.consume("k").await.unwrap();
        assert!(limiter.is_blocked(&fourth));
        assert_eq!(fourth.ms_before_next, 3_500_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires_with_counter() {
        let limiter = limiter(1, 120);

        limiter.consume("k").await.unwrap();
        tokio::time::advance(Duration::from_secs(121)).await;

        assert_eq!(limiter.peek("k").await.unwrap(), None);
        let result = limiter.consume("k").await.unwrap();
        assert_eq!(result.consumed_points, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let limiter = limiter(5, 0);

        assert_eq!(limiter.peek("k").await.unwrap(), None);
        limiter.consume("k").await.unwrap();

        let first = limiter.peek("k").await.unwrap().unwrap();
        let second = limiter.peek("k").await.unwrap().unwrap();
        assert_eq!(first.consumed_points, 1);
        assert_eq!(second.consumed_points, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_key() {
        let limiter = limiter(5, 0);

        limiter.consume("k").await.unwrap();
        limiter.consume("k").await.unwrap();
        limiter.reset("k").await.unwrap();

        assert_eq!(limiter.peek("k").await.unwrap(), None);
        assert_eq!(limiter.consume("k").await.unwrap().consumed_points, 1);
    }

    #[tokio::test]
    async fn test_limiters_sharing_a_store_have_separate_keys() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let a = Limiter::new("a", LimiterConfig::new(5, 60, 0, "a"), store.clone(), TIMEOUT).unwrap();
        let b = Limiter::new("b", LimiterConfig::new(5, 60, 0, "b"), store, TIMEOUT).unwrap();

        a.consume("k").await.unwrap();
        a.consume("k").await.unwrap();
        b.consume("k").await.unwrap();

        assert_eq!(a.peek("k").await.unwrap().unwrap().consumed_points, 2);
        assert_eq!(b.peek("k").await.unwrap().unwrap().consumed_points, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_is_reported() {
        let config = LimiterConfig::new(5, 60, 0, "test");
        let limiter = Limiter::new("test", config, Arc::new(HangingStore), TIMEOUT).unwrap();

        let error = limiter.consume("k").await.unwrap_err();
        assert!(matches!(
            error,
            StoreError::Timeout {
                backend: "hanging",
                timeout_ms: 500
            }
        ));
        assert!(limiter.peek("k").await.is_err());
        assert!(limiter.reset("k").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumes_are_counted_exactly() {
        let config = LimiterConfig::new(10_000, 60, 0, "test");
        let limiter = Arc::new(
            Limiter::new("test", config, Arc::new(MemoryCounterStore::new()), TIMEOUT).unwrap(),
        );

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        limiter.consume("k").await.unwrap();
                    }
                })
            })
            .collect();
        for joined in futures::future::join_all(handles).await {
            joined.unwrap();
        }

        assert_eq!(limiter.peek("k").await.unwrap().unwrap().consumed_points, 1000);
    }
}
