//! Retry and backoff utilities for storage and runtime calls
//!
//! Bounded exponential backoff with jitter. Callers classify each error as
//! retryable or terminal; the attempt budget is always capped.

use crate::config::duration_ms;
use crate::errors::StorageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Jitter strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JitterStrategy {
    /// Random delay between 0 and the computed delay
    #[default]
    FullJitter,
    /// Half the computed delay plus a random half
    EqualJitter,
}

/// Retry budget and backoff shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: JitterStrategy,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// No retries at all; used by tests that inject permanent failures
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        self.apply_jitter(capped, &mut fastrand::Rng::new())
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u128.checked_pow(attempt).unwrap_or(u128::MAX);
        let exponential = self.base_delay.as_millis().saturating_mul(factor);
        let capped = exponential.min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    fn apply_jitter(&self, delay: Duration, rng: &mut fastrand::Rng) -> Duration {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self.jitter {
            JitterStrategy::FullJitter => Duration::from_millis(rng.u64(0..=delay_ms)),
            JitterStrategy::EqualJitter => {
                let half = delay_ms / 2;
                Duration::from_millis(half + rng.u64(0..=half))
            }
        }
    }

    #[cfg(test)]
    fn calculate_delay_seeded(&self, attempt: u32, seed: u64) -> Duration {
        let capped = self.capped_delay(attempt);
        self.apply_jitter(capped, &mut fastrand::Rng::with_seed(seed))
    }
}

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
}

/// Error classifier function type
pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Retries every error
pub fn default_classifier<E>(_error: &E) -> RetryDecision {
    RetryDecision::Retry
}

/// Retries only transient storage failures
pub fn storage_classifier(error: &StorageError) -> RetryDecision {
    if error.is_transient() {
        RetryDecision::Retry
    } else {
        RetryDecision::Stop
    }
}

/// Run `operation` until it succeeds, the classifier stops it, or the budget runs out
#[instrument(level = "debug", skip(operation, classify_error))]
pub async fn retry_async<T, E, Fut, Op>(
    config: &RetryConfig,
    mut operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded on attempt {}", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if classify_error(&error) == RetryDecision::Stop {
                    debug!("Terminal error, not retrying: {:?}", error);
                    return Err(error);
                }
                if attempt >= config.max_attempts {
                    warn!(
                        "All {} attempts exhausted, final error: {:?}",
                        attempt + 1,
                        error
                    );
                    return Err(error);
                }
                let delay = config.calculate_delay(attempt);
                debug!(
                    "Attempt {} failed ({:?}), retrying in {:?}",
                    attempt, error, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: JitterStrategy::FullJitter,
        }
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: JitterStrategy::FullJitter,
        };
        assert!(config.calculate_delay_seeded(0, 7) <= Duration::from_millis(100));
        assert!(config.calculate_delay_seeded(2, 7) <= Duration::from_millis(400));
        assert!(config.calculate_delay_seeded(40, 7) <= Duration::from_millis(500));
        assert_eq!(
            config.calculate_delay_seeded(3, 42),
            config.calculate_delay_seeded(3, 42)
        );
    }

    #[test]
    fn test_equal_jitter_lower_bound() {
        let config = RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter: JitterStrategy::EqualJitter,
        };
        let delay = config.calculate_delay_seeded(0, 12345);
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1000));
    }

    #[test]
    fn test_storage_classifier() {
        let transient = StorageError::Transient {
            message: "throttled".to_string(),
        };
        let terminal = StorageError::InvalidKey {
            key: "/etc/passwd".to_string(),
        };
        assert_eq!(storage_classifier(&transient), RetryDecision::Retry);
        assert_eq!(storage_classifier(&terminal), RetryDecision::Stop);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_async(
            &fast_config(3),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("blip")
                    } else {
                        Ok(7)
                    }
                }
            },
            default_classifier,
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: std::result::Result<(), &str> = retry_async(
            &fast_config(2),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            },
            default_classifier,
        )
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_terminal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: std::result::Result<(), StorageError> = retry_async(
            &fast_config(5),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::InvalidKey {
                        key: "..".to_string(),
                    })
                }
            },
            storage_classifier,
        )
        .await;
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_toml_roundtrip() {
        let config: RetryConfig =
            toml::from_str("max_attempts = 5\nbase_delay_ms = 250\njitter = \"equal-jitter\"")
                .unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, RetryConfig::default().max_delay);
        assert_eq!(config.jitter, JitterStrategy::EqualJitter);
    }
}
