// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Retry policy used when (re)connecting sessions and walking discovery hops.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{OpcUaError, OpcUaResult};
use crate::types::humantime_serde;

// =============================================================================
// RetryStrategy
// =============================================================================

/// Strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry immediately.
    None,

    /// Fixed delay between retries.
    Fixed,

    /// Linear backoff (delay * attempt).
    Linear,

    /// Exponential backoff (delay * 2^attempt).
    #[default]
    Exponential,
}

impl RetryStrategy {
    /// Calculates the delay before retry number `attempt` (0-based).
    pub fn delay(&self, base_delay: Duration, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed => base_delay,
            Self::Linear => base_delay.saturating_mul(attempt + 1),
            Self::Exponential => base_delay.saturating_mul(2u32.saturating_pow(attempt)),
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::Fixed => "Fixed",
            Self::Linear => "Linear",
            Self::Exponential => "Exponential",
        })
    }
}

// =============================================================================
// RetryConfig
// =============================================================================

/// Retry behavior for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay between attempts.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Retry strategy.
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: RetryStrategy::Exponential,
        }
    }
}

impl RetryConfig {
    /// Creates a configuration that retries immediately, without backoff.
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: RetryStrategy::None,
        }
    }

    /// Sets the number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the retry strategy.
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Calculates the delay for a given attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.strategy
            .delay(self.base_delay, attempt)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    ///
    /// The closure receives the 0-based attempt number. The last error is
    /// returned together with the number of attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, (OpcUaError, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = OpcUaResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err((OpcUaError::cancelled("retry"), attempt));
            }

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt += 1;

            if attempt >= attempts || !error.is_retryable() {
                return Err((error, attempt));
            }

            let delay = self.delay_for_attempt(attempt - 1);
            tracing::debug!(
                attempt = attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying operation"
            );

            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err((OpcUaError::cancelled("retry"), attempt));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_strategy_delays() {
        let base = Duration::from_millis(100);
        assert_eq!(RetryStrategy::None.delay(base, 3), Duration::ZERO);
        assert_eq!(RetryStrategy::Fixed.delay(base, 5), base);
        assert_eq!(RetryStrategy::Linear.delay(base, 2), Duration::from_millis(300));
        assert_eq!(
            RetryStrategy::Exponential.delay(base, 3),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig::default().with_base_delay(Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::no_backoff(3);

        let result = config
            .run(&CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OpcUaError::transport("reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let config = RetryConfig::no_backoff(3);
        let result: Result<(), _> = config
            .run(&CancellationToken::new(), |_| async {
                Err(OpcUaError::transport("reset"))
            })
            .await;

        let (error, attempts) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_run_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryConfig::no_backoff(5)
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(OpcUaError::configuration(ConfigurationError::missing_field(
                        "url",
                    )))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = RetryConfig::default()
            .run(&cancel, |_| async { Ok(()) })
            .await;

        assert!(result.unwrap_err().0.is_cancelled());
    }
}
