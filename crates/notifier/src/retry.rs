//! Fixed-delay retry for channel deliveries.

use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_permanent(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Result of a retried operation plus the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Longest time `run` can take when every attempt uses up `per_attempt`.
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        per_attempt * attempts + self.delay * (attempts - 1)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Attempted<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match op().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) if err.is_permanent() || attempts >= max_attempts => {
                    return Attempted {
                        result: Err(err),
                        attempts,
                    };
                }
                Err(err) => {
                    tracing::debug!(
                        attempt = attempts,
                        max_attempts,
                        error = %err,
                        "Delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
