use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::Result;

/// Waits between attempts. Swappable, so retries can be tested without
/// actually waiting.
#[async_trait::async_trait]
pub trait Delay: Send + Sync {
    async fn delay(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait::async_trait]
impl Delay for TokioDelay {
    async fn delay(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Runs an operation up to `max_attempts` times, with a fixed delay in
/// between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.delay(),
        }
    }
}

impl RetryPolicy {
    /// Calls `op` with the 1-based attempt number until it succeeds, returning
    /// the last error once all attempts failed.
    pub async fn run<T, F, Fut>(&self, delay: &dyn Delay, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    tracing::error!(attempt, error = %err, "attempt failed, retrying");
                    delay.delay(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
