// File: tabsync/src/retry.rs
// Purpose: Linear backoff for call sites that need resilience

use std::future::Future;
use std::time::Duration;

/// The last error after every attempt failed
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    /// Retries made after the first attempt
    pub retries: u32,
}

/// Run `op`, retrying up to `max_retries` times. Retry `n` waits `n * unit`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_retries: u32,
    unit: Duration,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retries = 0;
    loop {
        match op(retries).await {
            Ok(value) => return Ok(value),
            Err(error) if retries >= max_retries => {
                return Err(RetryFailure { error, retries });
            }
            Err(error) => {
                retries += 1;
                let delay = unit * retries;
                tracing::warn!(
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
