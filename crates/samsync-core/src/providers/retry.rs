//! Retry and throttling for provider calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::error::{Result, SyncError};

/// Upper bound on a provider supplied `Retry-After`.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Bounded retry budget shared by transient and rate-limit failures.
///
/// A call is attempted at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wait applied to a 429 without a usable `Retry-After`.
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given retry number (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    fn wait_for(&self, err: &SyncError, retry: u32) -> Duration {
        match err {
            SyncError::RateLimited { retry_after } => retry_after
                .map(|d| std::cmp::min(d, MAX_RATE_LIMIT_WAIT))
                .unwrap_or(self.rate_limit_cooldown),
            _ => self.backoff(retry),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retries < policy.max_retries => {
                let wait = policy.wait_for(&err, retries);
                warn!(
                    "[{}] {}. Retrying in {:?} (attempt {}/{})",
                    label,
                    err,
                    wait,
                    retries + 1,
                    policy.max_retries
                );
                sleep(wait).await;
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Global request pacing: a minimum gap between request starts and a
/// small window of requests in flight. Clones share state.
#[derive(Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_start: Arc<Mutex<Option<Instant>>>,
    in_flight: Arc<Semaphore>,
}

impl Throttle {
    pub fn new(min_interval: Duration, max_in_flight: usize) -> Self {
        Self {
            min_interval,
            last_start: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Wait for a slot. The request may start once this returns and must
    /// hold the permit until its response is consumed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Unavailable("request throttle closed".to_string()))?;

        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
        Ok(permit)
    }
}
