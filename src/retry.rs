//! Retry executor: bounded exponential backoff with optional jitter.
//!
//! Wraps a single failable operation, not a whole pipeline. The loop stops
//! as soon as the operation succeeds, the error is non-retryable per the
//! predicate, the attempt budget is spent, or the shutdown signal fires —
//! in which case the cancellation error is returned, not the last
//! operation error.

use crate::error::BridgeError;
use crate::shutdown::Shutdown;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters, loaded from the `retry` config section.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    /// Perturb each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Backoff before attempt `n + 1`, where `n` is 1-based and counts the
    /// attempts already made. Capped at `max_backoff`, before jitter.
    fn base_delay(&self, n: u32) -> Duration {
        let exp = self.multiplier.powi(n.saturating_sub(1) as i32);
        let raw = self.initial_backoff.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.max_backoff.as_secs_f64()))
    }

    fn delay(&self, n: u32) -> Duration {
        let base = self.base_delay(n);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

/// Run `op` under `policy`, retrying errors the default predicate
/// ([`BridgeError::retryable`]) accepts.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    op_name: &str,
    op: F,
) -> Result<T, BridgeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    retry_if(policy, shutdown, op_name, BridgeError::retryable, op).await
}

/// Run `op` under `policy`, retrying only errors `predicate` accepts.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    op_name: &str,
    predicate: P,
    mut op: F,
) -> Result<T, BridgeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
    P: Fn(&BridgeError) -> bool,
{
    let mut shutdown = shutdown.clone();
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_raised() {
            return Err(BridgeError::Cancelled);
        }
        attempt += 1;
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !predicate(&e) => {
                debug!(op = op_name, attempt, error = %e, "not retryable, giving up");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(op = op_name, attempt, error = %e, "retry budget exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                debug!(op = op_name, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::select! {
                    biased;
                    _ = shutdown.raised() => return Err(BridgeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
