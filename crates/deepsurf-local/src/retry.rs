//! Retry and timeout wrappers for external calls.

use deepsurf_core::{Error, Result, RetryPolicy};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `fut` with a hard deadline; an elapsed deadline becomes [`Error::Timeout`].
pub async fn with_timeout<T, F>(timeout_ms: u64, label: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(r) => r,
        Err(_) => Err(Error::Timeout(format!("{label} after {timeout_ms}ms"))),
    }
}

fn jitter(policy: &RetryPolicy) -> Duration {
    let half = policy.base_delay_ms / 2;
    if half == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=half))
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy runs out.
///
/// `op` receives the 0-based attempt number. Cancellation is checked before each attempt and
/// while waiting out a backoff.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = op(attempt) => r,
        };
        let err = match res {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !err.is_transient() || attempt + 1 >= attempts {
            return Err(err);
        }
        let delay = policy.backoff(attempt) + jitter(policy);
        tracing::warn!(
            op = label,
            attempt = attempt + 1,
            of = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
