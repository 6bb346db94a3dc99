//! Capped exponential backoff for load-balancer backend mutations.
//!
//! Backend add/remove calls hit work-request plumbing that throttles under
//! load; the policy is 5 attempts with 500ms → 8s delays. Idempotent
//! notices ("already exists" on add, "not found" on remove) short-circuit
//! to success at the call site, not here.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{CloudError, CloudResult};

/// Maximum attempts per backend mutation.
pub const MAX_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(8);

/// Delay before the given 1-based attempt: 500ms, 1s, 2s, 4s, 8s, 8s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let mut delay = BASE_DELAY;
    for _ in 1..attempt {
        delay *= 2;
        if delay >= MAX_DELAY {
            return MAX_DELAY;
        }
    }
    delay
}

/// Run `op` up to [`MAX_ATTEMPTS`] times, sleeping [`backoff_delay`]
/// between attempts while the error stays transient. Terminal errors and
/// idempotent notices surface immediately.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> CloudResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CloudResult<T>>,
{
    let mut last_err = CloudError::Failed(format!("{label} failed after retries"));
    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(out) => return Ok(out),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(%label, attempt, error = %err, delay_ms = delay.as_millis() as u64, "transient cloud error, backing off");
                last_err = err;
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}
