// =============================================================================
// Retry Policy — bounded retries with exponential backoff
// =============================================================================
//
// Wraps a fallible remote call. On failure the call is retried up to
// `max_retries` additional times, sleeping `base_delay * 2^attempt` between
// attempts; after exhaustion the last error is returned to the caller, never
// swallowed. The policy belongs at the remote-call boundary only — pure local
// computation is never retried.
//
// Every error class gets the same backoff. A permanently invalid request is
// retried exactly like a timeout; see DESIGN.md before narrowing this.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Run `f`, retrying with exponential backoff. `op` names the operation
    /// in log output.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote call failed — backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        op,
                        attempts = self.max_retries + 1,
                        error = %err,
                        "remote call failed — retries exhausted"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Sleep before retry number `attempt + 1` (attempt counted from 0).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(31))
    }
}
