// =============================================================================
// Rate Limiter — minimum spacing between consecutive remote calls
// =============================================================================
//
// One limiter instance guards one class of operations (reads and order
// writes get separate instances with separate clocks). A caller that arrives
// before the interval has elapsed is parked on `tokio::time::sleep` until it
// has; calls are never dropped or reordered.
//
// The spacing check and the last-call update happen under a single
// tokio::sync::Mutex held across the pacing sleep, so concurrent callers
// serialise and each gets its own slot.
// =============================================================================

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter enforcing at most `calls_per_second` invocations.
    ///
    /// A non-positive rate disables spacing entirely.
    pub fn new(calls_per_second: f64) -> Self {
        let min_interval = if calls_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / calls_per_second)
        } else {
            Duration::ZERO
        };

        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Block the calling task until the spacing interval has elapsed since
    /// the previous acquire, then claim the new slot.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;

        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.min_interval {
                let wait = self.min_interval - since;
                trace!(wait_ms = wait.as_millis() as u64, "rate limiter pacing");
                tokio::time::sleep(wait).await;
            }
        }

        *last = Some(Instant::now());
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("min_interval", &self.min_interval)
            .finish()
    }
}
