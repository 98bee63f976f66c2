use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::{AutoCancelError, Result};
use crate::store::StoreResult;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Re-runs an operation from scratch while it fails on stale row versions.
///
/// The operation receives the 1-based attempt number and must recompute
/// everything it reads on every call. Only
/// [`StoreError::StaleObject`](crate::store::StoreError::StaleObject) is
/// retried; other errors end the loop immediately.
#[derive(Debug, Clone)]
pub struct OptimisticLock {
    name: &'static str,
    max_attempts: u32,
    backoff: Duration,
}

impl OptimisticLock {
    pub fn new(name: &'static str, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            name,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay after the given failed attempt: exponential, capped at one second.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Returns the operation's value and the number of attempts it took.
    pub async fn retry<T, F>(&self, mut operation: F) -> Result<(T, u32)>
    where
        F: FnMut(u32) -> StoreResult<T>,
    {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            "Optimistic lock '{}' released after {} retries in {:.3}s",
                            self.name,
                            attempt - 1,
                            started.elapsed().as_secs_f64()
                        );
                    }
                    return Ok((value, attempt));
                }
                Err(e) if e.is_conflict() => {
                    if attempt >= self.max_attempts {
                        return Err(AutoCancelError::LockRetriesExhausted {
                            name: self.name,
                            attempts: attempt,
                        });
                    }

                    let delay = self.backoff_for(attempt);
                    warn!(
                        "Optimistic lock '{}' conflict ({}), retrying in {:?} ({}/{})...",
                        self.name, e, delay, attempt, self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
