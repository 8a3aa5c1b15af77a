//! Bounded retry for venue calls: fixed attempt count, fixed delay.
//!
//! Only `ExchangeError::Transient` is retried. `observe` turns an exhausted
//! transient failure into "unknown" (`Ok(None)`) so a polling loop can
//! revisit the trade next tick instead of failing.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ExchangeError;

/// Retry policy for venue calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,

    /// Delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay.
    pub const fn none() -> Self {
        Self {
            attempts: 1,
            delay_ms: 0,
        }
    }
}

/// `Backoff` that yields the same delay until the attempt budget is spent.
#[derive(Debug)]
struct FixedAttempts {
    remaining_retries: u32,
    initial_retries: u32,
    delay: Duration,
}

impl FixedAttempts {
    fn new(policy: &RetryPolicy) -> Self {
        let retries = policy.attempts.saturating_sub(1);
        Self {
            remaining_retries: retries,
            initial_retries: retries,
            delay: Duration::from_millis(policy.delay_ms),
        }
    }
}

impl Backoff for FixedAttempts {
    fn reset(&mut self) {
        self.remaining_retries = self.initial_retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining_retries == 0 {
            return None;
        }
        self.remaining_retries -= 1;
        Some(self.delay)
    }
}

/// Run `op`, retrying transient failures per `policy`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    backoff::future::retry_notify(
        FixedAttempts::new(policy),
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |err: ExchangeError, wait: Duration| {
            warn!(call = what, error = %err, retry_in_ms = wait.as_millis() as u64, "Venue call failed, retrying");
        },
    )
    .await
}

/// Read venue state, mapping anything but a fatal error to "unknown".
pub async fn observe<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    op: F,
) -> Result<Option<T>, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    match with_retry(policy, what, op).await {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(call = what, error = %e, "Venue state unknown this tick");
            Ok(None)
        }
    }
}
