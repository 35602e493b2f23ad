//! Fixed-interval retry used by every registry bring-up path.
//!
//! # Invariants
//! - The operation runs at least once, even when `attempts` is configured as `0`.
//! - The delay is constant between attempts: no backoff, no jitter.
//! - No sleep happens after the final attempt.

use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::thread;
use std::time::Duration;

const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_DELAY: Duration = Duration::from_secs(3);

/// Fixed attempt count and fixed inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub attempts: u32,
    /// Pause between two consecutive attempts.
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Attempt count actually used by [`retry`].
    pub fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Upper bound on time spent sleeping between attempts. Saturates at [`Duration::MAX`].
    pub fn worst_case_delay(&self) -> Duration {
        self.delay.saturating_mul(self.effective_attempts() - 1)
    }
}

/// Returned when every attempt failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E: Display> Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gave up after {} attempt(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: Error + 'static> Error for RetryExhausted<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// `operation` receives the 1-based attempt number. `label` only feeds log lines.
pub fn retry<T, E, F>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    E: Display,
{
    let attempts = policy.effective_attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        "event=retry module=registry status=ok target={} attempt={}/{}",
                        label, attempt, attempts
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                error!(
                    "event=retry module=registry status=error target={} attempt={}/{} error={}",
                    label, attempt, attempts, err
                );
                if attempt >= attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
            }
        }

        thread::sleep(policy.delay);
        attempt += 1;
    }
}

mod duration_ms {
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).map_err(S::Error::custom)?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
