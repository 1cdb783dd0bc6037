//! Bounded polling with backoff.
//!
//! Every wait in the commissioner (task completion, guest tools, guest shutdown, guest IP) is an
//! instance of the same loop: run an observation, check a predicate, sleep, repeat until the
//! predicate holds or the attempts run out.

use std::{thread, time::Duration};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// How long to sleep between attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "kind")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,

    /// Sleep the same amount after every attempt.
    Fixed { delay_ms: u64 },

    /// Sleep `initial_ms` after the first attempt, growing by `step_ms` after each further one.
    Linear { initial_ms: u64, step_ms: u64 },
}

impl Backoff {
    /// Delay after the given 1-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Linear {
                initial_ms,
                step_ms,
            } => Duration::from_millis(
                initial_ms.saturating_add(step_ms.saturating_mul(attempt.saturating_sub(1) as u64)),
            ),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of attempts. Zero is treated as one.
    pub attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Backoff) -> Self {
        Self { attempts, backoff }
    }

    pub const fn linear(attempts: u32, initial_ms: u64, step_ms: u64) -> Self {
        Self::new(
            attempts,
            Backoff::Linear {
                initial_ms,
                step_ms,
            },
        )
    }

    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Result of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The predicate held for `value`.
    Satisfied { value: T, attempts: u32 },

    /// The attempts ran out; `last` is the final observation.
    Exhausted { last: T, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, RetryOutcome::Satisfied { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Satisfied { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Runs `operation` until `done` accepts its value or the policy's attempts are used up.
///
/// Errors returned by `operation` abort the loop immediately. The operation receives the 1-based
/// attempt number.
pub fn retry_until<T, E, F, P>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: F,
    mut done: P,
) -> Result<RetryOutcome<T>, E>
where
    F: FnMut(u32) -> Result<T, E>,
    P: FnMut(&T) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let value = operation(attempt)?;
        if done(&value) {
            trace!("'{name}' satisfied after {attempt} attempt(s)");
            return Ok(RetryOutcome::Satisfied {
                value,
                attempts: attempt,
            });
        }

        if attempt >= max_attempts {
            debug!("'{name}' not satisfied after {attempt} attempt(s)");
            return Ok(RetryOutcome::Exhausted {
                last: value,
                attempts: attempt,
            });
        }

        let delay = policy.backoff.delay(attempt);
        trace!("'{name}' attempt {attempt} not satisfied, sleeping {delay:?}");
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}
