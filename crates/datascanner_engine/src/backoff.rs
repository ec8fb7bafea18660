//! Exponential backoff for transient backend failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Retry policy, and the running attempt count when it is carried from one
/// call to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffParams {
    /// Failures already seen.
    pub count: u32,
    pub max_tries: u32,
    /// Exponent cap for the delay.
    pub ceiling: u32,
    /// Delay unit in seconds.
    pub base_secs: f64,
    /// Start logging warnings once this many failures have happened. Zero
    /// disables warnings.
    pub warn_after: u32,
    /// Add a uniformly random extra delay of up to one delay unit.
    pub jitter: bool,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            count: 0,
            max_tries: 10,
            ceiling: 6,
            base_secs: 1.0,
            warn_after: 6,
            jitter: false,
        }
    }
}

impl BackoffParams {
    /// Delay before the attempt following `count` failures.
    pub fn delay(&self, count: u32) -> Duration {
        if count == 0 {
            return Duration::ZERO;
        }
        let exponent = count.min(self.ceiling).saturating_sub(1);
        let base = self.base_secs.max(0.01);
        let delay = base * f64::from(2u32.saturating_pow(exponent));
        let jitter = if self.jitter {
            rand::thread_rng().gen_range(0.0..delay)
        } else {
            0.0
        };
        Duration::from_secs_f64(delay + jitter)
    }
}

/// Runs `op` until it succeeds, retrying with exponential backoff while
/// `is_transient` says the error is worth retrying.
///
/// On success returns the value together with the updated parameters, so
/// that a caller making a series of calls can keep backing off from where
/// it left off. Non-transient errors are returned immediately; a transient
/// error is returned once `max_tries` attempts have failed.
pub fn run_with_backoff<T, E, F, P>(mut op: F, is_transient: P, params: &BackoffParams) -> Result<(T, BackoffParams), E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut count = params.count;
    let end = count.saturating_add(params.max_tries.max(1));
    loop {
        if count > params.count {
            thread::sleep(params.delay(count));
        }
        match op() {
            Ok(value) => {
                return Ok((
                    value,
                    BackoffParams {
                        count,
                        ..params.clone()
                    },
                ))
            }
            Err(err) if is_transient(&err) => {
                count += 1;
                let warn_now = params.warn_after > 0 && count >= params.warn_after;
                if count >= end {
                    if warn_now {
                        warn!(failures = count, error = %err, "Giving up after repeated failures");
                    }
                    return Err(err);
                }
                if warn_now {
                    warn!(
                        failures = count,
                        delay_secs = params.delay(count).as_secs_f64(),
                        error = %err,
                        "Operation keeps failing; backing off"
                    );
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> BackoffParams {
        BackoffParams {
            base_secs: 0.0,
            ..BackoffParams::default()
        }
    }

    #[test]
    fn test_delay_doubles_up_to_ceiling() {
        let params = BackoffParams::default();
        assert_eq!(params.delay(0), Duration::ZERO);
        assert_eq!(params.delay(1), Duration::from_secs(1));
        assert_eq!(params.delay(2), Duration::from_secs(2));
        assert_eq!(params.delay(6), Duration::from_secs(32));
        assert_eq!(params.delay(9), Duration::from_secs(32));
    }

    #[test]
    fn test_jitter_stays_within_one_unit() {
        let params = BackoffParams {
            jitter: true,
            ..BackoffParams::default()
        };
        let delay = params.delay(3);
        assert!(delay >= Duration::from_secs(4) && delay < Duration::from_secs(8));
    }

    #[test]
    fn test_retries_until_success() {
        let calls = Cell::new(0);
        let (value, after) = run_with_backoff(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy")
                } else {
                    Ok(42)
                }
            },
            |_| true,
            &fast(),
        )
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(after.count, 2);
    }

    #[test]
    fn test_gives_up_after_max_tries() {
        let calls = Cell::new(0);
        let params = BackoffParams {
            max_tries: 4,
            ..fast()
        };
        let result: Result<((), BackoffParams), &str> = run_with_backoff(
            || {
                calls.set(calls.get() + 1);
                Err("busy")
            },
            |_| true,
            &params,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<((), BackoffParams), &str> = run_with_backoff(
            || {
                calls.set(calls.get() + 1);
                Err("no such mailbox")
            },
            |e| *e == "busy",
            &fast(),
        );
        assert_eq!(result.unwrap_err(), "no such mailbox");
        assert_eq!(calls.get(), 1);
    }
}
