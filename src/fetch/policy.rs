//! Request policy and the shared retry loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_TIME_BETWEEN_RETRIES_SECS: u64 = 1;

/// Timeout and retry budget for one fetch. Applies to each strategy separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPolicy {
    pub timeout_secs: u64,
    /// Attempts per strategy, including the first one. Never below 1.
    pub retries: u32,
    pub time_between_retries_secs: u64,
    /// Skip the direct GET and go straight to the rendering proxy.
    pub force_secondary_fetch: bool,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
            time_between_retries_secs: DEFAULT_TIME_BETWEEN_RETRIES_SECS,
            force_secondary_fetch: false,
        }
    }
}

/// Host-specific adjustments from the decode guide's `request_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestOverride {
    pub request_timeout: Option<u64>,
    pub request_retries: Option<u32>,
    pub request_time_between_retries: Option<u64>,
    pub force_secondary_fetch: Option<bool>,
}

impl RequestPolicy {
    /// Combine with a host override: numbers take the larger value, the flag is OR'd.
    pub fn merge(&self, host: &RequestOverride) -> Self {
        Self {
            timeout_secs: self.timeout_secs.max(host.request_timeout.unwrap_or(0)),
            retries: self.retries.max(host.request_retries.unwrap_or(0)).max(1),
            time_between_retries_secs: self
                .time_between_retries_secs
                .max(host.request_time_between_retries.unwrap_or(0)),
            force_secondary_fetch: self.force_secondary_fetch
                || host.force_secondary_fetch.unwrap_or(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn time_between_retries(&self) -> Duration {
        Duration::from_secs(self.time_between_retries_secs)
    }
}

/// Outcome of a single attempt inside [with_retries].
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Transient failure; consumes one attempt.
    Retry(E),
    /// Permanent failure; stops the loop without using the remaining attempts.
    Abort(E),
}

/// Run `attempt` up to `retries` times (at least once), calling `sleep(between)` between
/// attempts. The attempt number passed in is 1-based. On exhaustion the last error is returned.
pub fn with_retries<T, E>(
    retries: u32,
    between: Duration,
    mut sleep: impl FnMut(Duration),
    mut attempt: impl FnMut(u32) -> Attempt<T, E>,
) -> Result<T, E> {
    let max_attempts = retries.max(1);
    let mut n = 1;
    loop {
        match attempt(n) {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(e) => return Err(e),
            Attempt::Retry(e) => {
                if n >= max_attempts {
                    return Err(e);
                }
                sleep(between);
                n += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn failing_attempts_use_whole_budget() {
        let calls = RefCell::new(0u32);
        let sleeps = RefCell::new(Vec::new());
        let result: Result<(), &str> = with_retries(
            3,
            Duration::from_secs(2),
            |d| sleeps.borrow_mut().push(d),
            |_| {
                *calls.borrow_mut() += 1;
                Attempt::Retry("boom")
            },
        );
        assert_eq!(result, Err("boom"));
        assert_eq!(*calls.borrow(), 3);
        assert_eq!(*sleeps.borrow(), vec![Duration::from_secs(2); 2]);
    }

    #[test]
    fn success_stops_the_loop() {
        let mut sleeps = 0;
        let result: Result<u32, &str> = with_retries(
            5,
            Duration::ZERO,
            |_| sleeps += 1,
            |n| {
                if n == 2 {
                    Attempt::Done(n)
                } else {
                    Attempt::Retry("again")
                }
            },
        );
        assert_eq!(result, Ok(2));
        assert_eq!(sleeps, 1);
    }

    #[test]
    fn abort_does_not_consume_retries() {
        let mut calls = 0;
        let mut sleeps = 0;
        let result: Result<(), &str> = with_retries(
            3,
            Duration::ZERO,
            |_| sleeps += 1,
            |_| {
                calls += 1;
                Attempt::Abort("bad scheme")
            },
        );
        assert_eq!(result, Err("bad scheme"));
        assert_eq!(calls, 1);
        assert_eq!(sleeps, 0);
    }

    #[test]
    fn zero_retries_still_tries_once() {
        let mut calls = 0;
        let _: Result<(), ()> = with_retries(0, Duration::ZERO, |_| {}, |_| {
            calls += 1;
            Attempt::Retry(())
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn merge_takes_max_and_ors_flag() {
        let global = RequestPolicy::default();
        let host = RequestOverride {
            request_timeout: Some(60),
            request_retries: Some(2),
            request_time_between_retries: Some(5),
            force_secondary_fetch: Some(true),
        };
        let merged = global.merge(&host);
        assert_eq!(
            merged,
            RequestPolicy {
                timeout_secs: 60,
                retries: 3,
                time_between_retries_secs: 5,
                force_secondary_fetch: true,
            }
        );
    }

    #[test]
    fn empty_override_keeps_global() {
        let global = RequestPolicy {
            force_secondary_fetch: true,
            ..RequestPolicy::default()
        };
        assert_eq!(global.merge(&RequestOverride::default()), global);
    }
}
