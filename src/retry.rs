//! Bounded retry for connection establishment.
//!
//! Each transient failure class has its own budget. A class that reaches its
//! budget ends the loop with [`ProvisionError::Connectivity`]; any fatal
//! failure ends it immediately.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProvisionError, TransientClass};

/// Default delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Budget for a single failure class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Failures of this class tolerated before giving up.
    pub max_failures: u32,
    /// Pause between a failure and the next attempt.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given budget and delay.
    #[must_use]
    pub const fn new(max_failures: u32, delay: Duration) -> Self {
        Self {
            max_failures,
            delay,
        }
    }
}

/// Per-class retry budgets used while opening a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectRetryPolicy {
    /// Budget for "authentication method not offered yet" failures.
    pub auth_method: RetryPolicy,
    /// Budget for refused or unroutable TCP connections.
    pub unreachable: RetryPolicy,
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self {
            auth_method: RetryPolicy::new(12, DEFAULT_RETRY_DELAY),
            unreachable: RetryPolicy::new(24, DEFAULT_RETRY_DELAY),
        }
    }
}

impl ConnectRetryPolicy {
    /// Overrides the delay for every class, keeping the budgets.
    ///
    /// Tests use a zero delay to keep exhaustion scenarios fast.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.auth_method.delay = delay;
        self.unreachable.delay = delay;
        self
    }

    /// Returns the budget for `class`.
    #[must_use]
    pub const fn for_class(&self, class: TransientClass) -> RetryPolicy {
        match class {
            TransientClass::AuthMethodUnavailable => self.auth_method,
            TransientClass::Unreachable => self.unreachable,
        }
    }
}

/// Outcome of a single failed attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttemptError {
    /// Retry-eligible failure.
    Transient {
        /// Failure class used to pick the budget.
        class: TransientClass,
        /// Description of the failure.
        message: String,
    },
    /// Failure that must not be retried.
    Fatal(ProvisionError),
}

/// Consecutive failures per class; a failure of one class ends the other
/// class's run.
#[derive(Debug, Default)]
struct FailureCounts {
    auth_method: u32,
    unreachable: u32,
}

impl FailureCounts {
    fn bump(&mut self, class: TransientClass) -> u32 {
        let (slot, other) = match class {
            TransientClass::AuthMethodUnavailable => (&mut self.auth_method, &mut self.unreachable),
            TransientClass::Unreachable => (&mut self.unreachable, &mut self.auth_method),
        };
        *other = 0;
        *slot = slot.saturating_add(1);
        *slot
    }
}

/// Runs `attempt` until it succeeds, fails fatally, or a transient class
/// fails `max_failures` times in a row. The closure receives the 1-based
/// attempt number; the reported `attempts` counts every attempt made.
///
/// # Errors
///
/// Returns the fatal error unchanged, or [`ProvisionError::Connectivity`]
/// once a class reaches its `max_failures`.
pub fn retry_classified<T>(
    host: &str,
    policy: &ConnectRetryPolicy,
    mut attempt: impl FnMut(u32) -> Result<T, AttemptError>,
) -> Result<T, ProvisionError> {
    let mut counts = FailureCounts::default();
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match attempt(attempts) {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Transient { class, message }) => {
                let budget = policy.for_class(class);
                let failures = counts.bump(class);
                if failures >= budget.max_failures {
                    warn!(host, %class, attempts, "giving up on connection");
                    return Err(ProvisionError::Connectivity {
                        host: host.to_owned(),
                        class,
                        attempts,
                        message,
                    });
                }
                debug!(
                    host,
                    %class,
                    failures,
                    budget = budget.max_failures,
                    error = %message,
                    "remote host not ready, retrying"
                );
                thread::sleep(budget.delay);
            }
        }
    }
}
