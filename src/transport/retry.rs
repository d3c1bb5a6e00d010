// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded retries for transient transport failures.
//!
//! Managed hosts can be briefly unreachable. [`Retrying`] wraps a transport
//! and retries operations that failed with a transient error, i.e., a
//! timeout or a connection failure, using exponential backoff.
//!
//! Retries are capped at [`MAX_ATTEMPTS`] so persistent failures surface
//! quickly. Only `exists`, `read`, and `write` are retried, because repeating
//! them is harmless. Commands run through `execute` are never repeated, since
//! a timed out command may have already taken effect on the host.

use crate::transport::{ExecOutput, Result, Transport};

use std::{path::Path, thread::sleep, time::Duration};
use tracing::warn;

/// Upper bound on attempts per operation, first try included.
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff parameters for [`Retrying`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Construct new retry policy.
    ///
    /// Attempt count is clamped between one and [`MAX_ATTEMPTS`].
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS),
            base_delay,
            max_delay,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Total attempts allowed per operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after given failed attempt, counting from one.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            MAX_ATTEMPTS,
            Duration::from_millis(500),
            Duration::from_secs(5),
        )
    }
}

/// Transport decorator that retries transient failures.
#[derive(Debug)]
pub struct Retrying<T>
where
    T: Transport,
{
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retrying<T>
where
    T: Transport,
{
    /// Wrap transport with retry policy.
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Access wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn attempt<R>(&self, operation: &str, mut op: impl FnMut(&T) -> Result<R>) -> Result<R> {
        let mut attempt = 1;
        loop {
            match op(&self.inner) {
                Err(error) if error.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        "{operation} failed on attempt {attempt}/{}: {error}; retrying in {delay:?}",
                        self.policy.max_attempts
                    );
                    sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<T> Transport for Retrying<T>
where
    T: Transport,
{
    fn exists(&self, path: &Path) -> Result<bool> {
        self.attempt("exists", |inner| inner.exists(path))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.attempt("read", |inner| inner.read(path))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.attempt("write", |inner| inner.write(path, contents))
    }

    fn execute(&self, command: &str) -> Result<ExecOutput> {
        self.inner.execute(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    /// Transport failing with a chosen error for the first few calls.
    struct Flaky {
        failures: Cell<u32>,
        calls: Cell<u32>,
        transient: bool,
    }

    impl Flaky {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                failures: Cell::new(failures),
                calls: Cell::new(0),
                transient,
            }
        }

        fn step(&self) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.failures.get() == 0 {
                return Ok(());
            }

            self.failures.set(self.failures.get() - 1);
            if self.transient {
                Err(TransportError::Timeout {
                    operation: "test".into(),
                    limit: Duration::ZERO,
                })
            } else {
                Err(TransportError::Remote {
                    path: "/x".into(),
                    code: 1,
                    message: "permission denied".into(),
                })
            }
        }
    }

    impl Transport for Flaky {
        fn exists(&self, _: &Path) -> Result<bool> {
            self.step().map(|_| true)
        }

        fn read(&self, _: &Path) -> Result<Vec<u8>> {
            self.step().map(|_| b"data".to_vec())
        }

        fn write(&self, _: &Path, _: &[u8]) -> Result<()> {
            self.step()
        }

        fn execute(&self, _: &str) -> Result<ExecOutput> {
            self.step().map(|_| ExecOutput {
                code: 0,
                output: String::new(),
            })
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn retries_transient_failures_until_success() -> anyhow::Result<()> {
        let transport = Retrying::new(Flaky::new(2, true), quick_policy());
        assert_eq!(transport.read(Path::new("/x"))?, b"data".to_vec());
        assert_eq!(transport.inner().calls.get(), 3);

        Ok(())
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let transport = Retrying::new(Flaky::new(10, true), quick_policy());
        let result = transport.write(Path::new("/x"), b"data");
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert_eq!(transport.inner().calls.get(), MAX_ATTEMPTS);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let transport = Retrying::new(Flaky::new(1, false), quick_policy());
        let result = transport.exists(Path::new("/x"));
        assert!(matches!(result, Err(TransportError::Remote { .. })));
        assert_eq!(transport.inner().calls.get(), 1);
    }

    #[test]
    fn execute_is_never_retried() {
        let transport = Retrying::new(Flaky::new(1, true), quick_policy());
        let result = transport.execute("supervisorctl update");
        assert!(result.is_err());
        assert_eq!(transport.inner().calls.get(), 1);
    }

    #[test]
    fn policy_caps_attempts_and_delay() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(policy.max_attempts(), MAX_ATTEMPTS);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts(), 1);
    }
}
