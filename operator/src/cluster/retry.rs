//! Bounded retries around admin operations.
//!
//! Transient faults (connectivity, an instance not yet ONLINE, a primary
//! still in `super_read_only`, GR already running while creating) get a
//! bounded number of immediate re-invocations. Once exhausted they are
//! surfaced as a transient reconcile error carrying a per-class delay hint
//! so the host requeues instead of spinning. Permanent faults propagate at
//! once.

use common_lib::mysql::AdminError;
use std::time::Duration;

use crate::error::Error;

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry in place; when attempts run out requeue after the hint.
    Retry { hint: Duration },
    /// Give up immediately.
    Fail,
}

/// Bounded-retry policy for admin operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of invocations before the error escalates.
    pub max_attempts: u32,
    /// Fixed pause between in-place retries.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Classify a reconcile error for the retry loop. Whether an admin fault is
/// transient at all is the error contract's call ([`AdminError::is_transient`]);
/// only the per-class requeue hint lives here.
pub fn disposition(error: &Error) -> Disposition {
    match error {
        Error::Admin { source } if source.is_transient() => Disposition::Retry {
            hint: match source {
                AdminError::InstanceAlreadyInGr { .. } => Duration::from_secs(3),
                AdminError::Connection { .. } | AdminError::OptionPreventsStatement => {
                    Duration::from_secs(5)
                }
                _ => Duration::from_secs(15),
            },
        },
        Error::Admin { .. } => Disposition::Fail,
        // Kubernetes API faults are worth a second attempt too.
        Error::Kube { .. } => Disposition::Retry {
            hint: Duration::from_secs(5),
        },
        // Already classified further up: pass through untouched.
        _ => Disposition::Fail,
    }
}

/// Invoke an admin operation under a [`RetryPolicy`].
///
/// The operation expression is re-evaluated on every attempt. Exhausted
/// transient errors come back as [`Error::Transient`] with the class hint.
#[macro_export]
macro_rules! with_retries {
    ($policy:expr, $op:expr) => {{
        let policy: $crate::cluster::retry::RetryPolicy = $policy;
        let mut attempt = 1u32;
        loop {
            match $op.await {
                Ok(value) => break Ok(value),
                Err(error) => match $crate::cluster::retry::disposition(&error) {
                    $crate::cluster::retry::Disposition::Retry { .. }
                        if attempt < policy.max_attempts =>
                    {
                        tracing::warn!(
                            %error,
                            attempt,
                            max_attempts = policy.max_attempts,
                            "operation failed, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(policy.delay).await;
                    }
                    $crate::cluster::retry::Disposition::Retry { hint } => {
                        break Err($crate::error::Error::transient(error.to_string(), hint));
                    }
                    $crate::cluster::retry::Disposition::Fail => break Err(error),
                },
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::with_retries;
    use common_lib::mysql::AdminError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connection_error() -> Error {
        Error::Admin {
            source: AdminError::Connection {
                endpoint: "pod-0:3306".into(),
                reason: "refused".into(),
            },
        }
    }

    #[test]
    fn classification() {
        assert_eq!(
            disposition(&connection_error()),
            Disposition::Retry {
                hint: Duration::from_secs(5)
            }
        );
        assert_eq!(
            disposition(&Error::Admin {
                source: AdminError::MemberMetadataMissing
            }),
            Disposition::Fail
        );
        assert_eq!(
            disposition(&Error::permanent("split brain")),
            Disposition::Fail
        );
        // Pre-classified transients keep their own delay hint.
        assert_eq!(
            disposition(&Error::transient("busy", Duration::from_secs(10))),
            Disposition::Fail
        );
    }

    #[tokio::test]
    async fn transient_errors_retry_then_escalate() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(connection_error())
        };
        let result: Result<(), Error> = with_retries!(policy, op());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::Transient { delay, .. }) => assert_eq!(delay, Duration::from_secs(5)),
            other => panic!("expected transient escalation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn success_after_a_retry() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let op = || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(connection_error())
            } else {
                Ok(42)
            }
        };
        let result: Result<u32, Error> = with_retries!(policy, op());
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::permanent("user action required"))
        };
        let result: Result<(), Error> = with_retries!(policy, op());
        assert!(matches!(result, Err(Error::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
