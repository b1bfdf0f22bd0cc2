//! Errors generated during reconciliation and their requeue semantics.
//!
//! Three kinds matter to the host loop: transient errors carry a delay and
//! get the object requeued, permanent errors stop requeuing until a human
//! acts, and everything else is an infrastructure fault retried on a short
//! fixed delay.

use common_lib::mysql::AdminError;
use snafu::Snafu;
use std::time::Duration;

/// Errors generated during the reconciliation loop.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum Error {
    #[snafu(display("Cluster '{}' busy, lock owner '{}'", cluster, owner))]
    /// Another reconciliation currently owns the cluster's action lock.
    ClusterBusy { cluster: String, owner: String },

    #[snafu(display("{}", reason))]
    /// Retry is expected to succeed; requeue after `delay`.
    Transient { reason: String, delay: Duration },

    #[snafu(display("{}", reason))]
    /// Human intervention required; stop requeuing the object.
    Permanent { reason: String },

    #[snafu(display("Kubernetes client error: {}", source))]
    Kube { source: kube::Error },

    #[snafu(display("Admin client error: {}", source))]
    Admin { source: AdminError },

    #[snafu(display("Serialization error: {}", source))]
    Serde { source: serde_json::Error },

    #[snafu(display("Invalid resource: {}", reason))]
    InvalidResource { reason: String },
}

impl Error {
    /// A transient error with a requeue hint.
    pub fn transient(reason: impl Into<String>, delay: Duration) -> Self {
        Error::Transient {
            reason: reason.into(),
            delay,
        }
    }

    /// A permanent error.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Error::Permanent {
            reason: reason.into(),
        }
    }

    /// When the host should requeue the object; `None` stops reconciliation.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::ClusterBusy { .. } => Some(Duration::from_secs(10)),
            Error::Transient { delay, .. } => Some(*delay),
            Error::Permanent { .. } => None,
            Error::InvalidResource { .. } => None,
            Error::Kube { .. } | Error::Admin { .. } | Error::Serde { .. } => {
                Some(Duration::from_secs(5))
            }
        }
    }
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        Error::Kube { source }
    }
}

impl From<AdminError> for Error {
    fn from(source: AdminError) -> Self {
        Error::Admin { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::Serde { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_hints_by_kind() {
        let busy = Error::ClusterBusy {
            cluster: "ns/c".into(),
            owner: "c-0".into(),
        };
        assert_eq!(busy.requeue_after(), Some(Duration::from_secs(10)));

        let transient = Error::transient("waiting for seed", Duration::from_secs(15));
        assert_eq!(transient.requeue_after(), Some(Duration::from_secs(15)));

        assert_eq!(Error::permanent("split brain").requeue_after(), None);

        let admin: Error = AdminError::MemberMetadataMissing.into();
        assert_eq!(admin.requeue_after(), Some(Duration::from_secs(5)));
    }
}
