//! Errors surfaced by the MySQL admin client collaborator.
//!
//! The AdminAPI distinguishes failures by numeric code; the codes matched on
//! by the reconciler are a stable contract and get their own variants, with
//! `Other` as the catch-all every handler must still match.

use snafu::Snafu;

/// `ER_OPTION_PREVENTS_STATEMENT`: statement refused, typically because
/// `super_read_only` is still ON during a primary transition.
pub const ER_OPTION_PREVENTS_STATEMENT: u32 = 1290;
/// `ER_NONEXISTING_GRANT`: `SHOW GRANTS` for an account that does not exist.
pub const ER_NONEXISTING_GRANT: u32 = 1141;
/// Shell AdminAPI: the target instance is not ONLINE in the group.
pub const SHERR_DBA_BADARG_INSTANCE_NOT_ONLINE: u32 = 51314;
/// Shell AdminAPI: the target instance already runs Group Replication.
pub const SHERR_DBA_BADARG_INSTANCE_ALREADY_IN_GR: u32 = 51302;
/// Shell AdminAPI: the member is missing from the metadata schema.
pub const SHERR_DBA_MEMBER_METADATA_MISSING: u32 = 51104;

/// Errors generated by admin client operations.
#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility = "pub")]
pub enum AdminError {
    #[snafu(display("Could not connect to '{}': {}", endpoint, reason))]
    Connection { endpoint: String, reason: String },
    #[snafu(display("Instance '{}' is not ONLINE", endpoint))]
    InstanceNotOnline { endpoint: String },
    #[snafu(display("Group Replication is already running at '{}'", endpoint))]
    InstanceAlreadyInGr { endpoint: String },
    #[snafu(display("Member is missing from the cluster metadata"))]
    MemberMetadataMissing,
    #[snafu(display("Option prevents statement (super_read_only transition)"))]
    OptionPreventsStatement,
    #[snafu(display("Grant does not exist"))]
    NonExistingGrant,
    #[snafu(display("MySQL error {}: {}", code, message))]
    Other { code: u32, message: String },
}

impl AdminError {
    /// The numeric error code of the underlying MySQL/Shell error.
    pub fn code(&self) -> u32 {
        match self {
            AdminError::Connection { .. } => 2003,
            AdminError::InstanceNotOnline { .. } => SHERR_DBA_BADARG_INSTANCE_NOT_ONLINE,
            AdminError::InstanceAlreadyInGr { .. } => SHERR_DBA_BADARG_INSTANCE_ALREADY_IN_GR,
            AdminError::MemberMetadataMissing => SHERR_DBA_MEMBER_METADATA_MISSING,
            AdminError::OptionPreventsStatement => ER_OPTION_PREVENTS_STATEMENT,
            AdminError::NonExistingGrant => ER_NONEXISTING_GRANT,
            AdminError::Other { code, .. } => *code,
        }
    }

    /// Map a raw `(code, message)` pair from the shell into a typed error.
    pub fn from_code(code: u32, message: &str, endpoint: &str) -> Self {
        match code {
            // Client-side connect failures (CR_CONNECTION_ERROR and friends).
            2002 | 2003 | 2005 | 2013 => AdminError::Connection {
                endpoint: endpoint.to_string(),
                reason: message.to_string(),
            },
            ER_OPTION_PREVENTS_STATEMENT => AdminError::OptionPreventsStatement,
            ER_NONEXISTING_GRANT => AdminError::NonExistingGrant,
            SHERR_DBA_BADARG_INSTANCE_NOT_ONLINE => AdminError::InstanceNotOnline {
                endpoint: endpoint.to_string(),
            },
            SHERR_DBA_BADARG_INSTANCE_ALREADY_IN_GR => AdminError::InstanceAlreadyInGr {
                endpoint: endpoint.to_string(),
            },
            SHERR_DBA_MEMBER_METADATA_MISSING => AdminError::MemberMetadataMissing,
            code => AdminError::Other {
                code,
                message: message.to_string(),
            },
        }
    }

    /// Check whether retrying the operation may succeed without operator
    /// intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdminError::Connection { .. }
                | AdminError::InstanceNotOnline { .. }
                | AdminError::InstanceAlreadyInGr { .. }
                | AdminError::OptionPreventsStatement
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let err = AdminError::from_code(1290, "read only", "host:3306");
        assert_eq!(err, AdminError::OptionPreventsStatement);
        assert_eq!(err.code(), ER_OPTION_PREVENTS_STATEMENT);

        let err = AdminError::from_code(9999, "surprise", "host:3306");
        assert_eq!(err.code(), 9999);
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classes() {
        assert!(AdminError::Connection {
            endpoint: "a".into(),
            reason: "refused".into()
        }
        .is_transient());
        assert!(AdminError::OptionPreventsStatement.is_transient());
        assert!(!AdminError::MemberMetadataMissing.is_transient());
    }
}
