//! The seam towards the MySQL admin collaborator.
//!
//! The operator never speaks Group Replication itself; it drives MySQL
//! Shell's AdminAPI primitives through the traits below. Production wires a
//! shell-backed implementation, tests wire scripted ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

mod error;
pub mod gtid;

pub use error::*;
pub use gtid::GtidSet;

use crate::types::{MemberRole, MemberStatus};

/// Connection options for one MySQL instance, resolved from the cluster's
/// admin account secret.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectOptions {
    /// Return a new `Self` without credentials attached yet.
    pub fn new(host: &str, port: u16, user: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: None,
        }
    }

    /// The `host:port` form used in AdminAPI target arguments.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// SSL requirements for group communication.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    #[serde(rename = "REQUIRED")]
    Required,
    #[serde(rename = "VERIFY_IDENTITY")]
    VerifyIdentity,
}

/// What a member does when it drops out of the group. The operator always
/// uses `ABORT_SERVER` so that expulsion surfaces as a container restart.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStateAction {
    #[serde(rename = "ABORT_SERVER")]
    AbortServer,
}

/// Distributed recovery method for `addInstance`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMethod {
    Incremental,
    Clone,
}

/// Options for `dba.createCluster()`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterOptions {
    pub gtid_set_is_complete: bool,
    /// The operator drives GR start itself, so start-on-boot must be off.
    pub manual_start_on_boot: bool,
    pub member_ssl_mode: SslMode,
    pub ip_allowlist: String,
    pub exit_state_action: ExitStateAction,
}

/// Options for `<Cluster>.addInstance()`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddInstanceOptions {
    pub recovery_method: RecoveryMethod,
    pub ip_allowlist: String,
    pub exit_state_action: ExitStateAction,
}

/// Options for `<Cluster>.removeInstance()`.
#[derive(Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveInstanceOptions {
    pub force: bool,
}

/// Options for `<Cluster>.setupRouterAccount()`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterAccountOptions {
    pub password: String,
    /// Update an existing account instead of creating it.
    pub update: bool,
}

/// Identity of a server, from `@@server_id`, `@@server_uuid`,
/// `@@report_host`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub server_id: u32,
    pub server_uuid: String,
    pub report_host: String,
}

/// `@@global.gtid_executed` / `@@global.gtid_purged` of one server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GtidState {
    pub executed: String,
    pub purged: String,
}

/// The membership tuple probed from one member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MembershipProbe {
    pub member_id: String,
    pub role: Option<MemberRole>,
    pub status: MemberStatus,
    pub view_id: Option<String>,
    pub version: Option<String>,
    /// Number of members in this member's view of the group.
    pub member_count: u32,
    /// Number of those members this member can reach.
    pub reachable_member_count: u32,
}

impl MembershipProbe {
    /// Check if this member's view still contains a majority of the group.
    pub fn has_quorum(&self) -> bool {
        self.member_count > 0 && self.reachable_member_count * 2 > self.member_count
    }
}

/// Entry point to the admin collaborator: opens DBA sessions to instances.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Open an admin session to the given instance.
    async fn connect_dba(&self, target: &ConnectOptions) -> Result<Box<dyn DbaSession>, AdminError>;
}

/// An admin (DBA) session against one MySQL instance.
#[async_trait]
pub trait DbaSession: Send + Sync {
    /// `host:port` of the instance this session talks to.
    fn endpoint(&self) -> String;

    /// Get a handle to the cluster this instance belongs to.
    async fn get_cluster(&mut self) -> Result<Box<dyn GroupCluster>, AdminError>;

    /// Create a new cluster seeded on this instance.
    async fn create_cluster(
        &mut self,
        name: &str,
        options: &CreateClusterOptions,
    ) -> Result<Box<dyn GroupCluster>, AdminError>;

    /// Rebuild the group from this instance after a complete outage.
    async fn reboot_cluster_from_complete_outage(
        &mut self,
    ) -> Result<Box<dyn GroupCluster>, AdminError>;

    /// `select @@server_id, @@server_uuid, @@report_host`.
    async fn instance_info(&mut self) -> Result<InstanceInfo, AdminError>;

    /// `select @@global.gtid_executed, @@global.gtid_purged`; `Ok(None)`
    /// when the variables cannot be read (never an error).
    async fn gtid_state(&mut self) -> Result<Option<GtidState>, AdminError>;

    /// Probe the member's view of the group.
    async fn membership_info(&mut self) -> Result<MembershipProbe, AdminError>;

    /// `STOP GROUP_REPLICATION`.
    async fn stop_group_replication(&mut self) -> Result<(), AdminError>;

    /// `SHOW GRANTS FOR ?@'%'`: `Ok(false)` on `ER_NONEXISTING_GRANT`.
    async fn user_has_grants(&mut self, user: &str) -> Result<bool, AdminError>;

    /// Create the backup account with the required grants.
    async fn setup_backup_account(&mut self, user: &str, password: &str)
        -> Result<(), AdminError>;
}

/// A handle to an InnoDB Cluster obtained from a DBA session.
#[async_trait]
pub trait GroupCluster: Send + Sync {
    /// The AdminAPI status document, for logging.
    async fn status(&mut self) -> Result<serde_json::Value, AdminError>;

    /// Add a new instance to the cluster.
    async fn add_instance(
        &mut self,
        target: &ConnectOptions,
        options: &AddInstanceOptions,
    ) -> Result<(), AdminError>;

    /// Rejoin a former member to the cluster.
    async fn rejoin_instance(&mut self, endpoint: &str) -> Result<(), AdminError>;

    /// Remove an instance from the cluster.
    async fn remove_instance(
        &mut self,
        endpoint: &str,
        options: &RemoveInstanceOptions,
    ) -> Result<(), AdminError>;

    /// Restore quorum using the partition the target belongs to.
    async fn force_quorum_using_partition_of(
        &mut self,
        target: &ConnectOptions,
    ) -> Result<(), AdminError>;

    /// Create or update the router metadata account.
    async fn setup_router_account(
        &mut self,
        user: &str,
        options: &RouterAccountOptions,
    ) -> Result<(), AdminError>;

    /// Server UUIDs of all members known to the cluster metadata.
    async fn metadata_member_uuids(&mut self) -> Result<Vec<String>, AdminError>;

    /// The cluster's executed GTID set, read from the member the handle is
    /// connected to.
    async fn gtid_executed(&mut self) -> Result<GtidSet, AdminError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_a_strict_majority() {
        let mut probe = MembershipProbe {
            member_id: "uuid".into(),
            role: Some(MemberRole::Primary),
            status: MemberStatus::Online,
            view_id: Some("1:3".into()),
            version: None,
            member_count: 3,
            reachable_member_count: 2,
        };
        assert!(probe.has_quorum());
        probe.reachable_member_count = 1;
        assert!(!probe.has_quorum());
        probe.member_count = 2;
        assert!(!probe.has_quorum());
    }

    #[test]
    fn options_serialize_with_adminapi_names() {
        let options = CreateClusterOptions {
            gtid_set_is_complete: true,
            manual_start_on_boot: true,
            member_ssl_mode: SslMode::Required,
            ip_allowlist: "10.0.0.1/8,127.0.0.1/8,::1/128".into(),
            exit_state_action: ExitStateAction::AbortServer,
        };
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["gtidSetIsComplete"], true);
        assert_eq!(json["memberSslMode"], "REQUIRED");
        assert_eq!(json["exitStateAction"], "ABORT_SERVER");

        let add = AddInstanceOptions {
            recovery_method: RecoveryMethod::Clone,
            ip_allowlist: "10.0.0.1/8".into(),
            exit_state_action: ExitStateAction::AbortServer,
        };
        let json = serde_json::to_value(&add).unwrap();
        assert_eq!(json["recoveryMethod"], "clone");
    }
}
