//! Operator configuration: fixed account names, environment-driven knobs
//! and the runtime settings handed to the reconciler.

use crate::cluster::retry::RetryPolicy;
use std::time::Duration;

/// MySQL account administered by the operator.
pub const CLUSTER_ADMIN_USER_NAME: &str = "mysqladmin";
/// Account the routers use against the cluster metadata.
pub const ROUTER_METADATA_USER_NAME: &str = "mysqlrouter";
/// Account used by the backup jobs.
pub const BACKUP_USER_NAME: &str = "mysqlbackup";

/// Extra CIDRs appended to every member's GR allowlist.
pub const IP_ALLOWLIST_EXTRA_ENV: &str = "MYSQL_OPERATOR_IP_ALLOWLIST_EXTRA";

/// Image repository for server/router images.
pub const DEFAULT_IMAGE_REPOSITORY_ENV: &str = "MYSQL_OPERATOR_DEFAULT_REPOSITORY";

/// Debug verbosity knob, raises log output when > 0.
pub const DEBUG_ENV: &str = "MYSQL_OPERATOR_DEBUG";

/// The allowlist suffix appended to every pod's own CIDR: the operator
/// extras followed by localhost, which GR always needs.
pub fn ip_allowlist_extra() -> String {
    let mut extra = std::env::var(IP_ALLOWLIST_EXTRA_ENV).unwrap_or_default();
    if !extra.is_empty() {
        extra.push(',');
    }
    extra.push_str("127.0.0.1/8,::1/128");
    extra
}

/// Image repository the server images are pulled from.
pub fn default_image_repository() -> String {
    std::env::var(DEFAULT_IMAGE_REPOSITORY_ENV).unwrap_or_else(|_| "mysql".to_string())
}

/// Requested debug verbosity, 0 when unset or unparsable.
pub fn debug_level() -> u32 {
    std::env::var(DEBUG_ENV)
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(0)
}

/// Runtime settings for the reconciliation core.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Timeout for each member probe connection.
    pub probe_timeout: Duration,
    /// Maximum number of concurrent member probes per diagnosis.
    pub probe_fanout: usize,
    /// Retry policy wrapped around admin operations.
    pub retry: RetryPolicy,
    /// MySQL account used for admin sessions.
    pub admin_user: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            probe_fanout: 8,
            retry: RetryPolicy::default(),
            admin_user: CLUSTER_ADMIN_USER_NAME.to_string(),
        }
    }
}

/// Log the effective configuration once at startup.
pub fn log_config_banner() {
    tracing::info!(
        operator.version = env!("CARGO_PKG_VERSION"),
        debug = debug_level(),
        image.repository = %default_image_repository(),
        ip.allowlist.extra = %ip_allowlist_extra(),
        "operator configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_always_ends_with_localhost() {
        let extra = ip_allowlist_extra();
        assert!(extra.ends_with("127.0.0.1/8,::1/128"));
    }
}
