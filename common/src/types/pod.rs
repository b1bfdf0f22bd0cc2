//! Pod-level value types: the per-instance record the reconciler works on
//! and the Group Replication membership facts persisted on each pod.

use crate::{mysql::ConnectOptions, types::ClusterKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// Group Replication role of a member, as reported by the group itself.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum MemberRole {
    #[serde(rename = "PRIMARY")]
    #[strum(serialize = "PRIMARY")]
    Primary,
    #[serde(rename = "SECONDARY")]
    #[strum(serialize = "SECONDARY")]
    Secondary,
}

/// Group Replication member state, as reported by
/// `performance_schema.replication_group_members`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum MemberStatus {
    #[serde(rename = "ONLINE")]
    #[strum(serialize = "ONLINE")]
    Online,
    #[serde(rename = "RECOVERING")]
    #[strum(serialize = "RECOVERING")]
    Recovering,
    #[serde(rename = "OFFLINE")]
    #[strum(serialize = "OFFLINE")]
    Offline,
    #[serde(rename = "ERROR")]
    #[strum(serialize = "ERROR")]
    Error,
    #[serde(rename = "UNREACHABLE")]
    #[strum(serialize = "UNREACHABLE")]
    Unreachable,
}

impl MemberStatus {
    /// Check if the member is `Online`.
    pub fn online(&self) -> bool {
        self == &Self::Online
    }
}

/// Membership facts persisted in the pod's membership annotation.
/// `last_transition_time` moves only when one of role/status/view changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MembershipInfo {
    /// The GR member id (`@@server_uuid`).
    pub member_id: String,
    pub role: Option<MemberRole>,
    pub status: MemberStatus,
    pub view_id: Option<String>,
    /// MySQL server version of the member.
    pub version: Option<String>,
    pub last_transition_time: DateTime<Utc>,
    /// Whether this pod has ever been joined to the group by the operator.
    #[serde(default)]
    pub joined: bool,
}

impl MembershipInfo {
    /// True when the observable membership state differs, which is what
    /// stamps a new `last_transition_time`.
    pub fn transitioned(&self, other: &MembershipInfo) -> bool {
        self.role != other.role || self.status != other.status || self.view_id != other.view_id
    }

    /// Fold a fresh probe into the stored membership info.
    /// `last_transition_time` is carried over unless role, status or view
    /// changed; the `joined` marker is sticky.
    pub fn from_probe(
        probe: &crate::mysql::MembershipProbe,
        joined: bool,
        previous: Option<&MembershipInfo>,
        now: DateTime<Utc>,
    ) -> MembershipInfo {
        let next = MembershipInfo {
            member_id: probe.member_id.clone(),
            role: probe.role,
            status: probe.status,
            view_id: probe.view_id.clone(),
            version: probe.version.clone(),
            last_transition_time: now,
            joined: joined || previous.map(|info| info.joined).unwrap_or(false),
        };
        match previous {
            Some(previous) if !previous.transitioned(&next) => MembershipInfo {
                last_transition_time: previous.last_transition_time,
                ..next
            },
            _ => next,
        }
    }
}

/// A single MySQL server pod of a cluster, identified by `(cluster, index)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PodRecord {
    /// The owning cluster.
    pub cluster: ClusterKey,
    /// Ordinal of the pod within the server StatefulSet.
    pub index: u32,
    /// Pod name, `<cluster>-<index>`.
    pub name: String,
    /// `host:port` endpoint for MySQL clients.
    pub endpoint: String,
    /// Connection options used by the admin client.
    pub endpoint_co: ConnectOptions,
    /// IP address of the pod, if assigned yet.
    pub pod_ip_address: Option<String>,
    /// Set when the pod has a deletion timestamp.
    pub deleting: bool,
    /// Last persisted membership annotation, if any.
    pub membership_info: Option<MembershipInfo>,
    /// Whether the GR membership finalizer is present on the pod.
    pub member_finalizer: bool,
}

impl PodRecord {
    /// Return a new `Self` for the given cluster and ordinal, with the
    /// endpoints derived from the cluster's headless service.
    pub fn new(cluster: &ClusterKey, index: u32, admin_user: &str) -> Self {
        let name = format!("{}-{}", cluster.name, index);
        let host = format!(
            "{}.{}-instances.{}.svc.cluster.local",
            name, cluster.name, cluster.namespace
        );
        Self {
            cluster: cluster.clone(),
            index,
            name,
            endpoint: format!("{}:3306", host),
            endpoint_co: ConnectOptions::new(&host, 3306, admin_user),
            pod_ip_address: None,
            deleting: false,
            membership_info: None,
            member_finalizer: false,
        }
    }

    /// The persisted member id, if the pod ever reported one.
    pub fn member_id(&self) -> Option<&str> {
        self.membership_info
            .as_ref()
            .map(|info| info.member_id.as_str())
    }
}

impl fmt::Display for PodRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: MemberStatus, view: &str) -> MembershipInfo {
        MembershipInfo {
            member_id: "uuid-1".into(),
            role: Some(MemberRole::Primary),
            status,
            view_id: Some(view.into()),
            version: Some("8.0.29".into()),
            last_transition_time: Utc::now(),
            joined: true,
        }
    }

    #[test]
    fn transition_tracks_role_status_view_only() {
        let a = info(MemberStatus::Online, "1:4");
        let mut b = a.clone();
        assert!(!a.transitioned(&b));

        b.version = Some("8.0.30".into());
        assert!(!a.transitioned(&b));

        b.status = MemberStatus::Recovering;
        assert!(a.transitioned(&b));

        let mut c = a.clone();
        c.view_id = Some("1:5".into());
        assert!(a.transitioned(&c));
    }

    #[test]
    fn transition_time_is_monotonic() {
        use crate::mysql::MembershipProbe;
        use chrono::Duration;

        let t0 = Utc::now();
        let probe = MembershipProbe {
            member_id: "uuid-1".into(),
            role: Some(MemberRole::Primary),
            status: MemberStatus::Online,
            view_id: Some("1:4".into()),
            version: Some("8.0.29".into()),
            member_count: 3,
            reachable_member_count: 3,
        };
        let first = MembershipInfo::from_probe(&probe, true, None, t0);
        assert_eq!(first.last_transition_time, t0);
        assert!(first.joined);

        // Same observable state later: the stamp does not move.
        let t1 = t0 + Duration::seconds(30);
        let second = MembershipInfo::from_probe(&probe, false, Some(&first), t1);
        assert_eq!(second.last_transition_time, t0);
        assert!(second.joined, "joined marker is sticky");

        // A state change advances it.
        let mut offline = probe.clone();
        offline.status = MemberStatus::Offline;
        let t2 = t1 + Duration::seconds(30);
        let third = MembershipInfo::from_probe(&offline, false, Some(&second), t2);
        assert_eq!(third.last_transition_time, t2);
        assert!(third.last_transition_time > second.last_transition_time);
    }

    #[test]
    fn pod_endpoints_follow_the_headless_service() {
        let pod = PodRecord::new(&ClusterKey::new("prod", "mycluster"), 2, "mysqladmin");
        assert_eq!(pod.name, "mycluster-2");
        assert_eq!(
            pod.endpoint,
            "mycluster-2.mycluster-instances.prod.svc.cluster.local:3306"
        );
    }
}
