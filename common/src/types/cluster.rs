//! Cluster-level value types: the declared spec snapshot, the observed
//! status published to the status subresource and the diagnosis results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

use crate::types::ClusterKey;

/// Declared InnoDB Cluster specification, as far as the reconciler needs it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of MySQL server instances.
    pub instances: u32,
    /// Number of router instances to run once the cluster is complete.
    pub router_instances: u32,
    /// Use self-signed certificates rather than a verifiable CA.
    pub tls_use_self_signed: bool,
    /// Optional initial data source for the seed instance.
    pub init_db: Option<InitDb>,
    /// Server image version tag.
    pub version: Option<String>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            instances: 1,
            router_instances: 0,
            tls_use_self_signed: true,
            init_db: None,
            version: None,
        }
    }
}

/// Initial data source for a new cluster. At most one of the fields is set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitDb {
    pub clone: Option<InitDbClone>,
    pub dump: Option<InitDbDump>,
}

/// Clone the initial dataset from a donor instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitDbClone {
    /// URI of the donor.
    pub uri: String,
}

/// Restore the initial dataset from a logical dump.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitDbDump {
    pub name: Option<String>,
    pub storage: DumpStorage,
}

/// Where a dump lives.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DumpStorage {
    pub oci_object_storage: Option<OciObjectStorage>,
    pub persistent_volume_claim: Option<serde_json::Value>,
}

/// An OCI object storage bucket holding a dump.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OciObjectStorage {
    pub bucket_name: String,
    pub prefix: Option<String>,
}

/// The health of a cluster as derived from probing all of its members.
///
/// The `*Uncertain` variants mean some member was unreachable while the rest
/// agreed on the base state; they exist to block destructive recovery while
/// a minority partition may still be alive elsewhere.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
pub enum ClusterDiagStatus {
    #[serde(rename = "INITIALIZING")]
    #[strum(serialize = "INITIALIZING")]
    Initializing,
    #[serde(rename = "ONLINE")]
    #[strum(serialize = "ONLINE")]
    Online,
    #[serde(rename = "ONLINE_PARTIAL")]
    #[strum(serialize = "ONLINE_PARTIAL")]
    OnlinePartial,
    #[serde(rename = "ONLINE_UNCERTAIN")]
    #[strum(serialize = "ONLINE_UNCERTAIN")]
    OnlineUncertain,
    #[serde(rename = "OFFLINE")]
    #[strum(serialize = "OFFLINE")]
    Offline,
    #[serde(rename = "OFFLINE_UNCERTAIN")]
    #[strum(serialize = "OFFLINE_UNCERTAIN")]
    OfflineUncertain,
    #[serde(rename = "NO_QUORUM")]
    #[strum(serialize = "NO_QUORUM")]
    NoQuorum,
    #[serde(rename = "NO_QUORUM_UNCERTAIN")]
    #[strum(serialize = "NO_QUORUM_UNCERTAIN")]
    NoQuorumUncertain,
    #[serde(rename = "SPLIT_BRAIN")]
    #[strum(serialize = "SPLIT_BRAIN")]
    SplitBrain,
    #[serde(rename = "SPLIT_BRAIN_UNCERTAIN")]
    #[strum(serialize = "SPLIT_BRAIN_UNCERTAIN")]
    SplitBrainUncertain,
    #[serde(rename = "UNKNOWN")]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
    #[serde(rename = "INVALID")]
    #[strum(serialize = "INVALID")]
    Invalid,
    #[serde(rename = "FINALIZING")]
    #[strum(serialize = "FINALIZING")]
    Finalizing,
}

impl ClusterDiagStatus {
    /// Check if some members were unreachable when this status was derived.
    pub fn is_uncertain(&self) -> bool {
        matches!(
            self,
            Self::OnlineUncertain
                | Self::OfflineUncertain
                | Self::NoQuorumUncertain
                | Self::SplitBrainUncertain
                | Self::Unknown
        )
    }

    /// Check if the group has a functioning quorum.
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            Self::Online | Self::OnlinePartial | Self::OnlineUncertain
        )
    }
}

/// Classification of a single pod relative to an existing cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CandidateDiagStatus {
    /// Known to the cluster metadata and part of the current view.
    #[strum(serialize = "MEMBER")]
    Member,
    /// Unknown to the cluster and compatible, can be added.
    #[strum(serialize = "JOINABLE")]
    Joinable,
    /// Known to the cluster but not currently part of the group.
    #[strum(serialize = "REJOINABLE")]
    Rejoinable,
    /// Holds transactions the cluster does not have; cannot join without
    /// being re-provisioned.
    #[strum(serialize = "BROKEN")]
    Broken,
    /// No admin session could be established.
    #[strum(serialize = "UNREACHABLE")]
    Unreachable,
}

/// Observed status written to the cluster's status subresource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceStatus {
    pub status: ClusterDiagStatus,
    pub online_instances: u32,
    pub last_probe_time: DateTime<Utc>,
}

/// Snapshot of a cluster resource, keyed by `(namespace, name)`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClusterRecord {
    pub key: ClusterKey,
    pub spec: ClusterSpec,
    /// Set when the resource has a deletion timestamp.
    pub deleting: bool,
    /// Stamped exactly once, when the seed instance first forms the group.
    pub create_time: Option<DateTime<Utc>>,
    /// Where the initial dataset came from (`blank`, `clone=..`, `dump=..`).
    pub initial_data_source: Option<String>,
    /// Last published observed status.
    pub status: Option<ClusterResourceStatus>,
}

impl ClusterRecord {
    /// Return a new `Self` with an empty history.
    pub fn new(key: ClusterKey, spec: ClusterSpec) -> Self {
        Self {
            key,
            spec,
            deleting: false,
            create_time: None,
            initial_data_source: None,
            status: None,
        }
    }

    /// Whether `create_cluster` ever completed for this resource.
    pub fn created(&self) -> bool {
        self.create_time.is_some()
    }
}

/// Result of diagnosing a whole cluster: the derived status plus the facts
/// the reconciler needs to pick a recovery action. Pods are referred to by
/// their ordinal.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDiagnosis {
    pub status: ClusterDiagStatus,
    /// Ordinal of the pod reporting the PRIMARY role, if any.
    pub primary: Option<u32>,
    /// Ordinals of members reported ONLINE.
    pub online_members: Vec<u32>,
    /// Reachable pods whose view still contains a majority of the declared
    /// members; only these may be used to force quorum.
    pub quorum_candidates: Vec<u32>,
    /// Per-pod `@@gtid_executed`, `None` when it could not be read.
    pub gtid_executed: HashMap<u32, Option<String>>,
}

impl ClusterDiagnosis {
    /// Number of pods whose GTID set was readable.
    pub fn gtids_known(&self) -> usize {
        self.gtid_executed
            .values()
            .filter(|gtids| gtids.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_the_published_contract() {
        assert_eq!(ClusterDiagStatus::OnlinePartial.to_string(), "ONLINE_PARTIAL");
        assert_eq!(
            "SPLIT_BRAIN_UNCERTAIN".parse::<ClusterDiagStatus>().unwrap(),
            ClusterDiagStatus::SplitBrainUncertain
        );
        let json = serde_json::to_string(&ClusterDiagStatus::NoQuorum).unwrap();
        assert_eq!(json, "\"NO_QUORUM\"");
    }

    #[test]
    fn uncertain_states_block_destructive_recovery() {
        for status in &[
            ClusterDiagStatus::OnlineUncertain,
            ClusterDiagStatus::OfflineUncertain,
            ClusterDiagStatus::NoQuorumUncertain,
            ClusterDiagStatus::SplitBrainUncertain,
            ClusterDiagStatus::Unknown,
        ] {
            assert!(status.is_uncertain(), "{} must be uncertain", status);
        }
        assert!(!ClusterDiagStatus::NoQuorum.is_uncertain());
        assert!(!ClusterDiagStatus::Offline.is_uncertain());
    }
}
