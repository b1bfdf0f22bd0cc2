//! The `InnoDBCluster` custom resource and the naming contract shared with
//! the server pods (labels, annotations, finalizers, readiness gate).

use common_lib::types::{
    ClusterDiagStatus, ClusterKey, ClusterRecord, ClusterResourceStatus, ClusterSpec, DumpStorage,
    InitDb, InitDbClone, InitDbDump, OciObjectStorage,
};
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer on the cluster resource itself.
pub const CLUSTER_FINALIZER: &str = "mysql.oracle.com/cluster";
/// Finalizer present on every pod that may still be a GR member.
pub const MEMBER_FINALIZER: &str = "mysql.oracle.com/membership";
/// Pod annotation holding the persisted membership facts.
pub const MEMBERSHIP_INFO_ANNOTATION: &str = "mysql.oracle.com/membership-info";
/// Pod annotation with the container restart count last seen by dispatch.
pub const OBSERVED_RESTARTS_ANNOTATION: &str = "mysql.oracle.com/observed-restarts";
/// Pod annotation marking that `on_pod_created` completed.
pub const CONFIGURED_ANNOTATION: &str = "mysql.oracle.com/configured";
/// Label linking server pods to their cluster resource.
pub const CLUSTER_LABEL: &str = "mysql.oracle.com/cluster";
/// Readiness-gate condition toggled with the member's ONLINE state.
pub const READY_CONDITION: &str = "mysql.oracle.com/ready";

/// Declared specification of an InnoDB Cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "mysql.oracle.com",
    version = "v2",
    kind = "InnoDBCluster",
    namespaced,
    status = "InnoDBClusterStatus",
    shortname = "ic"
)]
#[serde(rename_all = "camelCase")]
pub struct InnoDBClusterSpec {
    /// Number of MySQL server instances.
    pub instances: u32,
    /// Secret with the operator's admin account credentials.
    pub secret_name: String,
    /// Router deployment settings.
    #[serde(default)]
    pub router: RouterSpec,
    /// Use self-signed certificates for group communication.
    #[serde(default = "default_true")]
    pub tls_use_self_signed: bool,
    /// Initial data source for the seed instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_db: Option<InitDbSpec>,
    /// Server image version tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    /// Number of router instances to deploy once the cluster is complete.
    #[serde(default)]
    pub instances: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitDbSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<InitDbCloneSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump: Option<InitDbDumpSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitDbCloneSpec {
    /// URI of the donor instance.
    pub uri: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitDbDumpSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub storage: DumpStorageSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DumpStorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_object_storage: Option<OciObjectStorageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OciObjectStorageSpec {
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Observed status of an InnoDB Cluster, maintained by the operator.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InnoDBClusterStatus {
    /// The last diagnosed cluster state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<String>,
    /// Stamped exactly once, when the group is first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    /// Where the initial dataset came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_data_source: Option<String>,
}

impl InnoDBCluster {
    /// The stable identity of this resource.
    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(
            self.metadata.namespace.as_deref().unwrap_or_default(),
            &self.name(),
        )
    }

    /// Snapshot this resource into the plain record the core works on.
    pub fn to_record(&self) -> ClusterRecord {
        let status = self.status.clone().unwrap_or_default();
        ClusterRecord {
            key: self.key(),
            spec: ClusterSpec {
                instances: self.spec.instances,
                router_instances: self.spec.router.instances,
                tls_use_self_signed: self.spec.tls_use_self_signed,
                init_db: self.spec.init_db.as_ref().map(InitDbSpec::to_value),
                version: self.spec.version.clone(),
            },
            deleting: self.metadata.deletion_timestamp.is_some(),
            create_time: parse_time(status.create_time.as_deref()),
            initial_data_source: status.initial_data_source.clone(),
            status: to_resource_status(&status),
        }
    }
}

impl InitDbSpec {
    fn to_value(&self) -> InitDb {
        InitDb {
            clone: self.clone.as_ref().map(|clone| InitDbClone {
                uri: clone.uri.clone(),
            }),
            dump: self.dump.as_ref().map(|dump| InitDbDump {
                name: dump.name.clone(),
                storage: DumpStorage {
                    oci_object_storage: dump.storage.oci_object_storage.as_ref().map(|oci| {
                        OciObjectStorage {
                            bucket_name: oci.bucket_name.clone(),
                            prefix: oci.prefix.clone(),
                        }
                    }),
                    persistent_volume_claim: dump.storage.persistent_volume_claim.clone(),
                },
            }),
        }
    }
}

fn parse_time(source: Option<&str>) -> Option<DateTime<Utc>> {
    source
        .and_then(|time| DateTime::parse_from_rfc3339(time).ok())
        .map(|time| time.with_timezone(&Utc))
}

fn to_resource_status(status: &InnoDBClusterStatus) -> Option<ClusterResourceStatus> {
    let diag = status.status.as_deref()?.parse::<ClusterDiagStatus>().ok()?;
    Some(ClusterResourceStatus {
        status: diag,
        online_instances: status.online_instances.unwrap_or(0),
        last_probe_time: parse_time(status.last_probe_time.as_deref())?,
    })
}

/// Ordinal of a server pod, from its StatefulSet name `<cluster>-<index>`.
pub fn pod_index(cluster: &str, pod_name: &str) -> Option<u32> {
    pod_name
        .strip_prefix(cluster)
        .and_then(|suffix| suffix.strip_prefix('-'))
        .and_then(|ordinal| ordinal.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_ordinals_come_from_the_name() {
        assert_eq!(pod_index("mycluster", "mycluster-0"), Some(0));
        assert_eq!(pod_index("mycluster", "mycluster-12"), Some(12));
        assert_eq!(pod_index("mycluster", "other-1"), None);
        assert_eq!(pod_index("mycluster", "mycluster"), None);
    }

    #[test]
    fn status_parses_into_the_typed_record() {
        let status = InnoDBClusterStatus {
            status: Some("ONLINE_PARTIAL".into()),
            online_instances: Some(2),
            last_probe_time: Some("2022-04-02T10:00:00Z".into()),
            create_time: Some("2022-04-01T00:00:00Z".into()),
            initial_data_source: Some("blank".into()),
        };
        let typed = to_resource_status(&status).unwrap();
        assert_eq!(typed.status, ClusterDiagStatus::OnlinePartial);
        assert_eq!(typed.online_instances, 2);
        assert!(parse_time(status.create_time.as_deref()).is_some());
    }
}
