//! The owning registry over cluster and pod state.
//!
//! Everything the reconciler knows about Kubernetes goes through the
//! [`ClusterApi`] trait: reading cluster/pod snapshots and writing the
//! annotations, finalizers, conditions, status fields and events that make
//! up the operator's externally visible state. Production uses the kube
//! client; tests substitute an in-memory registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Event as K8sEvent, ObjectReference, Pod, PodCondition, Secret},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;

use common_lib::{
    mysql::MembershipProbe,
    types::{ClusterKey, ClusterRecord, ClusterResourceStatus, MembershipInfo, PodRecord},
};

use crate::{
    config,
    crd::{
        self, InnoDBCluster, CLUSTER_LABEL, MEMBERSHIP_INFO_ANNOTATION, MEMBER_FINALIZER,
        READY_CONDITION,
    },
    error::Error,
};

/// Accounts provisioned by the operator on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Router,
    Backup,
}

impl AccountKind {
    /// Fixed user name of the account.
    pub fn user(&self) -> &'static str {
        match self {
            AccountKind::Router => config::ROUTER_METADATA_USER_NAME,
            AccountKind::Backup => config::BACKUP_USER_NAME,
        }
    }

    fn secret_key(&self) -> &'static str {
        match self {
            AccountKind::Router => "routerPassword",
            AccountKind::Backup => "backupPassword",
        }
    }
}

/// Key of the operator admin password within the cluster secret.
const ADMIN_PASSWORD_KEY: &str = "adminPassword";

/// Registry of cluster and pod state.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Current snapshot of the cluster resource.
    async fn cluster(&self, key: &ClusterKey) -> Result<ClusterRecord, Error>;

    /// All server pods of the cluster, ordered by ordinal.
    async fn pods(&self, key: &ClusterKey) -> Result<Vec<PodRecord>, Error>;

    /// Persist a pod's membership annotation. `last_transition_time` only
    /// advances when role, status or view actually changed.
    async fn update_membership(
        &self,
        pod: &PodRecord,
        probe: &MembershipProbe,
        joined: bool,
    ) -> Result<MembershipInfo, Error>;

    /// Toggle the member readiness-gate condition on the pod.
    async fn set_member_ready(&self, pod: &PodRecord, ready: bool) -> Result<(), Error>;

    /// Mark the pod as a (potential) GR member, blocking its deletion.
    async fn add_member_finalizer(&self, pod: &PodRecord) -> Result<(), Error>;

    /// Clear the membership finalizer, unblocking pod deletion.
    async fn remove_member_finalizer(&self, pod: &PodRecord) -> Result<(), Error>;

    /// Write the observed status to the cluster status subresource.
    async fn publish_cluster_status(
        &self,
        key: &ClusterKey,
        status: &ClusterResourceStatus,
    ) -> Result<(), Error>;

    /// Stamp the creation time of the group. Written exactly once.
    async fn set_create_time(&self, key: &ClusterKey, time: DateTime<Utc>) -> Result<(), Error>;

    /// Record where the initial dataset came from.
    async fn set_initial_data_source(&self, key: &ClusterKey, source: &str) -> Result<(), Error>;

    /// Post a Kubernetes event about the cluster.
    async fn post_event(
        &self,
        key: &ClusterKey,
        action: &str,
        reason: &str,
        message: &str,
        type_: &str,
    ) -> Result<(), Error>;

    /// Replica count of the router deployment, `None` when never sized.
    async fn router_size(&self, key: &ClusterKey) -> Result<Option<u32>, Error>;

    /// Scale the router deployment.
    async fn scale_router(&self, key: &ClusterKey, instances: u32) -> Result<(), Error>;

    /// Credentials of an operator-managed account, from the cluster secret.
    async fn account(&self, key: &ClusterKey, kind: AccountKind)
        -> Result<(String, String), Error>;
}

/// Manager name used for server-side apply/patch attribution.
const MANAGER: &str = "idc-operator";

/// [`ClusterApi`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    admin_user: String,
}

impl KubeClusterApi {
    /// Return a new `Self` using the given client.
    pub fn new(client: Client, admin_user: &str) -> Self {
        Self {
            client,
            admin_user: admin_user.to_string(),
        }
    }

    fn clusters(&self, key: &ClusterKey) -> Api<InnoDBCluster> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    fn pods_api(&self, key: &ClusterKey) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    async fn admin_password(&self, key: &ClusterKey) -> Result<Option<String>, Error> {
        let cluster = self.clusters(key).get(&key.name).await?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        match secrets.get(&cluster.spec.secret_name).await {
            Ok(secret) => Ok(secret_value(&secret, ADMIN_PASSWORD_KEY)),
            // The secret may lag behind the cluster resource; probes then
            // run without credentials and report unreachable members.
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn pod_record(&self, key: &ClusterKey, pod: &Pod, password: Option<&str>) -> Option<PodRecord> {
        let index = crd::pod_index(&key.name, &pod.name())?;
        let mut record = PodRecord::new(key, index, &self.admin_user);
        record.deleting = pod.metadata.deletion_timestamp.is_some();
        record.pod_ip_address = pod.status.as_ref().and_then(|status| status.pod_ip.clone());
        record.membership_info = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(MEMBERSHIP_INFO_ANNOTATION))
            .and_then(|value| serde_json::from_str(value).ok());
        record.member_finalizer = pod
            .metadata
            .finalizers
            .as_ref()
            .map(|finalizers| finalizers.iter().any(|f| f == MEMBER_FINALIZER))
            .unwrap_or(false);
        record.endpoint_co.password = password.map(Into::into);
        Some(record)
    }
}

fn secret_value(secret: &Secret, secret_key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(secret_key))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
}

/// The name of the cluster's router deployment.
fn router_deployment_name(key: &ClusterKey) -> String {
    format!("{}-router", key.name)
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn cluster(&self, key: &ClusterKey) -> Result<ClusterRecord, Error> {
        Ok(self.clusters(key).get(&key.name).await?.to_record())
    }

    async fn pods(&self, key: &ClusterKey) -> Result<Vec<PodRecord>, Error> {
        let password = self.admin_password(key).await?;
        let lp = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, key.name));
        let pods = self.pods_api(key).list(&lp).await?;
        let mut records: Vec<PodRecord> = pods
            .iter()
            .filter_map(|pod| self.pod_record(key, pod, password.as_deref()))
            .collect();
        records.sort_by_key(|record| record.index);
        Ok(records)
    }

    async fn update_membership(
        &self,
        pod: &PodRecord,
        probe: &MembershipProbe,
        joined: bool,
    ) -> Result<MembershipInfo, Error> {
        let info =
            MembershipInfo::from_probe(probe, joined, pod.membership_info.as_ref(), Utc::now());
        let patch = json!({
            "metadata": {
                "annotations": {
                    MEMBERSHIP_INFO_ANNOTATION: serde_json::to_string(&info)?,
                }
            }
        });
        self.pods_api(&pod.cluster)
            .patch(&pod.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(info)
    }

    async fn set_member_ready(&self, pod: &PodRecord, ready: bool) -> Result<(), Error> {
        let api = self.pods_api(&pod.cluster);
        let current = api.get(&pod.name).await?;
        let mut conditions = current
            .status
            .as_ref()
            .and_then(|status| status.conditions.clone())
            .unwrap_or_default();
        let status = if ready { "True" } else { "False" };
        match conditions
            .iter_mut()
            .find(|condition| condition.type_ == READY_CONDITION)
        {
            Some(condition) if condition.status == status => return Ok(()),
            Some(condition) => {
                condition.status = status.to_string();
                condition.last_transition_time = Some(Time(Utc::now()));
            }
            None => conditions.push(PodCondition {
                type_: READY_CONDITION.to_string(),
                status: status.to_string(),
                last_transition_time: Some(Time(Utc::now())),
                ..Default::default()
            }),
        }
        let patch = json!({ "status": { "conditions": conditions } });
        api.patch_status(&pod.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_member_finalizer(&self, pod: &PodRecord) -> Result<(), Error> {
        let api = self.pods_api(&pod.cluster);
        let current = api.get(&pod.name).await?;
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == MEMBER_FINALIZER) {
            return Ok(());
        }
        finalizers.push(MEMBER_FINALIZER.to_string());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(&pod.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_member_finalizer(&self, pod: &PodRecord) -> Result<(), Error> {
        let api = self.pods_api(&pod.cluster);
        let current = match api.get(&pod.name).await {
            Ok(pod) => pod,
            // Pod already gone, nothing left to unblock.
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let finalizers: Vec<String> = current
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != MEMBER_FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(&pod.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn publish_cluster_status(
        &self,
        key: &ClusterKey,
        status: &ClusterResourceStatus,
    ) -> Result<(), Error> {
        let patch = json!({
            "status": {
                "status": status.status.to_string(),
                "onlineInstances": status.online_instances,
                "lastProbeTime": status.last_probe_time.to_rfc3339(),
            }
        });
        self.clusters(key)
            .patch_status(&key.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_create_time(&self, key: &ClusterKey, time: DateTime<Utc>) -> Result<(), Error> {
        let patch = json!({ "status": { "createTime": time.to_rfc3339() } });
        self.clusters(key)
            .patch_status(&key.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_initial_data_source(&self, key: &ClusterKey, source: &str) -> Result<(), Error> {
        let patch = json!({ "status": { "initialDataSource": source } });
        self.clusters(key)
            .patch_status(&key.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn post_event(
        &self,
        key: &ClusterKey,
        action: &str,
        reason: &str,
        message: &str,
        type_: &str,
    ) -> Result<(), Error> {
        let events: Api<K8sEvent> = Api::namespaced(self.client.clone(), &key.namespace);
        let time = Utc::now();
        let metadata = ObjectMeta {
            // the name must be unique for all events we post
            generate_name: Some(format!("{}.{:x}", key.name, time.timestamp())),
            namespace: Some(key.namespace.clone()),
            ..Default::default()
        };
        events
            .create(
                &PostParams::default(),
                &K8sEvent {
                    event_time: Some(MicroTime(time)),
                    involved_object: ObjectReference {
                        api_version: Some("mysql.oracle.com/v2".to_string()),
                        kind: Some("InnoDBCluster".to_string()),
                        name: Some(key.name.clone()),
                        namespace: Some(key.namespace.clone()),
                        ..Default::default()
                    },
                    action: Some(action.into()),
                    reason: Some(reason.into()),
                    type_: Some(type_.into()),
                    metadata,
                    reporting_component: Some(MANAGER.into()),
                    reporting_instance: Some(
                        std::env::var("POD_NAME").unwrap_or_else(|_| MANAGER.into()),
                    ),
                    message: Some(message.into()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn router_size(&self, key: &ClusterKey) -> Result<Option<u32>, Error> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        match deployments.get(&router_deployment_name(key)).await {
            Ok(deployment) => Ok(deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.replicas)
                .map(|replicas| replicas as u32)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn scale_router(&self, key: &ClusterKey, instances: u32) -> Result<(), Error> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        let name = router_deployment_name(key);
        let patch = json!({ "spec": { "replicas": instances } });
        match deployments
            .patch(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                tracing::warn!(deployment = %name, "router deployment not found, skipping resize");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn account(
        &self,
        key: &ClusterKey,
        kind: AccountKind,
    ) -> Result<(String, String), Error> {
        let cluster = self.clusters(key).get(&key.name).await?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        let secret = secrets.get(&cluster.spec.secret_name).await?;
        let password = secret_value(&secret, kind.secret_key()).ok_or_else(|| {
            Error::InvalidResource {
                reason: format!(
                    "secret '{}' is missing the '{}' key",
                    cluster.spec.secret_name,
                    kind.secret_key()
                ),
            }
        })?;
        Ok((kind.user().to_string(), password))
    }
}
