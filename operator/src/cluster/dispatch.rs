//! Operator wiring: CRD installation, the cluster controller loop and the
//! pod watcher that turns pod lifecycle changes into reconciler events.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client, CustomResourceExt, ResourceExt,
};
use kube_runtime::{
    controller::{Context, Controller, ReconcilerAction},
    watcher,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

use common_lib::{lock::ClusterLockRegistry, mysql::AdminClient, types::ClusterKey};

use crate::{
    cluster::{api::ClusterApi, controller::ClusterController},
    config::OperatorConfig,
    crd::{
        self, InnoDBCluster, CLUSTER_FINALIZER, CLUSTER_LABEL, CONFIGURED_ANNOTATION,
        MEMBER_FINALIZER, OBSERVED_RESTARTS_ANNOTATION,
    },
    error::Error,
};

const MANAGER: &str = "idc-operator";

/// Shared state for the controller loop and the pod dispatcher.
#[derive(Clone)]
pub struct OperatorContext {
    pub client: Client,
    pub api: Arc<dyn ClusterApi>,
    pub admin: Arc<dyn AdminClient>,
    pub locks: ClusterLockRegistry,
    pub config: OperatorConfig,
    pub namespace: String,
    /// How often a healthy cluster is re-probed.
    pub probe_interval: Duration,
}

impl OperatorContext {
    async fn controller_for(&self, key: &ClusterKey) -> Result<ClusterController, Error> {
        let cluster = self.api.cluster(key).await?;
        Ok(ClusterController::new(
            self.api.clone(),
            self.admin.clone(),
            self.locks.clone(),
            self.config.clone(),
            cluster,
        ))
    }
}

/// A pod lifecycle change relevant to the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub cluster: ClusterKey,
    pub pod_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Created,
    Restarted,
    Deleted,
}

/// Name of the InnoDBCluster custom resource definition.
const CRD_NAME: &str = "innodbclusters.mysql.oracle.com";

/// Install the InnoDBCluster CRD if the apiserver does not know it yet.
/// Nothing below can run without it, so failures bubble up and end startup;
/// a restart retries the installation.
pub async fn ensure_crd(client: Client) -> Result<(), Error> {
    let crds: Api<
        k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    > = Api::all(client);

    match crds.get(CRD_NAME).await {
        Ok(_) => {
            tracing::debug!(crd = CRD_NAME, "CRD already installed");
            return Ok(());
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    tracing::info!(crd = CRD_NAME, "installing CRD");
    match crds.create(&PostParams::default(), &InnoDBCluster::crd()).await {
        Ok(_) => {
            // Give the apiserver a moment to publish the new discovery
            // data before the controller starts listing the resource.
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }
        // Another operator replica raced us to it.
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Run the operator: the cluster controller plus the pod dispatcher.
/// Blocks until the watch streams end.
pub async fn run(ctx: OperatorContext) {
    let (tx, mut rx) = mpsc::channel::<PodEvent>(64);

    let watch_ctx = ctx.clone();
    let watch_tx = tx.clone();
    tokio::spawn(async move {
        watch_pods(watch_ctx, watch_tx).await;
    });

    let worker_ctx = ctx.clone();
    let requeue_tx = tx;
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_pod_event(&worker_ctx, event, &requeue_tx).await;
        }
    });

    let clusters: Api<InnoDBCluster> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    tracing::info!(namespace = %ctx.namespace, "starting InnoDBCluster controller");
    Controller::new(clusters, ListParams::default())
        .run(reconcile, error_policy, Context::new(ctx))
        .for_each(|result| async move {
            match result {
                Ok(reconciled) => tracing::trace!(?reconciled),
                Err(error) => tracing::trace!(%error),
            }
        })
        .await;
}

/// Periodic cluster-level reconciliation: keep the observed status fresh
/// and release the cluster finalizer once the pods have drained.
async fn reconcile(
    cluster: InnoDBCluster,
    ctx: Context<OperatorContext>,
) -> Result<ReconcilerAction, Error> {
    let ctx = ctx.into_inner();
    let record = cluster.to_record();

    if record.deleting {
        let pods = ctx.api.pods(&record.key).await?;
        if pods.is_empty() {
            remove_cluster_finalizer(&ctx.client, &record.key).await?;
            return Ok(ReconcilerAction {
                requeue_after: None,
            });
        }
        // Pod deletion events drive the member teardown.
        return Ok(ReconcilerAction {
            requeue_after: Some(Duration::from_secs(5)),
        });
    }

    ensure_cluster_finalizer(&ctx.client, &record.key).await?;

    let mut controller = ClusterController::new(
        ctx.api.clone(),
        ctx.admin.clone(),
        ctx.locks.clone(),
        ctx.config.clone(),
        record,
    );
    controller.probe_status().await?;
    Ok(ReconcilerAction {
        requeue_after: Some(ctx.probe_interval),
    })
}

fn error_policy(error: &Error, _ctx: Context<OperatorContext>) -> ReconcilerAction {
    match error.requeue_after() {
        Some(duration) => {
            tracing::warn!(%error, retry_in = ?duration, "cluster reconciliation failed");
            ReconcilerAction {
                requeue_after: Some(duration),
            }
        }
        None => {
            tracing::error!(%error, "cluster reconciliation failed, not requeuing");
            ReconcilerAction {
                requeue_after: None,
            }
        }
    }
}

async fn ensure_cluster_finalizer(client: &Client, key: &ClusterKey) -> Result<(), Error> {
    let api: Api<InnoDBCluster> = Api::namespaced(client.clone(), &key.namespace);
    let cluster = api.get(&key.name).await?;
    let mut finalizers = cluster.metadata.finalizers.unwrap_or_default();
    if finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
        return Ok(());
    }
    finalizers.push(CLUSTER_FINALIZER.to_string());
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&key.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_cluster_finalizer(client: &Client, key: &ClusterKey) -> Result<(), Error> {
    let api: Api<InnoDBCluster> = Api::namespaced(client.clone(), &key.namespace);
    let cluster = match api.get(&key.name).await {
        Ok(cluster) => cluster,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let finalizers: Vec<String> = cluster
        .metadata
        .finalizers
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != CLUSTER_FINALIZER)
        .collect();
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&key.name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Watch the server pods and feed classified events to the dispatcher.
async fn watch_pods(ctx: OperatorContext, tx: mpsc::Sender<PodEvent>) {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let lp = ListParams::default().labels(CLUSTER_LABEL);
    tracing::info!(namespace = %ctx.namespace, "starting pod watch");
    let mut stream = watcher(pods.clone(), lp).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(pod)) => {
                if let Some(event) = classify_pod_event(&pods, &pod).await {
                    let _ = tx.send(event).await;
                }
            }
            Ok(watcher::Event::Restarted(list)) => {
                for pod in list {
                    if let Some(event) = classify_pod_event(&pods, &pod).await {
                        let _ = tx.send(event).await;
                    }
                }
            }
            // Fully gone; removal already ran while the finalizer held it.
            Ok(watcher::Event::Deleted(_)) => {}
            Err(error) => {
                tracing::warn!(%error, "pod watch error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Map a pod update onto a reconciler event, tracking restart counts via a
/// pod annotation so each restart fires exactly once.
async fn classify_pod_event(pods: &Api<Pod>, pod: &Pod) -> Option<PodEvent> {
    let labels = pod.metadata.labels.as_ref()?;
    let cluster_name = labels.get(CLUSTER_LABEL)?;
    let namespace = pod.namespace()?;
    let index = crd::pod_index(cluster_name, &pod.name())?;
    let key = ClusterKey::new(&namespace, cluster_name);

    if pod.metadata.deletion_timestamp.is_some() {
        let held = pod
            .metadata
            .finalizers
            .as_ref()
            .map(|finalizers| finalizers.iter().any(|f| f == MEMBER_FINALIZER))
            .unwrap_or(false);
        return if held {
            Some(PodEvent {
                kind: PodEventKind::Deleted,
                cluster: key,
                pod_index: index,
            })
        } else {
            None
        };
    }

    let restarts = restart_count(pod);
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();

    if !annotations.contains_key(CONFIGURED_ANNOTATION) {
        if !pod_running(pod) {
            return None;
        }
        return Some(PodEvent {
            kind: PodEventKind::Created,
            cluster: key,
            pod_index: index,
        });
    }

    let observed: i32 = annotations
        .get(OBSERVED_RESTARTS_ANNOTATION)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    if restarts > observed && pod_running(pod) {
        if let Err(error) = annotate(pods, &pod.name(), OBSERVED_RESTARTS_ANNOTATION, &restarts.to_string()).await
        {
            tracing::warn!(%error, pod.name = %pod.name(), "failed to record restart count");
        }
        return Some(PodEvent {
            kind: PodEventKind::Restarted,
            cluster: key,
            pod_index: index,
        });
    }
    None
}

fn restart_count(pod: &Pod) -> i32 {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(|status| status.restart_count).sum())
        .unwrap_or(0)
}

fn pod_running(pod: &Pod) -> bool {
    let running_phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");
    let containers_running = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().all(|status| {
                status
                    .state
                    .as_ref()
                    .map(|state| state.running.is_some())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    running_phase && containers_running
}

async fn annotate(pods: &Api<Pod>, name: &str, annotation: &str, value: &str) -> Result<(), Error> {
    let patch = json!({ "metadata": { "annotations": { annotation: value } } });
    pods.patch(name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Run one pod event through the reconciler; transient failures requeue
/// through the channel, permanent ones stop with an error log.
async fn handle_pod_event(ctx: &OperatorContext, event: PodEvent, requeue: &mpsc::Sender<PodEvent>) {
    match dispatch_pod_event(ctx, &event).await {
        Ok(()) => {
            if event.kind == PodEventKind::Created {
                let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &event.cluster.namespace);
                let name = format!("{}-{}", event.cluster.name, event.pod_index);
                if let Err(error) = annotate(&pods, &name, CONFIGURED_ANNOTATION, "true").await {
                    tracing::warn!(%error, pod.name = %name, "failed to mark pod configured");
                }
            }
        }
        Err(error) => match error.requeue_after() {
            Some(delay) => {
                tracing::warn!(
                    %error,
                    event = ?event,
                    retry_in = ?delay,
                    "pod event failed, requeuing"
                );
                let requeue = requeue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue.send(event).await;
                });
            }
            None => {
                tracing::error!(%error, event = ?event, "pod event failed permanently");
            }
        },
    }
}

async fn dispatch_pod_event(ctx: &OperatorContext, event: &PodEvent) -> Result<(), Error> {
    let mut controller = ctx.controller_for(&event.cluster).await?;
    let pods = ctx.api.pods(&event.cluster).await?;
    let pod = pods.iter().find(|pod| pod.index == event.pod_index).cloned();
    let pod = match pod {
        Some(pod) => pod,
        // The pod disappeared between the watch event and now; the next
        // event for it will carry the fresh state.
        None => return Ok(()),
    };
    match event.kind {
        PodEventKind::Created => controller.on_pod_created(&pod).await,
        PodEventKind::Restarted => controller.on_pod_restarted(&pod).await,
        PodEventKind::Deleted => controller.on_pod_deleted(&pod).await,
    }
}
