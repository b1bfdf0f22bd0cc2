//! The cluster reconciler.
//!
//! One controller instance drives one cluster for the duration of one
//! event: it probes the group, derives a diagnosis, then executes the
//! admin action the decision table calls for. All mutating paths hold the
//! cluster's action lock and follow finalizer-before-admin-call ordering.

use chrono::Utc;
use std::{sync::Arc, time::Duration};

use common_lib::{
    lock::{ClusterGuard, ClusterLockRegistry},
    mysql::{
        AddInstanceOptions, AdminClient, AdminError, CreateClusterOptions, DbaSession,
        ExitStateAction, GroupCluster, MembershipProbe, RecoveryMethod, RemoveInstanceOptions,
        RouterAccountOptions, SslMode,
    },
    types::{
        CandidateDiagStatus, ClusterDiagStatus, ClusterDiagnosis, ClusterRecord,
        ClusterResourceStatus, MemberRole, MemberStatus, PodRecord,
    },
};

use crate::{
    cluster::{
        api::{AccountKind, ClusterApi},
        diagnose::{self, CandidateFacts, CandidateState, ClusterFacts},
        probe, status,
    },
    config::{self, OperatorConfig},
    error::Error,
    with_retries,
};

/// One member row of a group-view-change notification.
#[derive(Debug, Clone)]
pub struct GroupViewMember {
    pub member_id: String,
    pub role: Option<MemberRole>,
    pub status: MemberStatus,
    pub view_id: Option<String>,
    pub endpoint: String,
    pub version: Option<String>,
}

/// Drives the lifecycle of one InnoDB Cluster: creation, scaling, member
/// reconciliation and restoring from outages.
pub struct ClusterController {
    api: Arc<dyn ClusterApi>,
    admin: Arc<dyn AdminClient>,
    locks: ClusterLockRegistry,
    config: OperatorConfig,
    cluster: ClusterRecord,
    dba: Option<Box<dyn DbaSession>>,
    dba_cluster: Option<Box<dyn GroupCluster>>,
}

impl ClusterController {
    /// Return a new `Self` for one reconciliation pass over `cluster`.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        admin: Arc<dyn AdminClient>,
        locks: ClusterLockRegistry,
        config: OperatorConfig,
        cluster: ClusterRecord,
    ) -> Self {
        Self {
            api,
            admin,
            locks,
            config,
            cluster,
            dba: None,
            dba_cluster: None,
        }
    }

    /// The cluster snapshot this controller works on.
    pub fn record(&self) -> &ClusterRecord {
        &self.cluster
    }

    fn lock(&self, owner: &str) -> Result<ClusterGuard, Error> {
        self.locks
            .try_acquire(&self.cluster.key, owner)
            .map_err(|holder| Error::ClusterBusy {
                cluster: self.cluster.key.to_string(),
                owner: holder,
            })
    }

    fn group(&mut self) -> Result<&mut (dyn GroupCluster + '_), Error> {
        match self.dba_cluster.as_deref_mut() {
            Some(cluster) => Ok(cluster),
            None => Err(Error::permanent("no cluster handle available")),
        }
    }

    fn create_allow_list(&self, pod: &PodRecord) -> String {
        let mut allowlist = String::new();
        if let Some(ip) = &pod.pod_ip_address {
            allowlist.push_str(ip);
            allowlist.push_str("/8,");
        }
        allowlist.push_str(&config::ip_allowlist_extra());
        tracing::info!(pod.name = %pod.name, ip.allowlist = %allowlist, "member allowlist");
        allowlist
    }

    async fn connect_pod(&self, pod: &PodRecord) -> Result<Box<dyn DbaSession>, Error> {
        Ok(self.admin.connect_dba(&pod.endpoint_co).await?)
    }

    /// Probe the whole cluster and publish the result (unless deleting).
    pub async fn probe_status(&mut self) -> Result<ClusterDiagnosis, Error> {
        let pods = self.api.pods(&self.cluster.key).await?;
        let probes = diagnose::gather_probes(
            self.admin.as_ref(),
            &pods,
            self.config.probe_timeout,
            self.config.probe_fanout,
        )
        .await;
        let diag = diagnose::classify(&ClusterFacts::from(&self.cluster), &probes);
        if !self.cluster.deleting {
            status::publish_status(self.api.as_ref(), &self.cluster, &diag).await?;
            self.cluster.status = Some(ClusterResourceStatus {
                status: diag.status,
                online_instances: diag.online_members.len() as u32,
                last_probe_time: Utc::now(),
            });
        }
        tracing::info!(
            cluster = %self.cluster.key,
            status = %diag.status,
            online = ?diag.online_members,
            "cluster probe"
        );
        Ok(diag)
    }

    /// Reuse the published status when it postdates the pod's last
    /// membership transition and was certain; re-diagnose otherwise.
    pub async fn probe_status_if_needed(
        &mut self,
        changed_pod: &PodRecord,
    ) -> Result<ClusterDiagStatus, Error> {
        match status::needs_probe(&self.cluster, changed_pod) {
            Some(cached) => Ok(cached),
            None => Ok(self.probe_status().await?.status),
        }
    }

    /// Walk the pods and connect to the first member that can hand out a
    /// cluster handle. Members that answer but are not ONLINE are noted; if
    /// every candidate is in that state the whole group is down and only a
    /// reboot can help, so the caller gets a transient error.
    async fn connect_to_cluster(&mut self) -> Result<PodRecord, Error> {
        let pods = self.api.pods(&self.cluster.key).await?;
        let mut offline = 0usize;
        let mut candidates = 0usize;
        let mut last_error: Option<AdminError> = None;
        for pod in pods.iter().filter(|pod| !pod.deleting) {
            candidates += 1;
            let mut session = match self.admin.connect_dba(&pod.endpoint_co).await {
                Ok(session) => session,
                Err(error) => {
                    tracing::debug!(pod.name = %pod.name, %error, "connect_dba failed");
                    last_error = Some(error);
                    continue;
                }
            };
            match session.get_cluster().await {
                Ok(cluster) => {
                    tracing::info!(pod.name = %pod.name, "connected to cluster");
                    self.dba = Some(session);
                    self.dba_cluster = Some(cluster);
                    return Ok(pod.clone());
                }
                Err(AdminError::InstanceNotOnline { .. }) => {
                    // No chance of a cluster handle from this member.
                    offline += 1;
                }
                Err(error) => {
                    tracing::info!(pod.name = %pod.name, %error, "get_cluster failed");
                }
            }
        }
        if candidates > 0 && offline == candidates {
            return Err(Error::transient(
                "Could not connect to any cluster member",
                Duration::from_secs(15),
            ));
        }
        match last_error {
            Some(error) => Err(error.into()),
            None => Err(Error::transient(
                "Could not connect to any cluster member",
                Duration::from_secs(15),
            )),
        }
    }

    async fn connect_to_primary(&mut self, primary: Option<&PodRecord>) -> Result<(), Error> {
        match primary {
            Some(pod) => {
                let mut session = self.connect_pod(pod).await?;
                let cluster = session.get_cluster().await?;
                self.dba = Some(session);
                self.dba_cluster = Some(cluster);
                Ok(())
            }
            None => self.connect_to_cluster().await.map(|_| ()),
        }
    }

    /// Create the group on the seed instance. The member finalizer goes on
    /// before the admin call and comes off if creation fails.
    #[tracing::instrument(skip(self, seed), fields(cluster = %self.cluster.key, seed = %seed.name))]
    pub async fn create_cluster(&mut self, seed: &PodRecord) -> Result<(), Error> {
        tracing::info!("creating cluster");

        let mut gtid_set_is_complete = false;
        match &self.cluster.spec.init_db {
            None => {
                // Blank cluster: whatever GTIDs exist were executed here.
                gtid_set_is_complete = true;
                self.api
                    .set_initial_data_source(&self.cluster.key, "blank")
                    .await?;
            }
            Some(init_db) => {
                if let Some(clone) = &init_db.clone {
                    self.api
                        .set_initial_data_source(
                            &self.cluster.key,
                            &format!("clone={}", clone.uri),
                        )
                        .await?;
                } else if let Some(dump) = &init_db.dump {
                    if let Some(oci) = &dump.storage.oci_object_storage {
                        self.api
                            .set_initial_data_source(
                                &self.cluster.key,
                                &format!("dump={}", oci.bucket_name),
                            )
                            .await?;
                    } else if dump.storage.persistent_volume_claim.is_some() {
                        return Err(Error::permanent(
                            "dump restore from a PersistentVolumeClaim is not supported",
                        ));
                    } else {
                        return Err(Error::permanent("unknown dump storage mechanism"));
                    }
                } else {
                    return Err(Error::permanent("unknown initDB source"));
                }
            }
        }

        let options = CreateClusterOptions {
            gtid_set_is_complete,
            manual_start_on_boot: true,
            member_ssl_mode: if self.cluster.spec.tls_use_self_signed {
                SslMode::Required
            } else {
                SslMode::VerifyIdentity
            },
            ip_allowlist: self.create_allow_list(seed),
            exit_state_action: ExitStateAction::AbortServer,
        };

        let mut session = self.connect_pod(seed).await?;
        // maybe from a previous incomplete create attempt
        let existing = match session.get_cluster().await {
            Ok(cluster) => {
                tracing::info!("cluster already exists");
                Some(cluster)
            }
            Err(_) => None,
        };

        self.api.add_member_finalizer(seed).await?;

        match existing {
            Some(cluster) => self.dba_cluster = Some(cluster),
            None => {
                probe::log_mysql_info(session.as_mut()).await?;
                tracing::info!(seed = %seed.name, options = ?options, "create_cluster");
                match session
                    .create_cluster(&self.cluster.key.group_name(), &options)
                    .await
                {
                    Ok(cluster) => {
                        tracing::info!("create_cluster OK");
                        self.dba_cluster = Some(cluster);
                    }
                    Err(error) => {
                        // If creating the cluster failed, the pod is not a member.
                        self.api.remove_member_finalizer(seed).await?;

                        if let AdminError::InstanceAlreadyInGr { .. } = &error {
                            // can happen when retrying
                            tracing::info!(
                                endpoint = %seed.endpoint,
                                "GR already running, stopping before retrying"
                            );
                            if let Err(stop_error) = session.stop_group_replication().await {
                                tracing::info!(%stop_error, "could not stop GR plugin");
                                return Err(Error::transient(
                                    "GR already running while creating cluster but could not stop it",
                                    Duration::from_secs(3),
                                ));
                            }
                        }
                        return Err(error.into());
                    }
                }
            }
        }

        probe::probe_member(self.api.as_ref(), session.as_mut(), seed, true).await?;

        if let Some(cluster) = self.dba_cluster.as_deref_mut() {
            let cluster_status = cluster.status().await?;
            tracing::debug!(status = %cluster_status, "cluster created");
        }
        self.dba = Some(session);

        // A 1-instance cluster is complete right away; otherwise the last
        // join runs the post-create actions.
        if self.cluster.spec.instances == 1 {
            self.post_create_actions().await?;
        }
        Ok(())
    }

    /// Idempotent completion work once the declared size is first reached:
    /// router metadata account, backup account, router deployment size.
    pub async fn post_create_actions(&mut self) -> Result<(), Error> {
        tracing::info!("running post-create actions");
        let (router_user, router_password) =
            self.api.account(&self.cluster.key, AccountKind::Router).await?;
        let (backup_user, backup_password) =
            self.api.account(&self.cluster.key, AccountKind::Backup).await?;

        let session = self
            .dba
            .as_deref_mut()
            .ok_or_else(|| Error::permanent("no admin session for post-create actions"))?;
        // Existence probe: a missing grant means the account must be created.
        let update = session.user_has_grants(&router_user).await?;
        tracing::debug!(
            account = %router_user,
            update,
            "setting up router account"
        );
        self.dba_cluster
            .as_deref_mut()
            .ok_or_else(|| Error::permanent("no cluster handle available"))?
            .setup_router_account(
                &router_user,
                &RouterAccountOptions {
                    password: router_password,
                    update,
                },
            )
            .await?;

        tracing::debug!(account = %backup_user, "creating backup account");
        self.dba
            .as_deref_mut()
            .ok_or_else(|| Error::permanent("no admin session for post-create actions"))?
            .setup_backup_account(&backup_user, &backup_password)
            .await?;

        let router_instances = self.cluster.spec.router_instances;
        if router_instances > 0 {
            tracing::debug!(replicas = router_instances, "setting router replicas");
            self.api
                .scale_router(&self.cluster.key, router_instances)
                .await?;
        }
        Ok(())
    }

    /// Add a new member, trying incremental recovery first and falling back
    /// to clone: incremental is fast when the transaction gap is small,
    /// clone is unavoidable for large gaps or purged binlogs.
    #[tracing::instrument(skip(self, pod), fields(cluster = %self.cluster.key, pod.name = %pod.name))]
    pub async fn join_instance(&mut self, pod: &PodRecord) -> Result<(), Error> {
        tracing::info!(endpoint = %pod.endpoint, "adding instance to cluster");

        let mut pod_session = self.connect_pod(pod).await?;
        let peer = self.connect_to_cluster().await?;
        probe::log_mysql_info(pod_session.as_mut()).await?;

        let mut options = AddInstanceOptions {
            recovery_method: RecoveryMethod::Incremental,
            ip_allowlist: self.create_allow_list(pod),
            exit_state_action: ExitStateAction::AbortServer,
        };
        tracing::info!(
            target = %pod.endpoint,
            cluster_peer = %peer.endpoint,
            options = ?options,
            "add_instance"
        );

        self.api.add_member_finalizer(pod).await?;

        if let Err(error) = self.group()?.add_instance(&pod.endpoint_co, &options).await {
            // Incremental fails when transactions are missing from the
            // binlog; clone can always provision from scratch.
            tracing::warn!(%error, "add_instance failed");
            options.recovery_method = RecoveryMethod::Clone;
            tracing::warn!("trying add_instance with clone recovery");
            if let Err(error) = self.group()?.add_instance(&pod.endpoint_co, &options).await {
                tracing::warn!(%error, "add_instance failed second time");
                return Err(error.into());
            }
        }

        let minfo = probe::probe_member(self.api.as_ref(), pod_session.as_mut(), pod, true).await?;
        tracing::info!(pod.name = %pod.name, members = minfo.member_count, "joined");

        // If the cluster just reached its declared size and the routers were
        // never deployed, finish the cluster setup now.
        if minfo.member_count == self.cluster.spec.instances
            && self.api.router_size(&self.cluster.key).await?.is_none()
        {
            self.post_create_actions().await?;
        }
        Ok(())
    }

    /// Rejoin a former member that fell out of the group.
    #[tracing::instrument(skip(self, pod), fields(cluster = %self.cluster.key, pod.name = %pod.name))]
    pub async fn rejoin_instance(&mut self, pod: &PodRecord) -> Result<(), Error> {
        tracing::info!(endpoint = %pod.endpoint, "rejoining instance to cluster");

        if self.dba_cluster.is_none() {
            self.connect_to_cluster().await?;
        }
        let mut pod_session = self.connect_pod(pod).await?;
        probe::log_mysql_info(pod_session.as_mut()).await?;

        tracing::info!(target = %pod.endpoint, "rejoin_instance");
        if let Err(error) = self.group()?.rejoin_instance(&pod.endpoint).await {
            tracing::warn!(%error, "rejoin_instance failed");
            return Err(error.into());
        }

        probe::probe_member(self.api.as_ref(), pod_session.as_mut(), pod, false).await?;
        Ok(())
    }

    /// Remove a member and clear its finalizer. Removal of the last pod
    /// skips the group entirely. A member already gone from the metadata
    /// counts as removed.
    #[tracing::instrument(skip(self, pod), fields(cluster = %self.cluster.key, pod.name = %pod.name))]
    pub async fn remove_instance(&mut self, pod: &PodRecord) -> Result<(), Error> {
        tracing::info!(endpoint = %pod.endpoint, "removing instance from cluster");

        let pods = self.api.pods(&self.cluster.key).await?;
        if pods.len() > 1 {
            let peer = match self.connect_to_cluster().await {
                Ok(peer) => Some(peer),
                Err(error) => {
                    if self.cluster.deleting {
                        tracing::warn!(
                            %error,
                            "could not connect to cluster, ignoring because it is being deleted"
                        );
                        None
                    } else {
                        tracing::error!(%error, "could not connect to cluster");
                        return Err(error);
                    }
                }
            };

            if let Some(peer) = peer {
                let mut removed = false;
                tracing::info!(peer = %peer.name, "remove_instance");
                match self
                    .group()?
                    .remove_instance(&pod.endpoint, &RemoveInstanceOptions::default())
                    .await
                {
                    Ok(()) => {
                        removed = true;
                        tracing::debug!("remove_instance OK");
                    }
                    Err(AdminError::OptionPreventsStatement) => {
                        // super_read_only can still be ON on a PRIMARY for a
                        // short time
                        return Err(Error::transient(
                            format!("{} is a PRIMARY but super_read_only is ON", peer.name),
                            Duration::from_secs(5),
                        ));
                    }
                    Err(AdminError::MemberMetadataMissing) => {
                        // already removed and we're probably just retrying
                        removed = true;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "remove_instance failed");
                    }
                }

                if !removed {
                    let options = RemoveInstanceOptions { force: true };
                    tracing::info!(peer = %peer.name, options = ?options, "remove_instance");
                    match self.group()?.remove_instance(&pod.endpoint, &options).await {
                        Ok(()) | Err(AdminError::MemberMetadataMissing) => {}
                        Err(error) => {
                            if self.cluster.deleting {
                                tracing::info!(
                                    %error,
                                    "force remove_instance failed, ignoring because the cluster is being deleted"
                                );
                            } else {
                                tracing::error!(%error, "force remove_instance failed");
                                return Err(error.into());
                            }
                        }
                    }
                }
            } else {
                tracing::error!(
                    pod.name = %pod.name,
                    "cluster is not available, skipping clean removal"
                );
            }
        }

        // Unblock pod deletion.
        self.api.remove_member_finalizer(pod).await?;
        tracing::info!(pod.name = %pod.name, "removed member finalizer");
        Ok(())
    }

    /// Rebuild the group after a complete outage, seeding from the given
    /// pod, then rejoin the rest.
    #[tracing::instrument(skip(self), fields(cluster = %self.cluster.key, seed = seed_index))]
    pub async fn reboot_cluster(&mut self, seed_index: u32) -> Result<(), Error> {
        let pods = self.api.pods(&self.cluster.key).await?;
        let seed = pods
            .iter()
            .find(|pod| pod.index == seed_index)
            .ok_or_else(|| Error::permanent(format!("seed pod {} not found", seed_index)))?;
        tracing::info!(seed = %seed.name, "rebooting cluster from complete outage");

        let mut session = self.connect_pod(seed).await?;
        probe::log_mysql_info(session.as_mut()).await?;

        self.api.add_member_finalizer(seed).await?;

        let cluster = session.reboot_cluster_from_complete_outage().await?;
        self.dba_cluster = Some(cluster);
        tracing::info!("reboot_cluster_from_complete_outage OK");

        for pod in pods.iter().filter(|pod| pod.index != seed_index) {
            match tokio::time::timeout(self.config.probe_timeout, self.rejoin_instance(pod)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::transient(
                        format!("timed out rejoining {}", pod.name),
                        Duration::from_secs(5),
                    ));
                }
            }
        }

        let cluster_status = self.group()?.status().await?;
        tracing::info!(status = %cluster_status, "cluster reboot successful");

        probe::probe_member(self.api.as_ref(), session.as_mut(), seed, true).await?;
        self.dba = Some(session);
        Ok(())
    }

    /// Restore quorum from the given candidate's partition. Rejoining the
    /// members that stayed behind is deferred to later pod events.
    #[tracing::instrument(skip(self), fields(cluster = %self.cluster.key, candidate = candidate_index))]
    pub async fn force_quorum(&mut self, candidate_index: u32) -> Result<(), Error> {
        let pods = self.api.pods(&self.cluster.key).await?;
        let candidate = pods
            .iter()
            .find(|pod| pod.index == candidate_index)
            .ok_or_else(|| Error::permanent(format!("pod {} not found", candidate_index)))?
            .clone();
        tracing::info!(candidate = %candidate.name, "forcing quorum of cluster");

        self.connect_to_primary(Some(&candidate)).await?;
        self.group()?
            .force_quorum_using_partition_of(&candidate.endpoint_co)
            .await?;

        let cluster_status = self.group()?.status().await?;
        tracing::info!(status = %cluster_status, "force quorum successful");
        Ok(())
    }

    /// Shut down GR on the last member of a cluster being deleted. Failures
    /// are logged and swallowed; the finalizer always comes off.
    #[tracing::instrument(skip(self, last_pod), fields(cluster = %self.cluster.key, pod.name = %last_pod.name))]
    pub async fn destroy_cluster(&mut self, last_pod: &PodRecord) -> Result<(), Error> {
        tracing::info!("stopping GR for last cluster member");

        let stop = async {
            let mut session = tokio::time::timeout(
                self.config.probe_timeout,
                self.admin.connect_dba(&last_pod.endpoint_co),
            )
            .await
            .map_err(|_| AdminError::Connection {
                endpoint: last_pod.endpoint.clone(),
                reason: "connect timed out".to_string(),
            })??;
            session.stop_group_replication().await
        };
        match stop.await {
            Ok(()) => tracing::info!("stop GR OK"),
            Err(error) => {
                // Just stop GR, which should be harmless most of the time.
                tracing::warn!(%error, "error stopping GR at last cluster member, ignoring");
            }
        }

        self.api.remove_member_finalizer(last_pod).await?;
        Ok(())
    }

    /// Classify `pod` against the running cluster and join, rejoin or leave
    /// it alone accordingly.
    #[tracing::instrument(skip(self, pod), fields(cluster = %self.cluster.key, pod.name = %pod.name))]
    pub async fn reconcile_pod(&mut self, primary: Option<u32>, pod: &PodRecord) -> Result<(), Error> {
        let mut pod_session = match self.connect_pod(pod).await {
            Ok(session) => Some(session),
            Err(error) => {
                tracing::debug!(%error, "could not open candidate session");
                None
            }
        };

        let pods = self.api.pods(&self.cluster.key).await?;
        let primary_pod = primary.and_then(|index| pods.iter().find(|p| p.index == index).cloned());
        self.connect_to_primary(primary_pod.as_ref()).await?;

        let candidate = match pod_session.as_deref_mut() {
            Some(session) => {
                let server_uuid = session
                    .instance_info()
                    .await
                    .ok()
                    .map(|info| info.server_uuid);
                let local_state = session.membership_info().await.ok();
                let gtid_executed = session
                    .gtid_state()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|state| state.executed.parse().ok());
                Some((server_uuid, local_state, gtid_executed))
            }
            None => None,
        };

        let known_uuids = self.group()?.metadata_member_uuids().await?;
        let cluster_gtids = self.group()?.gtid_executed().await?;

        let facts = match &candidate {
            Some((server_uuid, local_state, gtid_executed)) => {
                let known = server_uuid
                    .as_ref()
                    .map(|uuid| known_uuids.iter().any(|known| known == uuid))
                    .unwrap_or(false);
                CandidateFacts {
                    known_to_metadata: known,
                    in_current_view: known
                        && local_state
                            .as_ref()
                            .map(|state| state.status.online())
                            .unwrap_or(false),
                    cluster_gtids,
                    candidate: Some(CandidateState {
                        status: local_state.as_ref().map(|state| state.status),
                        gtid_executed: gtid_executed.clone(),
                    }),
                }
            }
            None => CandidateFacts {
                known_to_metadata: false,
                in_current_view: false,
                cluster_gtids,
                candidate: None,
            },
        };
        let candidate_status = diagnose::classify_candidate(&facts);

        tracing::info!(
            candidate.state = %candidate_status,
            pod.deleting = pod.deleting,
            cluster.deleting = self.cluster.deleting,
            "reconciling pod"
        );
        if pod.deleting || self.cluster.deleting {
            return Ok(());
        }

        match candidate_status {
            CandidateDiagStatus::Joinable => {
                self.api
                    .post_event(
                        &self.cluster.key,
                        "ReconcilePod",
                        "Join",
                        &format!("Joining {} to cluster", pod.name),
                        "Normal",
                    )
                    .await?;
                self.join_instance(pod).await
            }
            CandidateDiagStatus::Rejoinable => {
                self.api
                    .post_event(
                        &self.cluster.key,
                        "ReconcilePod",
                        "Rejoin",
                        &format!("Rejoining {} to cluster", pod.name),
                        "Normal",
                    )
                    .await?;
                self.rejoin_instance(pod).await
            }
            CandidateDiagStatus::Member => {
                tracing::info!(endpoint = %pod.endpoint, "already a member");
                if let Some(session) = pod_session.as_deref_mut() {
                    probe::probe_member(self.api.as_ref(), session, pod, false).await?;
                }
                Ok(())
            }
            CandidateDiagStatus::Unreachable => {
                tracing::error!(endpoint = %pod.endpoint, "is unreachable");
                Ok(())
            }
            CandidateDiagStatus::Broken => {
                // An instance with errant transactions could be clobbered by
                // a clone, but that would silently discard data.
                tracing::error!(
                    endpoint = %pod.endpoint,
                    candidate.state = %candidate_status,
                    "instance cannot be joined"
                );
                if let Some(session) = pod_session.as_deref_mut() {
                    probe::probe_member(self.api.as_ref(), session, pod, false).await?;
                }
                Ok(())
            }
        }
    }

    /// Decision table driving the cluster back towards ONLINE.
    pub async fn repair_cluster(
        &mut self,
        _pod: &PodRecord,
        diag: &ClusterDiagnosis,
    ) -> Result<(), Error> {
        match diag.status {
            // Nothing to do; rejoins are handled on pod events.
            ClusterDiagStatus::Online
            | ClusterDiagStatus::OnlinePartial
            | ClusterDiagStatus::OnlineUncertain
            | ClusterDiagStatus::Finalizing => Ok(()),

            ClusterDiagStatus::Offline => {
                let pods = self.api.pods(&self.cluster.key).await?;
                if diag.gtids_known() == pods.len() {
                    let seed = diagnose::select_pod_with_most_gtids(&diag.gtid_executed)
                        .ok_or_else(|| {
                            Error::transient(
                                "no pod with a readable GTID set",
                                Duration::from_secs(5),
                            )
                        })?;
                    self.api
                        .post_event(
                            &self.cluster.key,
                            "RestoreCluster",
                            "Rebooting",
                            &format!("Restoring OFFLINE cluster through pod {}", seed),
                            "Normal",
                        )
                        .await?;
                    let retry = self.config.retry;
                    with_retries!(retry, self.reboot_cluster(seed))
                } else {
                    tracing::debug!("cannot reboot cluster, not all pods are reachable");
                    Err(Error::transient(
                        "Cluster cannot be restored because there are unreachable pods",
                        Duration::from_secs(5),
                    ))
                }
            }

            ClusterDiagStatus::OfflineUncertain | ClusterDiagStatus::NoQuorumUncertain => {
                Err(Error::transient(
                    format!(
                        "Unreachable members found while in state {}, waiting",
                        diag.status
                    ),
                    Duration::from_secs(10),
                ))
            }

            ClusterDiagStatus::NoQuorum => {
                let candidate = *diag.quorum_candidates.first().ok_or_else(|| {
                    Error::transient("no quorum candidate reachable", Duration::from_secs(10))
                })?;
                self.api
                    .post_event(
                        &self.cluster.key,
                        "RestoreCluster",
                        "RestoreQuorum",
                        "Restoring quorum of cluster",
                        "Normal",
                    )
                    .await?;
                let retry = self.config.retry;
                with_retries!(retry, self.force_quorum(candidate))
            }

            ClusterDiagStatus::SplitBrain | ClusterDiagStatus::SplitBrainUncertain => {
                self.api
                    .post_event(
                        &self.cluster.key,
                        "UnrecoverableState",
                        "SplitBrain",
                        "Cluster is in a SPLIT-BRAIN state and cannot be restored automatically.",
                        "Warning",
                    )
                    .await?;
                Err(Error::permanent(format!(
                    "Unable to recover from current cluster state. User action required. state={}",
                    diag.status
                )))
            }

            ClusterDiagStatus::Unknown => Err(Error::transient(
                format!("No members of the cluster could be reached. state={}", diag.status),
                Duration::from_secs(10),
            )),

            ClusterDiagStatus::Invalid => {
                self.api
                    .post_event(
                        &self.cluster.key,
                        "UnrecoverableState",
                        "Invalid",
                        "Cluster state is invalid and cannot be restored automatically.",
                        "Warning",
                    )
                    .await?;
                Err(Error::permanent(format!(
                    "Unable to recover from current cluster state. User action required. state={}",
                    diag.status
                )))
            }

            ClusterDiagStatus::Initializing => Err(Error::permanent(format!(
                "Invalid cluster state {}",
                diag.status
            ))),
        }
    }

    /// A pod came up for the first time: create the cluster on the seed,
    /// join everyone else.
    #[tracing::instrument(skip(self, pod), fields(cluster = %self.cluster.key, pod.name = %pod.name))]
    pub async fn on_pod_created(&mut self, pod: &PodRecord) -> Result<(), Error> {
        let _guard = self.lock(&pod.name)?;
        let diag = self.probe_status().await?;
        tracing::debug!(primary = ?diag.primary, cluster.state = %diag.status, "on_pod_created");

        match diag.status {
            ClusterDiagStatus::Initializing => {
                if pod.index == 0 {
                    if self.cluster.created() {
                        return Err(Error::permanent(
                            "Internal inconsistency: cluster marked as initialized, but create requested again",
                        ));
                    }
                    let retry = self.config.retry;
                    with_retries!(retry, self.create_cluster(pod))?;
                    // Mark the cluster object as already created.
                    let now = Utc::now();
                    self.api.set_create_time(&self.cluster.key, now).await?;
                    self.cluster.create_time = Some(now);
                    Ok(())
                } else {
                    // Other pods must wait for the seed.
                    Err(Error::transient(
                        "Cluster is not yet ready",
                        Duration::from_secs(15),
                    ))
                }
            }
            state if state.is_online() => {
                let retry = self.config.retry;
                with_retries!(retry, self.reconcile_pod(diag.primary, pod))
            }
            state => {
                self.repair_cluster(pod, &diag).await?;
                // Retry from scratch in another iteration.
                Err(Error::transient(
                    format!("Cluster repair from state {} attempted", state),
                    Duration::from_secs(3),
                ))
            }
        }
    }

    /// A pod's mysqld restarted: repair if needed, then reconcile it back in.
    #[tracing::instrument(skip(self, pod), fields(cluster = %self.cluster.key, pod.name = %pod.name))]
    pub async fn on_pod_restarted(&mut self, pod: &PodRecord) -> Result<(), Error> {
        let _guard = self.lock(&pod.name)?;
        let diag = self.probe_status().await?;
        tracing::debug!(primary = ?diag.primary, cluster.state = %diag.status, "on_pod_restarted");

        if !matches!(
            diag.status,
            ClusterDiagStatus::Online | ClusterDiagStatus::OnlinePartial
        ) {
            self.repair_cluster(pod, &diag).await?;
        }

        let retry = self.config.retry;
        with_retries!(retry, self.reconcile_pod(diag.primary, pod))
    }

    /// A pod is going away: remove it from the group and release its
    /// finalizer; tear the whole group down when the cluster is deleted.
    #[tracing::instrument(skip(self, pod), fields(cluster = %self.cluster.key, pod.name = %pod.name))]
    pub async fn on_pod_deleted(&mut self, pod: &PodRecord) -> Result<(), Error> {
        let _guard = self.lock(&pod.name)?;
        let diag = self.probe_status().await?;
        tracing::debug!(primary = ?diag.primary, cluster.state = %diag.status, "on_pod_deleted");

        if self.cluster.deleting && pod.index == 0 {
            // last one out turns off the lights
            self.destroy_cluster(pod).await?;
            return Ok(());
        }

        if pod.deleting || diag.status.is_online() || diag.status == ClusterDiagStatus::Finalizing
        {
            let retry = self.config.retry;
            with_retries!(retry, self.remove_instance(pod))?;
        } else {
            self.repair_cluster(pod, &diag).await?;
            return Err(Error::transient(
                format!("Cluster repair from state {} attempted", diag.status),
                Duration::from_secs(3),
            ));
        }

        // Re-publish so a shrunk cluster reports ONLINE again.
        self.probe_status().await?;
        Ok(())
    }

    /// Informational group-view update from a member: refresh membership
    /// annotations and readiness gates, never run admin actions.
    pub async fn on_group_view_change(
        &mut self,
        members: &[GroupViewMember],
        _view_id_changed: bool,
    ) -> Result<(), Error> {
        for pod in self.api.pods(&self.cluster.key).await? {
            let pod_member_id = pod.member_id().map(String::from);
            for member in members {
                let id_match = pod_member_id.as_deref() == Some(member.member_id.as_str());
                let endpoint_match = member.endpoint == pod.endpoint;
                if !id_match && !endpoint_match {
                    continue;
                }
                let probe = MembershipProbe {
                    member_id: member.member_id.clone(),
                    role: member.role,
                    status: member.status,
                    view_id: member.view_id.clone(),
                    version: member.version.clone(),
                    member_count: 0,
                    reachable_member_count: 0,
                };
                self.api.update_membership(&pod, &probe, false).await?;
                self.api
                    .set_member_ready(&pod, member.status.online())
                    .await?;
                break;
            }
        }
        Ok(())
    }

    /// Router pods need to be recreated for new certificates to load.
    /// Deliberately not implemented yet.
    pub fn on_router_tls_changed(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::Harness;
    use common_lib::types::MembershipInfo;

    #[tokio::test]
    async fn fresh_cluster_is_created_on_the_seed_pod() {
        let harness = Harness::new(3);

        let mut controller = harness.controller();
        controller.on_pod_created(&harness.pod(0)).await.unwrap();

        assert!(harness
            .calls()
            .iter()
            .any(|call| call.starts_with("create_cluster:mycluster:")));
        assert!(harness.api.lock().cluster.create_time.is_some());
        assert!(harness.pod(0).member_finalizer);
        assert_eq!(
            harness.api.lock().cluster.initial_data_source.as_deref(),
            Some("blank")
        );
        assert_eq!(harness.api.lock().ready.get(&0), Some(&true));

        // pod-1 arrives against the growing cluster and gets joined
        let mut controller = harness.controller();
        controller.on_pod_created(&harness.pod(1)).await.unwrap();
        assert!(harness
            .calls()
            .contains(&format!("add_instance:incremental:{}", harness.address(1))));
        assert!(harness.pod(1).member_finalizer);
        assert_eq!(harness.api.lock().router_size, None);

        // the last join completes the cluster and deploys the routers
        let mut controller = harness.controller();
        controller.on_pod_created(&harness.pod(2)).await.unwrap();
        assert!(harness
            .calls()
            .contains(&"setup_router_account:mysqlrouter".to_string()));
        assert!(harness
            .calls()
            .contains(&"setup_backup_account:mysqlbackup".to_string()));
        assert_eq!(harness.api.lock().router_size, Some(2));

        let mut controller = harness.controller();
        let diag = controller.probe_status().await.unwrap();
        assert_eq!(diag.status, ClusterDiagStatus::Online);
        assert_eq!(diag.online_members, vec![0, 1, 2]);
        assert!(harness
            .events()
            .contains(&("ReconcilePod".to_string(), "Join".to_string())));
    }

    #[tokio::test]
    async fn non_seed_pods_wait_for_the_seed() {
        let harness = Harness::new(3);
        let mut controller = harness.controller();
        let error = controller.on_pod_created(&harness.pod(1)).await.unwrap_err();
        match error {
            Error::Transient { delay, .. } => assert_eq!(delay, Duration::from_secs(15)),
            other => panic!("expected transient wait, got {:?}", other),
        }
        assert!(harness.calls().is_empty());
    }

    #[tokio::test]
    async fn second_create_request_is_a_permanent_error() {
        let harness = Harness::new(3);
        harness.api.lock().cluster.create_time = Some(Utc::now());
        harness.api.lock().pods.clear();
        let pod0 = PodRecord::new(&harness.key, 0, "mysqladmin");

        let mut controller = harness.controller();
        let error = controller.on_pod_created(&pod0).await.unwrap_err();
        assert!(matches!(error, Error::Permanent { .. }));
        assert_eq!(error.requeue_after(), None);
        assert!(harness.calls().is_empty());
    }

    #[tokio::test]
    async fn concurrent_reconciliation_is_rejected_with_the_owner() {
        let harness = Harness::new(3);
        harness.online();

        let _guard = harness.locks.try_acquire(&harness.key, "mycluster-9").unwrap();
        let mut controller = harness.controller();
        let error = controller.on_pod_created(&harness.pod(1)).await.unwrap_err();
        match &error {
            Error::ClusterBusy { owner, .. } => assert_eq!(owner, "mycluster-9"),
            other => panic!("expected busy error, got {:?}", other),
        }
        assert_eq!(error.requeue_after(), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn join_falls_back_to_clone_recovery() {
        let harness = Harness::new(3);
        harness.online();
        harness.take_offline(2);
        harness.sim.lock().add_errors.push_back(AdminError::Other {
            code: 51166,
            message: "incremental recovery is not possible".into(),
        });

        let mut controller = harness.controller();
        controller.on_pod_created(&harness.pod(2)).await.unwrap();

        let calls = harness.calls();
        let adds: Vec<&String> = calls
            .iter()
            .filter(|call| call.starts_with("add_instance:"))
            .collect();
        assert_eq!(
            adds,
            vec![
                &format!("add_instance:incremental:{}", harness.address(2)),
                &format!("add_instance:clone:{}", harness.address(2)),
            ]
        );
    }

    #[tokio::test]
    async fn complete_outage_reboots_from_the_most_advanced_pod() {
        let harness = Harness::new(3);
        harness.online();
        for (index, gtids) in &[(0, "a:1-5"), (1, "a:1-7"), (2, "a:1-6")] {
            harness.with_member(*index, |member| {
                member.probe.status = MemberStatus::Offline;
                member.probe.role = None;
                member.probe.view_id = None;
                member.probe.member_count = 0;
                member.probe.reachable_member_count = 0;
                member.gtid_executed = Some(gtids.to_string());
            });
        }

        let mut controller = harness.controller();
        let diag = controller.probe_status().await.unwrap();
        assert_eq!(diag.status, ClusterDiagStatus::Offline);

        controller.repair_cluster(&harness.pod(0), &diag).await.unwrap();

        let calls = harness.calls();
        assert!(calls.contains(&format!("reboot:{}", harness.address(1))));
        assert!(calls.contains(&format!("rejoin:{}", harness.pod(0).endpoint)));
        assert!(calls.contains(&format!("rejoin:{}", harness.pod(2).endpoint)));
        assert!(harness
            .events()
            .contains(&("RestoreCluster".to_string(), "Rebooting".to_string())));
    }

    #[tokio::test]
    async fn outage_with_unreadable_gtids_defers_the_reboot() {
        let harness = Harness::new(3);
        harness.online();
        for index in 0 .. 3 {
            harness.with_member(index, |member| {
                member.probe.status = MemberStatus::Offline;
                member.probe.role = None;
                member.probe.view_id = None;
                member.probe.member_count = 0;
                member.probe.reachable_member_count = 0;
            });
        }
        harness.with_member(2, |member| member.gtid_executed = None);

        let mut controller = harness.controller();
        let diag = controller.probe_status().await.unwrap();
        assert_eq!(diag.status, ClusterDiagStatus::Offline);

        let error = controller.repair_cluster(&harness.pod(0), &diag).await.unwrap_err();
        assert!(matches!(error, Error::Transient { .. }));
        assert!(!harness.calls().iter().any(|call| call.starts_with("reboot:")));
    }

    #[tokio::test]
    async fn minority_partition_forces_quorum_from_the_survivor() {
        let harness = Harness::new(3);
        harness.online();
        harness.with_member(1, |member| member.reachable = false);
        harness.with_member(2, |member| member.reachable = false);
        harness.with_member(0, |member| member.probe.reachable_member_count = 1);

        let mut controller = harness.controller();
        let diag = controller.probe_status().await.unwrap();
        assert_eq!(diag.status, ClusterDiagStatus::NoQuorum);
        assert_eq!(diag.quorum_candidates, vec![0]);

        controller.repair_cluster(&harness.pod(0), &diag).await.unwrap();

        let calls = harness.calls();
        assert!(calls.contains(&format!("force_quorum:{}", harness.address(0))));
        assert!(!calls.iter().any(|call| call.starts_with("reboot:")));
        assert!(harness
            .events()
            .contains(&("RestoreCluster".to_string(), "RestoreQuorum".to_string())));
    }

    #[tokio::test]
    async fn uncertain_states_never_trigger_destructive_recovery() {
        // OFFLINE_UNCERTAIN: two pods down, one unreachable.
        let harness = Harness::new(3);
        harness.online();
        for index in 0 .. 2 {
            harness.with_member(index, |member| {
                member.probe.status = MemberStatus::Offline;
                member.probe.role = None;
                member.probe.view_id = None;
            });
        }
        harness.with_member(2, |member| member.reachable = false);

        let mut controller = harness.controller();
        let diag = controller.probe_status().await.unwrap();
        assert_eq!(diag.status, ClusterDiagStatus::OfflineUncertain);
        let error = controller.repair_cluster(&harness.pod(0), &diag).await.unwrap_err();
        assert!(matches!(error, Error::Transient { .. }));

        // NO_QUORUM_UNCERTAIN: the survivor's view does not span the group.
        let harness = Harness::new(3);
        harness.online();
        harness.with_member(0, |member| {
            member.probe.member_count = 2;
            member.probe.reachable_member_count = 1;
        });
        harness.with_member(1, |member| {
            member.probe.status = MemberStatus::Offline;
            member.probe.role = None;
            member.probe.view_id = None;
        });
        harness.with_member(2, |member| member.reachable = false);

        let mut controller = harness.controller();
        let diag = controller.probe_status().await.unwrap();
        assert_eq!(diag.status, ClusterDiagStatus::NoQuorumUncertain);
        let error = controller.repair_cluster(&harness.pod(0), &diag).await.unwrap_err();
        assert!(matches!(error, Error::Transient { .. }));

        let calls = harness.calls();
        assert!(!calls.iter().any(|call| {
            call.starts_with("reboot:") || call.starts_with("force_quorum:")
        }));
    }

    #[tokio::test]
    async fn split_brain_refuses_recovery() {
        let harness = Harness::new(3);
        harness.online();
        harness.with_member(0, |member| {
            member.probe.view_id = Some("view:8".into());
            member.probe.reachable_member_count = 2;
        });
        harness.with_member(1, |member| {
            member.probe.role = Some(MemberRole::Primary);
            member.probe.view_id = Some("view:9".into());
            member.probe.reachable_member_count = 2;
        });
        harness.with_member(2, |member| {
            member.probe.view_id = Some("view:8".into());
            member.probe.reachable_member_count = 2;
        });

        let mut controller = harness.controller();
        let diag = controller.probe_status().await.unwrap();
        assert_eq!(diag.status, ClusterDiagStatus::SplitBrain);

        let error = controller.repair_cluster(&harness.pod(0), &diag).await.unwrap_err();
        assert!(matches!(error, Error::Permanent { .. }));
        assert_eq!(error.requeue_after(), None);
        assert!(harness
            .events()
            .contains(&("UnrecoverableState".to_string(), "SplitBrain".to_string())));
        assert!(harness.calls().is_empty(), "no admin action on split brain");
    }

    #[tokio::test]
    async fn pod_deletion_removes_the_member_gracefully() {
        let harness = Harness::new(3);
        harness.online();
        {
            let mut api = harness.api.lock();
            let pod = api.pods.iter_mut().find(|pod| pod.index == 2).unwrap();
            pod.deleting = true;
            pod.member_finalizer = true;
        }

        // First graceful attempt lands in the super_read_only window.
        harness
            .sim
            .lock()
            .remove_errors
            .push_back(AdminError::OptionPreventsStatement);
        let mut controller = harness.controller();
        let error = controller.on_pod_deleted(&harness.pod(2)).await.unwrap_err();
        match &error {
            Error::Transient { delay, .. } => assert_eq!(*delay, Duration::from_secs(5)),
            other => panic!("expected transient retry, got {:?}", other),
        }
        assert!(
            harness.pod(2).member_finalizer,
            "finalizer stays until removal succeeds"
        );

        // The retry finds the member already gone from the metadata.
        harness
            .sim
            .lock()
            .remove_errors
            .push_back(AdminError::MemberMetadataMissing);
        let mut controller = harness.controller();
        controller.on_pod_deleted(&harness.pod(2)).await.unwrap();
        assert!(!harness.pod(2).member_finalizer);

        let published = harness.api.lock().published.last().cloned().unwrap();
        assert_eq!(published.status, ClusterDiagStatus::Online);
        assert_eq!(published.online_instances, 2);
    }

    #[tokio::test]
    async fn removing_the_last_pod_skips_the_group() {
        let harness = Harness::new(1);
        harness.online();
        {
            let mut api = harness.api.lock();
            api.pods[0].member_finalizer = true;
        }
        let mut controller = harness.controller();
        controller.remove_instance(&harness.pod(0)).await.unwrap();
        assert!(!harness
            .calls()
            .iter()
            .any(|call| call.starts_with("remove_instance:")));
        assert!(!harness.pod(0).member_finalizer);
    }

    #[tokio::test]
    async fn cluster_deletion_destroys_through_pod_zero() {
        let harness = Harness::new(1);
        harness.online();
        harness.api.lock().cluster.deleting = true;
        {
            let mut api = harness.api.lock();
            api.pods[0].deleting = true;
            api.pods[0].member_finalizer = true;
        }

        let mut controller = harness.controller();
        controller.on_pod_deleted(&harness.pod(0)).await.unwrap();

        assert!(harness
            .calls()
            .contains(&format!("stop_gr:{}", harness.address(0))));
        assert!(!harness.pod(0).member_finalizer);
        assert!(
            harness.api.lock().published.is_empty(),
            "no status published while deleting"
        );
    }

    #[tokio::test]
    async fn probe_publishes_status_and_transition_events() {
        let harness = Harness::new(3);
        harness.online();

        let mut controller = harness.controller();
        controller.probe_status().await.unwrap();
        {
            let api = harness.api.lock();
            let published = api.published.last().unwrap();
            assert_eq!(published.status, ClusterDiagStatus::Online);
            assert_eq!(published.online_instances, 3);
        }
        assert!(harness.events().is_empty(), "first publication has no prior status");

        // A member dropping out changes the status and emits an event.
        harness.with_member(2, |member| {
            member.probe.status = MemberStatus::Offline;
            member.probe.role = None;
            member.probe.view_id = None;
        });
        let mut controller = harness.controller();
        controller.probe_status().await.unwrap();
        assert_eq!(
            harness.events(),
            vec![("ClusterStatus".to_string(), "StatusChange".to_string())]
        );
    }

    #[tokio::test]
    async fn cached_status_short_circuits_probing() {
        let harness = Harness::new(3);
        harness.online();

        let mut controller = harness.controller();
        controller.probe_status().await.unwrap();

        {
            let mut api = harness.api.lock();
            let probe = MembershipProbe {
                member_id: "uuid-0".into(),
                role: Some(MemberRole::Primary),
                status: MemberStatus::Online,
                view_id: Some("view:1".into()),
                version: None,
                member_count: 3,
                reachable_member_count: 3,
            };
            api.pods[0].membership_info = Some(MembershipInfo::from_probe(
                &probe,
                true,
                None,
                Utc::now() - chrono::Duration::seconds(60),
            ));
        }

        let mut controller = harness.controller();
        let published_before = harness.api.lock().published.len();
        let status = controller.probe_status_if_needed(&harness.pod(0)).await.unwrap();
        assert_eq!(status, ClusterDiagStatus::Online);
        assert_eq!(
            harness.api.lock().published.len(),
            published_before,
            "cached status is reused without a new probe"
        );
    }

    #[tokio::test]
    async fn group_view_change_updates_annotations_only() {
        let harness = Harness::new(2);
        harness.online();

        let members = vec![
            GroupViewMember {
                member_id: "uuid-0".into(),
                role: Some(MemberRole::Primary),
                status: MemberStatus::Online,
                view_id: Some("view:2".into()),
                endpoint: harness.pod(0).endpoint,
                version: Some("8.0.29".into()),
            },
            GroupViewMember {
                member_id: "uuid-1".into(),
                role: None,
                status: MemberStatus::Offline,
                view_id: None,
                endpoint: harness.pod(1).endpoint,
                version: None,
            },
        ];

        let mut controller = harness.controller();
        controller.on_group_view_change(&members, true).await.unwrap();

        {
            let api = harness.api.lock();
            let info = api.pods[0].membership_info.as_ref().unwrap();
            assert_eq!(info.view_id.as_deref(), Some("view:2"));
            assert_eq!(api.ready.get(&0), Some(&true));
            assert_eq!(api.ready.get(&1), Some(&false));
        }
        assert!(harness.calls().is_empty(), "informational only");
    }
}
