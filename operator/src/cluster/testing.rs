//! Test doubles: a scripted admin client simulating a Group Replication
//! cluster and an in-memory implementation of the state registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use common_lib::{
    lock::ClusterLockRegistry,
    mysql::{
        AddInstanceOptions, AdminClient, AdminError, ConnectOptions, CreateClusterOptions,
        DbaSession, GroupCluster, GtidSet, GtidState, InstanceInfo, MembershipProbe,
        RecoveryMethod, RemoveInstanceOptions, RouterAccountOptions,
    },
    types::{
        ClusterKey, ClusterRecord, ClusterResourceStatus, ClusterSpec, MemberRole, MemberStatus,
        MembershipInfo, PodRecord,
    },
};

use crate::{
    cluster::{
        api::{AccountKind, ClusterApi},
        controller::ClusterController,
        retry::RetryPolicy,
    },
    config::OperatorConfig,
    error::Error,
};

/// One simulated MySQL server.
#[derive(Debug, Clone)]
pub struct MemberSim {
    pub reachable: bool,
    pub probe: MembershipProbe,
    pub gtid_executed: Option<String>,
}

impl MemberSim {
    fn blank(index: u32) -> Self {
        Self {
            reachable: true,
            probe: MembershipProbe {
                member_id: format!("uuid-{}", index),
                role: None,
                status: MemberStatus::Offline,
                view_id: None,
                version: Some("8.0.29".into()),
                member_count: 0,
                reachable_member_count: 0,
            },
            gtid_executed: Some(String::new()),
        }
    }
}

/// Shared state of the simulated cluster.
#[derive(Debug, Default)]
pub struct SimState {
    pub members: BTreeMap<String, MemberSim>,
    pub cluster_exists: bool,
    pub metadata_uuids: Vec<String>,
    pub cluster_gtids: String,
    pub router_account_exists: bool,
    pub create_errors: VecDeque<AdminError>,
    pub add_errors: VecDeque<AdminError>,
    pub remove_errors: VecDeque<AdminError>,
    pub calls: Vec<String>,
}

impl SimState {
    fn group_size(&self) -> u32 {
        self.metadata_uuids.len() as u32
    }

    fn join(&mut self, address: &str, role: MemberRole) {
        let uuid = self.members[address].probe.member_id.clone();
        if !self.metadata_uuids.contains(&uuid) {
            self.metadata_uuids.push(uuid);
        }
        let size = self.group_size();
        if let Some(member) = self.members.get_mut(address) {
            member.probe.role = Some(role);
            member.probe.status = MemberStatus::Online;
            member.probe.view_id = Some("view:1".to_string());
        }
        for member in self.members.values_mut() {
            if member.probe.status == MemberStatus::Online {
                member.probe.member_count = size;
                member.probe.reachable_member_count = size;
            }
        }
    }
}

/// Scripted [`AdminClient`].
#[derive(Clone)]
pub struct MockAdmin {
    pub state: Arc<Mutex<SimState>>,
}

impl MockAdmin {
    pub fn new(state: Arc<Mutex<SimState>>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl AdminClient for MockAdmin {
    async fn connect_dba(&self, target: &ConnectOptions) -> Result<Box<dyn DbaSession>, AdminError> {
        let address = target.address();
        let state = self.state.lock();
        match state.members.get(&address) {
            Some(member) if member.reachable => Ok(Box::new(MockSession {
                state: self.state.clone(),
                address: address.clone(),
            })),
            _ => Err(AdminError::Connection {
                endpoint: address,
                reason: "connection refused".into(),
            }),
        }
    }
}

struct MockSession {
    state: Arc<Mutex<SimState>>,
    address: String,
}

impl MockSession {
    fn member(&self) -> MemberSim {
        self.state.lock().members[&self.address].clone()
    }

    fn cluster_handle(&self) -> Box<dyn GroupCluster> {
        Box::new(MockCluster {
            state: self.state.clone(),
        })
    }
}

#[async_trait]
impl DbaSession for MockSession {
    fn endpoint(&self) -> String {
        self.address.clone()
    }

    async fn get_cluster(&mut self) -> Result<Box<dyn GroupCluster>, AdminError> {
        let state = self.state.lock();
        if !state.cluster_exists {
            return Err(AdminError::Other {
                code: 51101,
                message: "no cluster metadata".into(),
            });
        }
        let member = &state.members[&self.address];
        if member.probe.status != MemberStatus::Online {
            return Err(AdminError::InstanceNotOnline {
                endpoint: self.address.clone(),
            });
        }
        drop(state);
        Ok(self.cluster_handle())
    }

    async fn create_cluster(
        &mut self,
        name: &str,
        _options: &CreateClusterOptions,
    ) -> Result<Box<dyn GroupCluster>, AdminError> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_cluster:{}:{}", name, self.address));
        if let Some(error) = state.create_errors.pop_front() {
            return Err(error);
        }
        state.cluster_exists = true;
        state.join(&self.address.clone(), MemberRole::Primary);
        drop(state);
        Ok(self.cluster_handle())
    }

    async fn reboot_cluster_from_complete_outage(
        &mut self,
    ) -> Result<Box<dyn GroupCluster>, AdminError> {
        let mut state = self.state.lock();
        state.calls.push(format!("reboot:{}", self.address));
        state.cluster_exists = true;
        state.join(&self.address.clone(), MemberRole::Primary);
        drop(state);
        Ok(self.cluster_handle())
    }

    async fn instance_info(&mut self) -> Result<InstanceInfo, AdminError> {
        let member = self.member();
        Ok(InstanceInfo {
            server_id: 1,
            server_uuid: member.probe.member_id,
            report_host: self.address.clone(),
        })
    }

    async fn gtid_state(&mut self) -> Result<Option<GtidState>, AdminError> {
        Ok(self.member().gtid_executed.map(|executed| GtidState {
            executed,
            purged: String::new(),
        }))
    }

    async fn membership_info(&mut self) -> Result<MembershipProbe, AdminError> {
        Ok(self.member().probe)
    }

    async fn stop_group_replication(&mut self) -> Result<(), AdminError> {
        self.state.lock().calls.push(format!("stop_gr:{}", self.address));
        Ok(())
    }

    async fn user_has_grants(&mut self, _user: &str) -> Result<bool, AdminError> {
        Ok(self.state.lock().router_account_exists)
    }

    async fn setup_backup_account(
        &mut self,
        user: &str,
        _password: &str,
    ) -> Result<(), AdminError> {
        self.state
            .lock()
            .calls
            .push(format!("setup_backup_account:{}", user));
        Ok(())
    }
}

struct MockCluster {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl GroupCluster for MockCluster {
    async fn status(&mut self) -> Result<Value, AdminError> {
        Ok(json!({ "clusterName": "sim" }))
    }

    async fn add_instance(
        &mut self,
        target: &ConnectOptions,
        options: &AddInstanceOptions,
    ) -> Result<(), AdminError> {
        let method = match options.recovery_method {
            RecoveryMethod::Incremental => "incremental",
            RecoveryMethod::Clone => "clone",
        };
        let address = target.address();
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("add_instance:{}:{}", method, address));
        if let Some(error) = state.add_errors.pop_front() {
            return Err(error);
        }
        state.join(&address, MemberRole::Secondary);
        Ok(())
    }

    async fn rejoin_instance(&mut self, endpoint: &str) -> Result<(), AdminError> {
        let mut state = self.state.lock();
        state.calls.push(format!("rejoin:{}", endpoint));
        state.join(&endpoint.to_string(), MemberRole::Secondary);
        Ok(())
    }

    async fn remove_instance(
        &mut self,
        endpoint: &str,
        options: &RemoveInstanceOptions,
    ) -> Result<(), AdminError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("remove_instance:force={}:{}", options.force, endpoint));
        if let Some(error) = state.remove_errors.pop_front() {
            return Err(error);
        }
        let uuid = state
            .members
            .get(endpoint)
            .map(|member| member.probe.member_id.clone());
        if let Some(uuid) = uuid {
            state.metadata_uuids.retain(|known| known != &uuid);
        }
        if let Some(member) = state.members.get_mut(endpoint) {
            member.probe.status = MemberStatus::Offline;
            member.probe.role = None;
            member.probe.view_id = None;
        }
        let size = state.group_size();
        for member in state.members.values_mut() {
            if member.probe.status == MemberStatus::Online {
                member.probe.member_count = size;
                member.probe.reachable_member_count = size;
            }
        }
        Ok(())
    }

    async fn force_quorum_using_partition_of(
        &mut self,
        target: &ConnectOptions,
    ) -> Result<(), AdminError> {
        let address = target.address();
        let mut state = self.state.lock();
        state.calls.push(format!("force_quorum:{}", address));
        if let Some(member) = state.members.get_mut(&address) {
            member.probe.reachable_member_count = member.probe.member_count;
        }
        Ok(())
    }

    async fn setup_router_account(
        &mut self,
        user: &str,
        _options: &RouterAccountOptions,
    ) -> Result<(), AdminError> {
        let mut state = self.state.lock();
        state.calls.push(format!("setup_router_account:{}", user));
        state.router_account_exists = true;
        Ok(())
    }

    async fn metadata_member_uuids(&mut self) -> Result<Vec<String>, AdminError> {
        Ok(self.state.lock().metadata_uuids.clone())
    }

    async fn gtid_executed(&mut self) -> Result<GtidSet, AdminError> {
        self.state
            .lock()
            .cluster_gtids
            .parse()
            .or_else(|_| Ok(GtidSet::default()))
    }
}

/// In-memory [`ClusterApi`].
#[derive(Debug, Default)]
pub struct ApiState {
    pub cluster: ClusterRecord,
    pub pods: Vec<PodRecord>,
    pub events: Vec<(String, String)>,
    pub published: Vec<ClusterResourceStatus>,
    pub router_size: Option<u32>,
    pub ready: BTreeMap<u32, bool>,
}

#[derive(Clone)]
pub struct MemApi {
    pub state: Arc<Mutex<ApiState>>,
}

impl MemApi {
    pub fn new(state: Arc<Mutex<ApiState>>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ClusterApi for MemApi {
    async fn cluster(&self, _key: &ClusterKey) -> Result<ClusterRecord, Error> {
        Ok(self.state.lock().cluster.clone())
    }

    async fn pods(&self, _key: &ClusterKey) -> Result<Vec<PodRecord>, Error> {
        Ok(self.state.lock().pods.clone())
    }

    async fn update_membership(
        &self,
        pod: &PodRecord,
        probe: &MembershipProbe,
        joined: bool,
    ) -> Result<MembershipInfo, Error> {
        let mut state = self.state.lock();
        let stored = state.pods.iter_mut().find(|p| p.index == pod.index);
        let stored = match stored {
            Some(stored) => stored,
            None => {
                return Err(Error::InvalidResource {
                    reason: format!("pod {} not found", pod.index),
                })
            }
        };
        let info = MembershipInfo::from_probe(
            probe,
            joined,
            stored.membership_info.as_ref(),
            Utc::now(),
        );
        stored.membership_info = Some(info.clone());
        Ok(info)
    }

    async fn set_member_ready(&self, pod: &PodRecord, ready: bool) -> Result<(), Error> {
        self.state.lock().ready.insert(pod.index, ready);
        Ok(())
    }

    async fn add_member_finalizer(&self, pod: &PodRecord) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(stored) = state.pods.iter_mut().find(|p| p.index == pod.index) {
            stored.member_finalizer = true;
        }
        Ok(())
    }

    async fn remove_member_finalizer(&self, pod: &PodRecord) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(stored) = state.pods.iter_mut().find(|p| p.index == pod.index) {
            stored.member_finalizer = false;
        }
        Ok(())
    }

    async fn publish_cluster_status(
        &self,
        _key: &ClusterKey,
        status: &ClusterResourceStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.cluster.status = Some(status.clone());
        state.published.push(status.clone());
        Ok(())
    }

    async fn set_create_time(&self, _key: &ClusterKey, time: DateTime<Utc>) -> Result<(), Error> {
        self.state.lock().cluster.create_time = Some(time);
        Ok(())
    }

    async fn set_initial_data_source(&self, _key: &ClusterKey, source: &str) -> Result<(), Error> {
        self.state.lock().cluster.initial_data_source = Some(source.to_string());
        Ok(())
    }

    async fn post_event(
        &self,
        _key: &ClusterKey,
        action: &str,
        reason: &str,
        _message: &str,
        _type: &str,
    ) -> Result<(), Error> {
        self.state
            .lock()
            .events
            .push((action.to_string(), reason.to_string()));
        Ok(())
    }

    async fn router_size(&self, _key: &ClusterKey) -> Result<Option<u32>, Error> {
        Ok(self.state.lock().router_size)
    }

    async fn scale_router(&self, _key: &ClusterKey, instances: u32) -> Result<(), Error> {
        self.state.lock().router_size = Some(instances);
        Ok(())
    }

    async fn account(
        &self,
        _key: &ClusterKey,
        kind: AccountKind,
    ) -> Result<(String, String), Error> {
        Ok((kind.user().to_string(), "secret".to_string()))
    }
}

/// A simulated cluster wired to a fresh controller.
pub struct Harness {
    pub key: ClusterKey,
    pub sim: Arc<Mutex<SimState>>,
    pub api: Arc<Mutex<ApiState>>,
    pub locks: ClusterLockRegistry,
    pub config: OperatorConfig,
}

impl Harness {
    /// A cluster of `instances` declared members whose pods all exist and
    /// answer probes as blank (OFFLINE, empty GTID set) servers.
    pub fn new(instances: u32) -> Self {
        let key = ClusterKey::new("testns", "mycluster");
        let mut pods = vec![];
        let mut members = BTreeMap::new();
        for index in 0 .. instances {
            let pod = PodRecord::new(&key, index, "mysqladmin");
            members.insert(pod.endpoint_co.address(), MemberSim::blank(index));
            pods.push(pod);
        }
        let cluster = ClusterRecord::new(
            key.clone(),
            ClusterSpec {
                instances,
                router_instances: 2,
                ..ClusterSpec::default()
            },
        );
        let sim = Arc::new(Mutex::new(SimState {
            members,
            ..SimState::default()
        }));
        let api = Arc::new(Mutex::new(ApiState {
            cluster,
            pods,
            ..ApiState::default()
        }));
        Self {
            key,
            sim,
            api,
            locks: ClusterLockRegistry::new(),
            config: OperatorConfig {
                probe_timeout: std::time::Duration::from_millis(200),
                probe_fanout: 4,
                retry: RetryPolicy {
                    max_attempts: 2,
                    delay: std::time::Duration::from_millis(1),
                },
                admin_user: "mysqladmin".to_string(),
            },
        }
    }

    /// A controller over the current cluster snapshot.
    pub fn controller(&self) -> ClusterController {
        ClusterController::new(
            Arc::new(MemApi::new(self.api.clone())),
            Arc::new(MockAdmin::new(self.sim.clone())),
            self.locks.clone(),
            self.config.clone(),
            self.api.lock().cluster.clone(),
        )
    }

    /// The stored pod record for `index`.
    pub fn pod(&self, index: u32) -> PodRecord {
        self.api
            .lock()
            .pods
            .iter()
            .find(|pod| pod.index == index)
            .cloned()
            .expect("pod record")
    }

    /// Address of the pod's MySQL endpoint as the mock keys members.
    pub fn address(&self, index: u32) -> String {
        self.pod(index).endpoint_co.address()
    }

    /// Mutate one simulated member.
    pub fn with_member<F: FnOnce(&mut MemberSim)>(&self, index: u32, mutate: F) {
        let address = self.address(index);
        let mut sim = self.sim.lock();
        let member = sim.members.get_mut(&address).expect("member sim");
        mutate(member);
    }

    /// Bring the whole simulated group ONLINE with pod 0 as primary and
    /// mark the cluster resource as created.
    pub fn online(&self) {
        {
            let mut sim = self.sim.lock();
            sim.cluster_exists = true;
            let addresses: Vec<String> = sim.members.keys().cloned().collect();
            sim.metadata_uuids.clear();
            for address in &addresses {
                let uuid = sim.members[address].probe.member_id.clone();
                sim.metadata_uuids.push(uuid);
            }
            let size = addresses.len() as u32;
            for (position, address) in addresses.iter().enumerate() {
                let member = sim.members.get_mut(address).expect("member sim");
                member.probe.role = Some(if position == 0 {
                    MemberRole::Primary
                } else {
                    MemberRole::Secondary
                });
                member.probe.status = MemberStatus::Online;
                member.probe.view_id = Some("view:1".to_string());
                member.probe.member_count = size;
                member.probe.reachable_member_count = size;
            }
        }
        self.api.lock().cluster.create_time = Some(Utc::now());
    }

    /// Drop a member out of the simulated group: it still answers probes
    /// but reports OFFLINE and is gone from the metadata.
    pub fn take_offline(&self, index: u32) {
        let address = self.address(index);
        let mut sim = self.sim.lock();
        let uuid = sim.members[&address].probe.member_id.clone();
        sim.metadata_uuids.retain(|known| known != &uuid);
        if let Some(member) = sim.members.get_mut(&address) {
            member.probe.status = MemberStatus::Offline;
            member.probe.role = None;
            member.probe.view_id = None;
            member.probe.member_count = 0;
            member.probe.reachable_member_count = 0;
        }
        let size = sim.group_size();
        for member in sim.members.values_mut() {
            if member.probe.status == MemberStatus::Online {
                member.probe.member_count = size;
                member.probe.reachable_member_count = size;
            }
        }
    }

    /// Recorded admin calls so far.
    pub fn calls(&self) -> Vec<String> {
        self.sim.lock().calls.clone()
    }

    /// Recorded `(action, reason)` event pairs.
    pub fn events(&self) -> Vec<(String, String)> {
        self.api.lock().events.clone()
    }
}
