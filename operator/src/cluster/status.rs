//! Status publishing: write the observed diagnosis back to the cluster
//! resource and record transitions as Kubernetes events.

use chrono::Utc;
use common_lib::types::{
    ClusterDiagStatus, ClusterDiagnosis, ClusterRecord, ClusterResourceStatus, PodRecord,
};

use crate::{cluster::api::ClusterApi, error::Error};

/// Publish the diagnosis to the cluster's status subresource. A transition
/// of the status string additionally becomes an event. Never called for a
/// cluster marked for deletion.
pub async fn publish_status(
    api: &dyn ClusterApi,
    cluster: &ClusterRecord,
    diag: &ClusterDiagnosis,
) -> Result<(), Error> {
    if let Some(previous) = &cluster.status {
        if previous.status != diag.status {
            api.post_event(
                &cluster.key,
                "ClusterStatus",
                "StatusChange",
                &format!(
                    "Cluster status changed to {}. {} member(s) ONLINE",
                    diag.status,
                    diag.online_members.len()
                ),
                "Normal",
            )
            .await?;
        }
    }

    api.publish_cluster_status(
        &cluster.key,
        &ClusterResourceStatus {
            status: diag.status,
            online_instances: diag.online_members.len() as u32,
            last_probe_time: Utc::now(),
        },
    )
    .await
}

/// Whether a fresh diagnosis is needed, or the published status can be
/// reused: a probe newer than the pod's last membership transition and a
/// certain (non-`_UNCERTAIN`) result short-circuits.
pub fn needs_probe(cluster: &ClusterRecord, changed_pod: &PodRecord) -> Option<ClusterDiagStatus> {
    let status = cluster.status.as_ref()?;
    if status.status.is_uncertain() {
        return None;
    }
    let transition = changed_pod
        .membership_info
        .as_ref()
        .map(|info| info.last_transition_time)?;
    if status.last_probe_time < transition {
        None
    } else {
        Some(status.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common_lib::types::{ClusterKey, ClusterSpec, MemberRole, MemberStatus, MembershipInfo};

    fn cluster_with_status(status: ClusterDiagStatus, probed_ago: i64) -> ClusterRecord {
        let mut cluster = ClusterRecord::new(ClusterKey::new("ns", "c"), ClusterSpec::default());
        cluster.status = Some(ClusterResourceStatus {
            status,
            online_instances: 3,
            last_probe_time: Utc::now() - Duration::seconds(probed_ago),
        });
        cluster
    }

    fn pod_with_transition(seconds_ago: i64) -> PodRecord {
        let mut pod = PodRecord::new(&ClusterKey::new("ns", "c"), 0, "mysqladmin");
        pod.membership_info = Some(MembershipInfo {
            member_id: "uuid-0".into(),
            role: Some(MemberRole::Primary),
            status: MemberStatus::Online,
            view_id: Some("1:4".into()),
            version: None,
            last_transition_time: Utc::now() - Duration::seconds(seconds_ago),
            joined: true,
        });
        pod
    }

    #[test]
    fn fresh_certain_status_short_circuits() {
        let cluster = cluster_with_status(ClusterDiagStatus::Online, 10);
        let pod = pod_with_transition(60);
        assert_eq!(needs_probe(&cluster, &pod), Some(ClusterDiagStatus::Online));
    }

    #[test]
    fn stale_probe_or_uncertainty_forces_a_probe() {
        // Pod transitioned after the last probe.
        let cluster = cluster_with_status(ClusterDiagStatus::Online, 60);
        let pod = pod_with_transition(10);
        assert_eq!(needs_probe(&cluster, &pod), None);

        // Uncertain published state always re-probes.
        let cluster = cluster_with_status(ClusterDiagStatus::OnlineUncertain, 10);
        let pod = pod_with_transition(60);
        assert_eq!(needs_probe(&cluster, &pod), None);

        // Nothing published yet.
        let mut cluster = cluster_with_status(ClusterDiagStatus::Online, 10);
        cluster.status = None;
        assert_eq!(needs_probe(&cluster, &pod_with_transition(60)), None);
    }
}
