//! Cluster and candidate diagnosis.
//!
//! Probing talks to every non-deleting pod with bounded fan-out and a per
//! probe timeout; classification is a pure function of the collected
//! outcomes, so the order in which probes complete can never change the
//! diagnosis.

use common_lib::{
    mysql::{gtid::count_gtids, AdminClient, GtidSet, MembershipProbe},
    types::{
        CandidateDiagStatus, ClusterDiagStatus, ClusterDiagnosis, ClusterRecord, MemberStatus,
        PodRecord,
    },
};
use futures::{stream, StreamExt};
use itertools::Itertools;
use std::{collections::HashMap, time::Duration};

/// The facts about a cluster resource that steer classification.
#[derive(Debug, Clone, Copy)]
pub struct ClusterFacts {
    pub declared_instances: u32,
    pub deleting: bool,
    pub created: bool,
}

impl From<&ClusterRecord> for ClusterFacts {
    fn from(cluster: &ClusterRecord) -> Self {
        Self {
            declared_instances: cluster.spec.instances,
            deleting: cluster.deleting,
            created: cluster.created(),
        }
    }
}

/// What probing a single pod yielded.
#[derive(Debug, Clone)]
pub struct PodProbe {
    pub index: u32,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// No admin session could be established within the timeout.
    Unreachable { reason: String },
    /// The member answered; its view of the group and its GTID state.
    Member {
        probe: MembershipProbe,
        gtid_executed: Option<String>,
    },
}

impl PodProbe {
    fn member(&self) -> Option<&MembershipProbe> {
        match &self.outcome {
            ProbeOutcome::Member { probe, .. } => Some(probe),
            ProbeOutcome::Unreachable { .. } => None,
        }
    }
}

/// Probe all non-deleting pods of the cluster in parallel.
pub async fn gather_probes(
    admin: &dyn AdminClient,
    pods: &[PodRecord],
    timeout: Duration,
    fanout: usize,
) -> Vec<PodProbe> {
    fn not_deleting(pod: &&PodRecord) -> bool {
        !pod.deleting
    }

    let mut probes: Vec<PodProbe> = stream::iter(
        pods.iter()
            .filter(not_deleting as fn(&&PodRecord) -> bool)
            .cloned(),
    )
    .map(|pod: PodRecord| async move { probe_pod(admin, &pod, timeout).await })
    .buffer_unordered(fanout.max(1))
    .collect()
    .await;
    probes.sort_by_key(|probe| probe.index);
    probes
}

async fn probe_pod(admin: &dyn AdminClient, pod: &PodRecord, timeout: Duration) -> PodProbe {
    let connect = tokio::time::timeout(timeout, admin.connect_dba(&pod.endpoint_co));
    let mut session = match connect.await {
        Ok(Ok(session)) => session,
        Ok(Err(error)) => {
            tracing::debug!(pod.name = %pod.name, %error, "member probe: connect failed");
            return PodProbe {
                index: pod.index,
                outcome: ProbeOutcome::Unreachable {
                    reason: error.to_string(),
                },
            };
        }
        Err(_) => {
            tracing::debug!(pod.name = %pod.name, "member probe: connect timed out");
            return PodProbe {
                index: pod.index,
                outcome: ProbeOutcome::Unreachable {
                    reason: format!("connect timed out after {:?}", timeout),
                },
            };
        }
    };

    let probe = match session.membership_info().await {
        Ok(probe) => probe,
        Err(error) => {
            tracing::debug!(pod.name = %pod.name, %error, "member probe: query failed");
            return PodProbe {
                index: pod.index,
                outcome: ProbeOutcome::Unreachable {
                    reason: error.to_string(),
                },
            };
        }
    };
    let gtid_executed = match session.gtid_state().await {
        Ok(state) => state.map(|state| state.executed),
        Err(_) => None,
    };
    PodProbe {
        index: pod.index,
        outcome: ProbeOutcome::Member {
            probe,
            gtid_executed,
        },
    }
}

/// Derive the cluster diagnosis from the collected probe outcomes.
///
/// Precedence, first match wins: FINALIZING, INITIALIZING, ONLINE*,
/// SPLIT_BRAIN*, OFFLINE*, NO_QUORUM*, UNKNOWN, INVALID.
pub fn classify(facts: &ClusterFacts, probes: &[PodProbe]) -> ClusterDiagnosis {
    let gtid_executed: HashMap<u32, Option<String>> = probes
        .iter()
        .map(|probe| {
            let gtids = match &probe.outcome {
                ProbeOutcome::Member { gtid_executed, .. } => gtid_executed.clone(),
                ProbeOutcome::Unreachable { .. } => None,
            };
            (probe.index, gtids)
        })
        .collect();

    let members: Vec<(u32, &MembershipProbe)> = probes
        .iter()
        .filter_map(|probe| probe.member().map(|member| (probe.index, member)))
        .collect();
    let unreachable = probes.len() - members.len();
    let uncertain = unreachable > 0;

    let online_members: Vec<u32> = members
        .iter()
        .filter(|(_, member)| member.status.online())
        .map(|(index, _)| *index)
        .collect();

    // A pod can anchor a forced quorum when its view still contains a
    // majority of the declared group, reachable or not.
    let quorum_candidates: Vec<u32> = members
        .iter()
        .filter(|(_, member)| {
            member.status.online() && member.member_count * 2 > facts.declared_instances
        })
        .map(|(index, _)| *index)
        .collect();

    let diagnosis = |status, primary| ClusterDiagnosis {
        status,
        primary,
        online_members: online_members.clone(),
        quorum_candidates: quorum_candidates.clone(),
        gtid_executed: gtid_executed.clone(),
    };

    if facts.deleting {
        return diagnosis(ClusterDiagStatus::Finalizing, None);
    }
    if probes.is_empty() || !facts.created {
        return diagnosis(ClusterDiagStatus::Initializing, None);
    }
    if members.is_empty() {
        return diagnosis(ClusterDiagStatus::Unknown, None);
    }

    // Members that claim a group with quorum, bucketed by the view they
    // report. One view: healthy group. Several views each claiming quorum:
    // diverged group state.
    let quorum_views: Vec<&String> = members
        .iter()
        .filter(|(_, member)| member.status.online() && member.has_quorum())
        .filter_map(|(_, member)| member.view_id.as_ref())
        .unique()
        .collect();
    let online_without_view = members
        .iter()
        .any(|(_, member)| member.status.online() && member.view_id.is_none());

    if online_without_view {
        // Structural contradiction: a member cannot be ONLINE outside a view.
        return diagnosis(ClusterDiagStatus::Invalid, None);
    }

    match quorum_views.len() {
        1 => {
            let view_id = quorum_views[0];
            let in_view_online: Vec<u32> = members
                .iter()
                .filter(|(_, member)| {
                    member.status.online() && member.view_id.as_ref() == Some(view_id)
                })
                .map(|(index, _)| *index)
                .collect();
            let primary = members
                .iter()
                .filter(|(_, member)| member.view_id.as_ref() == Some(view_id))
                .find(|(_, member)| {
                    member
                        .role
                        .map(|role| role == common_lib::types::MemberRole::Primary)
                        .unwrap_or(false)
                })
                .map(|(index, _)| *index);

            // A single view with quorum is the authoritative group. ONLINE
            // means every existing pod is an online member of it; pods that
            // are not (yet) members make it partial.
            let status = if uncertain {
                ClusterDiagStatus::OnlineUncertain
            } else if in_view_online.len() == probes.len() {
                ClusterDiagStatus::Online
            } else {
                ClusterDiagStatus::OnlinePartial
            };
            return diagnosis(status, primary);
        }
        0 => {}
        _ => {
            let status = if uncertain {
                ClusterDiagStatus::SplitBrainUncertain
            } else {
                ClusterDiagStatus::SplitBrain
            };
            return diagnosis(status, None);
        }
    }

    let all_down = members.iter().all(|(_, member)| {
        matches!(member.status, MemberStatus::Offline | MemberStatus::Error)
    });
    if all_down {
        let status = if uncertain {
            ClusterDiagStatus::OfflineUncertain
        } else {
            ClusterDiagStatus::Offline
        };
        return diagnosis(status, None);
    }

    if let Some((_, survivor)) = members
        .iter()
        .find(|(_, member)| member.status.online() && !member.has_quorum())
    {
        // When the survivor's view spans the whole declared group, every
        // unreachable pod is accounted for as a view member and cannot be
        // part of a second partition with quorum.
        let accounted = survivor.member_count >= facts.declared_instances;
        let status = if uncertain && !accounted {
            ClusterDiagStatus::NoQuorumUncertain
        } else {
            ClusterDiagStatus::NoQuorum
        };
        return diagnosis(status, None);
    }

    // A group with quorum but no online majority of the declared set, or
    // members stuck RECOVERING against a dead group: nothing the decision
    // table can safely act on.
    diagnosis(ClusterDiagStatus::Invalid, None)
}

/// The facts needed to classify one candidate pod against a cluster.
#[derive(Debug, Clone)]
pub struct CandidateFacts {
    /// The candidate's `@@server_uuid` is present in the cluster metadata.
    pub known_to_metadata: bool,
    /// The candidate is ONLINE in the cluster's current view.
    pub in_current_view: bool,
    /// The cluster's executed GTID set.
    pub cluster_gtids: GtidSet,
    /// The candidate's own state, `None` when it could not be reached.
    pub candidate: Option<CandidateState>,
}

/// Local state of a candidate instance.
#[derive(Debug, Clone)]
pub struct CandidateState {
    /// GR member state reported locally, if the plugin has any.
    pub status: Option<MemberStatus>,
    /// The candidate's executed GTID set, when readable.
    pub gtid_executed: Option<GtidSet>,
}

/// Classify a candidate pod relative to an existing cluster.
pub fn classify_candidate(facts: &CandidateFacts) -> CandidateDiagStatus {
    let candidate = match &facts.candidate {
        Some(candidate) => candidate,
        None => return CandidateDiagStatus::Unreachable,
    };

    let gtids_compatible = match &candidate.gtid_executed {
        Some(gtids) => gtids.is_empty() || gtids.is_subset(&facts.cluster_gtids),
        // Unreadable GTIDs: nothing proves an errant transaction.
        None => true,
    };

    if facts.known_to_metadata {
        if facts.in_current_view && candidate.status == Some(MemberStatus::Online) {
            CandidateDiagStatus::Member
        } else if gtids_compatible {
            CandidateDiagStatus::Rejoinable
        } else {
            CandidateDiagStatus::Broken
        }
    } else {
        let has_local_group = matches!(
            candidate.status,
            Some(MemberStatus::Online) | Some(MemberStatus::Recovering)
        );
        if !has_local_group && gtids_compatible {
            CandidateDiagStatus::Joinable
        } else {
            CandidateDiagStatus::Broken
        }
    }
}

/// Pick the reboot seed: the pod with the most executed transactions, ties
/// broken by the highest ordinal.
pub fn select_pod_with_most_gtids(gtids: &HashMap<u32, Option<String>>) -> Option<u32> {
    gtids
        .iter()
        .filter_map(|(index, gtids)| {
            gtids
                .as_ref()
                .map(|gtids| (count_gtids(gtids), *index))
        })
        .max()
        .map(|(_, index)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_lib::types::MemberRole;

    fn facts(instances: u32) -> ClusterFacts {
        ClusterFacts {
            declared_instances: instances,
            deleting: false,
            created: true,
        }
    }

    fn member(
        index: u32,
        role: Option<MemberRole>,
        status: MemberStatus,
        view_id: Option<&str>,
        member_count: u32,
        reachable: u32,
    ) -> PodProbe {
        PodProbe {
            index,
            outcome: ProbeOutcome::Member {
                probe: MembershipProbe {
                    member_id: format!("uuid-{}", index),
                    role,
                    status,
                    view_id: view_id.map(Into::into),
                    version: Some("8.0.29".into()),
                    member_count,
                    reachable_member_count: reachable,
                },
                gtid_executed: Some(format!("a:1-{}", index + 1)),
            },
        }
    }

    fn unreachable(index: u32) -> PodProbe {
        PodProbe {
            index,
            outcome: ProbeOutcome::Unreachable {
                reason: "connect timed out".into(),
            },
        }
    }

    #[test]
    fn deleting_wins_over_everything() {
        let facts = ClusterFacts {
            deleting: true,
            ..facts(3)
        };
        let diag = classify(&facts, &[unreachable(0)]);
        assert_eq!(diag.status, ClusterDiagStatus::Finalizing);
    }

    #[test]
    fn uncreated_or_empty_cluster_is_initializing() {
        let uncreated = ClusterFacts {
            created: false,
            ..facts(3)
        };
        assert_eq!(
            classify(&uncreated, &[unreachable(0)]).status,
            ClusterDiagStatus::Initializing
        );
        assert_eq!(
            classify(&facts(3), &[]).status,
            ClusterDiagStatus::Initializing
        );
    }

    #[test]
    fn healthy_cluster_is_online_with_its_primary() {
        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:5"), 3, 3),
            member(1, Some(MemberRole::Secondary), MemberStatus::Online, Some("v:5"), 3, 3),
            member(2, Some(MemberRole::Secondary), MemberStatus::Online, Some("v:5"), 3, 3),
        ];
        let diag = classify(&facts(3), &probes);
        assert_eq!(diag.status, ClusterDiagStatus::Online);
        assert_eq!(diag.primary, Some(0));
        assert_eq!(diag.online_members, vec![0, 1, 2]);
        assert_eq!(diag.quorum_candidates, vec![0, 1, 2]);
    }

    #[test]
    fn fresh_seed_alone_is_online() {
        // Right after create_cluster only the seed pod exists: 1/1 online.
        let probes = vec![member(
            0,
            Some(MemberRole::Primary),
            MemberStatus::Online,
            Some("v:1"),
            1,
            1,
        )];
        let diag = classify(&facts(3), &probes);
        assert_eq!(diag.status, ClusterDiagStatus::Online);
        assert_eq!(diag.primary, Some(0));
    }

    #[test]
    fn growing_cluster_is_online_partial() {
        // The next pod exists but has not joined the group yet.
        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:5"), 2, 2),
            member(1, Some(MemberRole::Secondary), MemberStatus::Online, Some("v:5"), 2, 2),
            member(2, None, MemberStatus::Offline, None, 0, 0),
        ];
        let diag = classify(&facts(3), &probes);
        assert_eq!(diag.status, ClusterDiagStatus::OnlinePartial);
        assert_eq!(diag.primary, Some(0));
        assert_eq!(diag.online_members, vec![0, 1]);
    }

    #[test]
    fn unreachable_member_makes_online_uncertain() {
        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:5"), 3, 2),
            member(1, Some(MemberRole::Secondary), MemberStatus::Online, Some("v:5"), 3, 2),
            unreachable(2),
        ];
        let diag = classify(&facts(3), &probes);
        assert_eq!(diag.status, ClusterDiagStatus::OnlineUncertain);
        assert_eq!(diag.gtid_executed.get(&2), Some(&None));
    }

    #[test]
    fn probe_order_does_not_change_the_diagnosis() {
        let mut probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:5"), 3, 2),
            member(1, Some(MemberRole::Secondary), MemberStatus::Online, Some("v:5"), 3, 2),
            unreachable(2),
        ];
        let forwards = classify(&facts(3), &probes);
        probes.reverse();
        let backwards = classify(&facts(3), &probes);
        assert_eq!(forwards, backwards);
    }

    #[test]
    fn complete_outage_is_offline() {
        let probes = vec![
            member(0, None, MemberStatus::Offline, None, 0, 0),
            member(1, None, MemberStatus::Offline, None, 0, 0),
            member(2, None, MemberStatus::Error, None, 0, 0),
        ];
        assert_eq!(classify(&facts(3), &probes).status, ClusterDiagStatus::Offline);

        let probes = vec![
            member(0, None, MemberStatus::Offline, None, 0, 0),
            member(1, None, MemberStatus::Offline, None, 0, 0),
            unreachable(2),
        ];
        assert_eq!(
            classify(&facts(3), &probes).status,
            ClusterDiagStatus::OfflineUncertain
        );
    }

    #[test]
    fn minority_partition_is_no_quorum() {
        // One survivor sees its two peers as unreachable: no majority.
        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:7"), 3, 1),
            member(1, None, MemberStatus::Offline, None, 0, 0),
            member(2, None, MemberStatus::Offline, None, 0, 0),
        ];
        let diag = classify(&facts(3), &probes);
        assert_eq!(diag.status, ClusterDiagStatus::NoQuorum);
        assert_eq!(diag.quorum_candidates, vec![0]);

        // Operator-unreachable peers that are still accounted for in the
        // survivor's view cannot hide a second quorum: still certain.
        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:7"), 3, 1),
            unreachable(1),
            unreachable(2),
        ];
        let diag = classify(&facts(3), &probes);
        assert_eq!(diag.status, ClusterDiagStatus::NoQuorum);
        assert_eq!(diag.quorum_candidates, vec![0]);

        // A survivor whose view does not span the declared group leaves an
        // unreachable pod unaccounted for: uncertain.
        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:7"), 2, 1),
            member(1, None, MemberStatus::Offline, None, 0, 0),
            unreachable(2),
        ];
        assert_eq!(
            classify(&facts(3), &probes).status,
            ClusterDiagStatus::NoQuorumUncertain
        );
    }

    #[test]
    fn diverged_views_with_quorum_each_are_split_brain() {
        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:8"), 3, 2),
            member(1, Some(MemberRole::Primary), MemberStatus::Online, Some("v:9"), 3, 2),
        ];
        assert_eq!(
            classify(&facts(3), &probes).status,
            ClusterDiagStatus::SplitBrain
        );

        let probes = vec![
            member(0, Some(MemberRole::Primary), MemberStatus::Online, Some("v:8"), 3, 2),
            member(1, Some(MemberRole::Primary), MemberStatus::Online, Some("v:9"), 3, 2),
            unreachable(2),
        ];
        assert_eq!(
            classify(&facts(3), &probes).status,
            ClusterDiagStatus::SplitBrainUncertain
        );
    }

    #[test]
    fn nothing_reachable_is_unknown() {
        let probes = vec![unreachable(0), unreachable(1), unreachable(2)];
        assert_eq!(classify(&facts(3), &probes).status, ClusterDiagStatus::Unknown);
    }

    #[test]
    fn online_member_without_a_view_is_invalid() {
        let probes = vec![member(0, None, MemberStatus::Online, None, 3, 3)];
        assert_eq!(classify(&facts(3), &probes).status, ClusterDiagStatus::Invalid);
    }

    #[test]
    fn seed_selection_takes_most_gtids_then_highest_index() {
        let mut gtids = HashMap::new();
        gtids.insert(0, Some("a:1-5".to_string()));
        gtids.insert(1, Some("a:1-7".to_string()));
        gtids.insert(2, Some("a:1-6".to_string()));
        assert_eq!(select_pod_with_most_gtids(&gtids), Some(1));

        let mut tied = HashMap::new();
        tied.insert(0, Some("a:1-7".to_string()));
        tied.insert(1, Some("a:1-7".to_string()));
        tied.insert(2, None);
        assert_eq!(select_pod_with_most_gtids(&tied), Some(1));

        let unknown: HashMap<u32, Option<String>> = HashMap::new();
        assert_eq!(select_pod_with_most_gtids(&unknown), None);
    }

    #[test]
    fn candidate_classification() {
        let cluster_gtids: GtidSet = "a:1-100".parse().unwrap();

        let joinable = CandidateFacts {
            known_to_metadata: false,
            in_current_view: false,
            cluster_gtids: cluster_gtids.clone(),
            candidate: Some(CandidateState {
                status: None,
                gtid_executed: Some("a:1-50".parse().unwrap()),
            }),
        };
        assert_eq!(classify_candidate(&joinable), CandidateDiagStatus::Joinable);

        let member = CandidateFacts {
            known_to_metadata: true,
            in_current_view: true,
            cluster_gtids: cluster_gtids.clone(),
            candidate: Some(CandidateState {
                status: Some(MemberStatus::Online),
                gtid_executed: Some("a:1-100".parse().unwrap()),
            }),
        };
        assert_eq!(classify_candidate(&member), CandidateDiagStatus::Member);

        let rejoinable = CandidateFacts {
            known_to_metadata: true,
            in_current_view: false,
            cluster_gtids: cluster_gtids.clone(),
            candidate: Some(CandidateState {
                status: Some(MemberStatus::Offline),
                gtid_executed: Some("a:1-80".parse().unwrap()),
            }),
        };
        assert_eq!(classify_candidate(&rejoinable), CandidateDiagStatus::Rejoinable);

        let errant = CandidateFacts {
            known_to_metadata: false,
            in_current_view: false,
            cluster_gtids: cluster_gtids.clone(),
            candidate: Some(CandidateState {
                status: None,
                gtid_executed: Some("a:1-50,b:1-3".parse().unwrap()),
            }),
        };
        assert_eq!(classify_candidate(&errant), CandidateDiagStatus::Broken);

        let unreachable = CandidateFacts {
            known_to_metadata: false,
            in_current_view: false,
            cluster_gtids,
            candidate: None,
        };
        assert_eq!(
            classify_candidate(&unreachable),
            CandidateDiagStatus::Unreachable
        );
    }
}
