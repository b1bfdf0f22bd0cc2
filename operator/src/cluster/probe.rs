//! Member probing: read one member's view of the group, persist it on the
//! pod and keep the readiness gate in sync.

use common_lib::{
    mysql::{DbaSession, MembershipProbe},
    types::PodRecord,
};

use crate::{cluster::api::ClusterApi, error::Error};

/// Probe the member behind `session`, persist the observed membership on
/// the pod and toggle its readiness gate. Returns the probe tuple.
pub async fn probe_member(
    api: &dyn ClusterApi,
    session: &mut dyn DbaSession,
    pod: &PodRecord,
    joined: bool,
) -> Result<MembershipProbe, Error> {
    let probe = session.membership_info().await?;
    tracing::debug!(
        pod.name = %pod.name,
        member.role = ?probe.role,
        member.status = %probe.status,
        member.view_id = ?probe.view_id,
        member.version = ?probe.version,
        members = probe.member_count,
        reachable_members = probe.reachable_member_count,
        "instance probe"
    );

    api.update_membership(pod, &probe, joined).await?;
    api.set_member_ready(pod, probe.status.online()).await?;
    Ok(probe)
}

/// Log the server identity and GTID state of the instance behind `session`.
/// GTID variables may be unreadable on a badly broken server; that is
/// reported as absent, not as a failure.
pub async fn log_mysql_info(session: &mut dyn DbaSession) -> Result<(), Error> {
    let info = session.instance_info().await?;
    let gtids = session.gtid_state().await?;
    let (executed, purged) = match &gtids {
        Some(state) => (Some(state.executed.as_str()), Some(state.purged.as_str())),
        None => (None, None),
    };
    tracing::info!(
        endpoint = %session.endpoint(),
        server.id = info.server_id,
        server.uuid = %info.server_uuid,
        server.report_host = %info.report_host,
        gtid.executed = ?executed,
        gtid.purged = ?purged,
        "local mysql state"
    );
    Ok(())
}
