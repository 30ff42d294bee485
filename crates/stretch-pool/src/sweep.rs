//! Stale-provisioning sweep.
//!
//! A record stuck in `Provisioning` whose agent never showed up in the CI
//! listing is a failed create: the VM never booted, the install script
//! failed, or the process crashed between inserting the record and issuing
//! the create. Once it is older than the provisioning timeout it enters the
//! normal deprovisioning path so its resources are reclaimed and it stops
//! counting toward demand.

use tracing::warn;

use stretch_ci::AgentPool;
use stretch_compute::Provisioner;
use stretch_state::AgentStatus;

use crate::census::Census;
use crate::error::PoolResult;
use crate::manager::Cycle;
use crate::reconciler;

/// Deprovision timed-out `Provisioning` records. Returns how many were swept.
pub async fn sweep_stale_provisioning<C: AgentPool, P: Provisioner>(
    cx: &Cycle<'_, C, P>,
    census: &Census,
) -> PoolResult<usize> {
    let timeout = cx.settings.provisioning_timeout.as_secs();
    let mut swept = 0;

    for record in cx.registry.list_by_status(&[AgentStatus::Provisioning])? {
        if census.is_listed(&record.vm_name) {
            continue;
        }
        let age = cx.now.saturating_sub(record.timestamps.created);
        if age < timeout {
            continue;
        }

        warn!(
            vm_name = %record.vm_name,
            age_secs = age,
            "agent never registered; deprovisioning"
        );
        reconciler::begin_deprovisioning(cx, record, None).await?;
        swept += 1;
    }

    Ok(swept)
}
