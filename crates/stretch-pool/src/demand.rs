//! Demand estimator — how many agents to create this cycle.
//!
//! ```text
//! desired = pool_min_size − ready − provisioning + queued   (floored at 0)
//! ```
//!
//! `ready` and `provisioning` come from the registry rather than the live
//! census so that VMs which exist but have not registered yet are counted.
//! A negative result never shrinks the pool; agents only leave through the
//! offline/deprovisioning path.

use tracing::info;

use stretch_ci::AgentPool;
use stretch_compute::Provisioner;
use stretch_state::AgentStatus;

use crate::error::PoolResult;
use crate::manager::Cycle;

/// Inputs of the sizing formula for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Demand {
    pub pool_min_size: u32,
    pub ready: u32,
    pub provisioning: u32,
    /// Queued jobs with no agent reserved.
    pub queued: u32,
}

impl Demand {
    pub fn desired(&self) -> u32 {
        desired_new_agents(self.pool_min_size, self.ready, self.provisioning, self.queued)
    }
}

pub fn desired_new_agents(pool_min_size: u32, ready: u32, provisioning: u32, queued: u32) -> u32 {
    let desired = i64::from(pool_min_size) - i64::from(ready) - i64::from(provisioning)
        + i64::from(queued);
    desired.clamp(0, i64::from(u32::MAX)) as u32
}

/// Gather the formula inputs from the registry and the CI queue.
pub async fn estimate<C: AgentPool, P: Provisioner>(cx: &Cycle<'_, C, P>) -> PoolResult<Demand> {
    let provisioning = cx.registry.count_by_status(AgentStatus::Provisioning)?;
    let ready = cx.registry.count_by_status(AgentStatus::Ready)?;
    let queued = cx.ci.queued_job_count().await?;

    let demand = Demand {
        pool_min_size: cx.settings.min_size,
        ready,
        provisioning,
        queued,
    };
    info!(
        desired = demand.desired(),
        pool_min = demand.pool_min_size,
        ready,
        provisioning,
        queued,
        "estimated agent demand"
    );
    Ok(demand)
}
