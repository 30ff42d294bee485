//! stretch-pool — elastic build-agent pool reconciliation.
//!
//! Every cycle compares the CI system's view of the agent pool against the
//! agent registry and acts on the difference:
//!
//! 1. **census** classifies live agents as ready, building or offline.
//! 2. **reconciler** advances registry records, disables building agents so
//!    each VM runs exactly one job, and starts deprovisioning offline ones.
//! 3. **sweep** reclaims timed-out creates every cycle. **finalizer**
//!    finishes teardown once VMs are gone, and is skipped when no agent is
//!    ready or building.
//! 4. **demand** and **replenisher** create enough agents to cover the pool
//!    minimum plus the job queue.
//!
//! [`PoolManager`] owns the registry and clients and runs the cycles; the
//! cycle lease keeps two processes from reconciling at once.

pub mod census;
pub mod demand;
pub mod error;
pub mod finalizer;
pub mod manager;
pub mod reconciler;
pub mod replenisher;
pub mod sweep;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use census::{AgentClass, BuildingAgent, Census, OfflineAgent, classify};
pub use demand::{Demand, desired_new_agents};
pub use error::{PoolError, PoolResult};
pub use manager::{
    CYCLE_LEASE, Cycle, CycleOutcome, CycleReport, PoolManager, PoolSettings, epoch_secs,
};
pub use reconciler::ReconcileReport;
