//! PoolManager — runs reconciliation cycles.
//!
//! Each cycle takes the registry lease, builds a [`Cycle`] context holding
//! the registry, CI client, provisioner and the cycle's clock reading, and
//! passes it to every component in order:
//!
//! ```text
//! census ─► reconcile ─► sweep stale provisioning ─┬─► finalize ─┬─► estimate ─► replenish
//!                                                  └─(gated)─────┘
//! ```
//!
//! The lease is released when the guard drops, whether the cycle succeeded
//! or not.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stretch_ci::AgentPool;
use stretch_compute::Provisioner;
use stretch_core::StretchConfig;
use stretch_state::AgentRegistry;

use crate::census::Census;
use crate::demand::{self, Demand};
use crate::error::{PoolError, PoolResult};
use crate::finalizer;
use crate::reconciler::{self, ReconcileReport};
use crate::replenisher;
use crate::sweep;

/// Registry lease that serializes reconciliation cycles.
pub const CYCLE_LEASE: &str = "reconcile";

/// Pool parameters used by every cycle.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_size: u32,
    pub vm_prefix: String,
    pub ci_url: String,
    pub ci_token: String,
    pub pool_name: String,
    /// How long a record may stay `Provisioning` before it is treated as failed.
    pub provisioning_timeout: Duration,
    pub lease_ttl: Duration,
    /// Lease holder identity of this process.
    pub holder: String,
}

impl PoolSettings {
    pub fn from_config(config: &StretchConfig) -> Self {
        Self {
            min_size: config.pool.min_size,
            vm_prefix: config.pool.vm_prefix.clone(),
            ci_url: config.pipelines.url.clone(),
            ci_token: config.pipelines.token.clone(),
            pool_name: config.pipelines.pool_name.clone(),
            provisioning_timeout: config.pool.provisioning_timeout(),
            lease_ttl: config.pool.lease_ttl(),
            holder: default_holder(),
        }
    }
}

fn default_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "stretchd".to_string());
    format!("{host}:{}", std::process::id())
}

/// Shared handles for one reconciliation cycle.
pub struct Cycle<'a, C, P> {
    pub registry: &'a AgentRegistry,
    pub ci: &'a C,
    pub compute: &'a P,
    pub settings: &'a PoolSettings,
    /// Unix seconds at cycle start; every timestamp written this cycle uses it.
    pub now: u64,
}

/// What one completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reconciled: ReconcileReport,
    pub swept: usize,
    /// `None` when cleanup was held back by the safety gate.
    pub finalized: Option<usize>,
    pub demand: Demand,
    pub created: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another process holds the cycle lease.
    Skipped,
}

/// Releases the cycle lease on drop.
struct LeaseGuard<'a> {
    registry: &'a AgentRegistry,
    holder: &'a str,
}

impl<'a> LeaseGuard<'a> {
    fn acquire(
        registry: &'a AgentRegistry,
        holder: &'a str,
        now: u64,
        ttl: Duration,
    ) -> PoolResult<Option<Self>> {
        let lease = registry.try_acquire_lease(CYCLE_LEASE, holder, now, ttl.as_secs())?;
        Ok(lease.map(|_| Self { registry, holder }))
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.registry.release_lease(CYCLE_LEASE, self.holder) {
            error!(error = %e, "failed to release cycle lease");
        }
    }
}

impl<C: AgentPool, P: Provisioner> Cycle<'_, C, P> {
    /// Run every stage in order. Any external failure aborts the rest.
    ///
    /// The cycle lease is renewed before each stage that writes, so a slow
    /// cycle keeps it past `lease_ttl`. If another process took it over in
    /// the meantime the cycle stops with [`PoolError::LeaseLost`].
    pub async fn run(&self) -> PoolResult<CycleReport> {
        let started = Instant::now();

        debug!("retrieving agent data");
        let agents = self.ci.list_agents().await?;
        let census = Census::from_agents(&agents);
        census.log();

        self.renew_lease(started)?;
        let reconciled = reconciler::reconcile(self, &census).await?;
        let swept = sweep::sweep_stale_provisioning(self, &census).await?;

        self.renew_lease(started)?;

        // If there are no usable agents any queued builds will fail, and an
        // empty census may be an API hiccup. Only clean up when at least one
        // agent is ready or building.
        let finalized = if census.has_usable_agents() {
            Some(finalizer::finalize(self).await?)
        } else {
            warn!("no ready or building agents; deferring deprovisioning cleanup");
            None
        };

        let demand = demand::estimate(self).await?;
        self.renew_lease(started)?;
        let created = replenisher::replenish(self, demand.desired()).await?;

        Ok(CycleReport {
            reconciled,
            swept,
            finalized,
            demand,
            created,
        })
    }

    /// Extend the cycle lease from the time elapsed since the cycle began.
    fn renew_lease(&self, started: Instant) -> PoolResult<()> {
        let now = self.now + started.elapsed().as_secs();
        let lease = self.registry.try_acquire_lease(
            CYCLE_LEASE,
            &self.settings.holder,
            now,
            self.settings.lease_ttl.as_secs(),
        )?;
        match lease {
            Some(_) => Ok(()),
            None => Err(PoolError::LeaseLost(CYCLE_LEASE)),
        }
    }
}

/// Owns the registry and external clients for the daemon's lifetime.
pub struct PoolManager<C, P> {
    registry: AgentRegistry,
    ci: C,
    compute: P,
    settings: PoolSettings,
}

impl<C: AgentPool, P: Provisioner> PoolManager<C, P> {
    pub fn new(registry: AgentRegistry, ci: C, compute: P, settings: PoolSettings) -> Self {
        Self {
            registry,
            ci,
            compute,
            settings,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn ci(&self) -> &C {
        &self.ci
    }

    pub fn compute(&self) -> &P {
        &self.compute
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Run one reconciliation cycle at time `now`.
    pub async fn run_cycle(&self, now: u64) -> PoolResult<CycleOutcome> {
        let Some(_lease) =
            LeaseGuard::acquire(&self.registry, &self.settings.holder, now, self.settings.lease_ttl)?
        else {
            info!("another reconciliation cycle holds the lease; skipping");
            return Ok(CycleOutcome::Skipped);
        };

        let cycle = Cycle {
            registry: &self.registry,
            ci: &self.ci,
            compute: &self.compute,
            settings: &self.settings,
            now,
        };
        let report = cycle.run().await?;
        info!(
            created = report.created.len(),
            finalized = report.finalized.unwrap_or(0),
            swept = report.swept,
            "reconciliation cycle complete"
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Run a cycle every `interval` until shutdown is signalled.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "pool manager started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(epoch_secs()).await {
                        error!(error = %e, "reconciliation cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("pool manager shutting down");
                    break;
                }
            }
        }
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
