//! Lifecycle reconciler — applies the census to registry records.
//!
//! Ready and building agents advance their records; agents that finished
//! and went offline move to `Deprovisioning` and their VM deletion is
//! requested. Every enabled building agent is disabled so it runs one job;
//! beyond that, only agents this pool created are ever touched. Applying
//! the same census twice leaves the registry as the first pass left it.

use tracing::{debug, info, warn};

use stretch_ci::AgentPool;
use stretch_compute::Provisioner;
use stretch_state::{AgentRecord, AgentResources, ExternalAgentId, StateError};

use crate::census::{BuildingAgent, Census, OfflineAgent};
use crate::error::PoolResult;
use crate::manager::Cycle;

/// Counts of what one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub ready: usize,
    pub building: usize,
    pub disabled: usize,
    pub deprovisioning: usize,
    /// Census names with no registry record.
    pub unknown: usize,
    /// Transitions the lifecycle does not allow.
    pub rejected: usize,
}

pub async fn reconcile<C: AgentPool, P: Provisioner>(
    cx: &Cycle<'_, C, P>,
    census: &Census,
) -> PoolResult<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for name in &census.ready {
        apply_ready(cx, name, &mut report)?;
    }

    for agent in &census.building {
        apply_building(cx, agent, &mut report).await?;
    }

    for agent in &census.offline {
        apply_offline(cx, agent, &mut report).await?;
    }

    Ok(report)
}

fn apply_ready<C, P>(cx: &Cycle<'_, C, P>, name: &str, report: &mut ReconcileReport) -> PoolResult<()> {
    let Some(mut record) = cx.registry.get_agent_by_name(name)? else {
        debug!(vm_name = %name, "ready agent has no registry record");
        report.unknown += 1;
        return Ok(());
    };

    let before = record.clone();
    match record.mark_ready(cx.now) {
        Ok(()) => {
            if store_if_changed(cx, &before, &record)? {
                info!(vm_name = %name, "agent ready");
                report.ready += 1;
            }
        }
        Err(e) => reject(name, e, report)?,
    }
    Ok(())
}

async fn apply_building<C: AgentPool, P>(
    cx: &Cycle<'_, C, P>,
    agent: &BuildingAgent,
    report: &mut ReconcileReport,
) -> PoolResult<()> {
    // Let the current job finish but take no new ones. Applies to every
    // building agent, whatever its registry record says.
    if agent.enabled {
        info!(vm_name = %agent.name, agent_id = agent.id, "disabling building agent");
        cx.ci.disable_agent(agent.id).await?;
        report.disabled += 1;
    }

    let Some(mut record) = cx.registry.get_agent_by_name(&agent.name)? else {
        debug!(vm_name = %agent.name, "building agent has no registry record");
        report.unknown += 1;
        return Ok(());
    };

    let before = record.clone();
    if let Err(e) = record.mark_building(agent.id, cx.now) {
        return reject(&agent.name, e, report);
    }
    if store_if_changed(cx, &before, &record)? {
        info!(vm_name = %agent.name, agent_id = agent.id, "agent building");
        report.building += 1;
    }
    Ok(())
}

async fn apply_offline<C, P: Provisioner>(
    cx: &Cycle<'_, C, P>,
    agent: &OfflineAgent,
    report: &mut ReconcileReport,
) -> PoolResult<()> {
    let Some(record) = cx.registry.get_agent_by_name(&agent.name)? else {
        info!(vm_name = %agent.name, "offline agent found without a registry record; skipping");
        report.unknown += 1;
        return Ok(());
    };

    if !record.status.is_active() {
        debug!(vm_name = %agent.name, status = %record.status, "already deprovisioning");
        return Ok(());
    }

    begin_deprovisioning(cx, record, Some(agent.id)).await?;
    report.deprovisioning += 1;
    Ok(())
}

/// Move an active record to `Deprovisioning` and request VM deletion.
///
/// The NIC, public IP and disk ids are read from the live VM first because
/// they cannot be looked up once it is gone. If the VM is already absent the
/// NIC and IP ids are derived from the agent name and no delete is issued.
pub(crate) async fn begin_deprovisioning<C, P: Provisioner>(
    cx: &Cycle<'_, C, P>,
    mut record: AgentRecord,
    agent_id: Option<ExternalAgentId>,
) -> PoolResult<()> {
    let vm_id = record
        .resources
        .vm_id
        .clone()
        .unwrap_or_else(|| cx.compute.vm_resource_id(&record.vm_name));

    let live = cx.compute.get_vm(&vm_id).await?;
    let found = live.is_some();
    let resources = live.unwrap_or_else(|| cx.compute.derived_resources(&record.vm_name));

    record.mark_deprovisioning(
        agent_id,
        AgentResources {
            vm_id: Some(vm_id.clone()),
            nic_id: resources.nic_id,
            public_ip_id: resources.public_ip_id,
            disk_id: resources.disk_id,
        },
        cx.now,
    )?;
    cx.registry.put_agent(&record)?;
    info!(vm_name = %record.vm_name, ?agent_id, "agent deprovisioning");

    if found {
        info!(vm_name = %record.vm_name, %vm_id, "deleting vm");
        cx.compute.delete_vm(&vm_id).await?;
    } else {
        warn!(vm_name = %record.vm_name, %vm_id, "vm already gone");
    }
    Ok(())
}

fn store_if_changed<C, P>(
    cx: &Cycle<'_, C, P>,
    before: &AgentRecord,
    after: &AgentRecord,
) -> PoolResult<bool> {
    if before == after {
        return Ok(false);
    }
    cx.registry.put_agent(after)?;
    Ok(true)
}

/// Log and count a disallowed transition; any other error propagates.
fn reject(name: &str, err: StateError, report: &mut ReconcileReport) -> PoolResult<()> {
    match err {
        StateError::InvalidTransition { from, to } => {
            warn!(vm_name = %name, %from, %to, "ignoring disallowed status change");
            report.rejected += 1;
            Ok(())
        }
        other => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::PoolSettings;
    use crate::test_support::*;
    use stretch_state::{AgentRegistry, AgentStatus};

    struct Env {
        registry: AgentRegistry,
        ci: FakeCi,
        compute: FakeCompute,
        settings: PoolSettings,
    }

    impl Env {
        fn new() -> Self {
            Self {
                registry: AgentRegistry::open_in_memory().unwrap(),
                ci: FakeCi::new(),
                compute: FakeCompute::new(),
                settings: test_settings(2),
            }
        }

        fn cycle(&self, now: u64) -> Cycle<'_, FakeCi, FakeCompute> {
            Cycle {
                registry: &self.registry,
                ci: &self.ci,
                compute: &self.compute,
                settings: &self.settings,
                now,
            }
        }

        /// A record as the replenisher leaves it, with its VM running.
        fn provisioned(&self) -> AgentRecord {
            let mut record = self.registry.create_agent("agent", 100).unwrap();
            record.resources.vm_id = Some(self.compute.vm_resource_id(&record.vm_name));
            self.registry.put_agent(&record).unwrap();
            self.compute.add_vm(&record.vm_name);
            record
        }

        async fn reconcile(&self, now: u64) -> ReconcileReport {
            let census = Census::from_agents(&self.ci.list_agents().await.unwrap());
            reconcile(&self.cycle(now), &census).await.unwrap()
        }

        fn status(&self, name: &str) -> AgentStatus {
            self.registry.get_agent_by_name(name).unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn ready_agent_marks_record_ready() {
        let env = Env::new();
        env.provisioned();
        env.ci.set_agents(vec![idle_agent(11, "agent1")]);

        let report = env.reconcile(200).await;

        assert_eq!(report.ready, 1);
        let record = env.registry.get_agent_by_name("agent1").unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Ready);
        assert_eq!(record.timestamps.ready, Some(200));
    }

    #[tokio::test]
    async fn building_agent_is_recorded_and_disabled() {
        let env = Env::new();
        env.provisioned();
        env.ci.set_agents(vec![busy_agent(11, "agent1", true)]);

        let report = env.reconcile(200).await;

        assert_eq!(report.building, 1);
        assert_eq!(report.disabled, 1);
        assert_eq!(env.ci.disabled(), vec![11]);
        let record = env.registry.get_agent_by_name("agent1").unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Building);
        assert_eq!(record.external_agent_id, Some(11));
        assert_eq!(record.timestamps.building, Some(200));
    }

    #[tokio::test]
    async fn already_disabled_agent_is_not_disabled_again() {
        let env = Env::new();
        env.provisioned();
        env.ci.set_agents(vec![busy_agent(11, "agent1", false)]);

        env.reconcile(200).await;
        assert!(env.ci.disabled().is_empty());
    }

    #[tokio::test]
    async fn offline_agent_starts_deprovisioning() {
        let env = Env::new();
        let mut record = env.provisioned();
        record.mark_ready(150).unwrap();
        env.registry.put_agent(&record).unwrap();
        env.ci.set_agents(vec![finished_agent(11, "agent1")]);

        let report = env.reconcile(300).await;

        assert_eq!(report.deprovisioning, 1);
        let record = env.registry.get_agent_by_name("agent1").unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Deprovisioning);
        assert_eq!(record.external_agent_id, Some(11));
        assert_eq!(record.timestamps.deprovisioning, Some(300));
        assert_eq!(record.resources.nic_id.as_deref(), Some("/nics/agent1"));
        assert_eq!(record.resources.public_ip_id.as_deref(), Some("/ips/agent1"));
        assert_eq!(record.resources.disk_id.as_deref(), Some("/disks/agent1-os"));
        assert_eq!(env.compute.vm_deletes(), vec!["/vms/agent1".to_string()]);
    }

    #[tokio::test]
    async fn offline_agent_without_record_is_left_alone() {
        let env = Env::new();
        env.ci.set_agents(vec![finished_agent(11, "someone-elses-agent")]);

        let report = env.reconcile(300).await;

        assert_eq!(report.unknown, 1);
        assert!(env.compute.vm_deletes().is_empty());
        assert!(env.registry.list_agents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deprovisioning_record_is_not_deleted_twice() {
        let env = Env::new();
        env.provisioned();
        env.ci.set_agents(vec![finished_agent(11, "agent1")]);

        env.reconcile(300).await;
        let report = env.reconcile(360).await;

        assert_eq!(report.deprovisioning, 0);
        assert_eq!(env.compute.vm_deletes().len(), 1);
    }

    #[tokio::test]
    async fn offline_agent_whose_vm_is_gone_uses_derived_ids() {
        let env = Env::new();
        let record = env.provisioned();
        env.compute
            .complete_vm_deletion(record.resources.vm_id.as_deref().unwrap());
        env.ci.set_agents(vec![finished_agent(11, "agent1")]);

        env.reconcile(300).await;

        let record = env.registry.get_agent_by_name("agent1").unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Deprovisioning);
        assert_eq!(record.resources.nic_id.as_deref(), Some("/nics/agent1"));
        assert!(record.resources.disk_id.is_none());
        assert!(env.compute.vm_deletes().is_empty());
    }

    #[tokio::test]
    async fn fresh_offline_agent_is_not_deprovisioned() {
        let env = Env::new();
        env.provisioned();
        env.ci.set_agents(vec![pool_agent(
            11,
            "agent1",
            stretch_ci::AgentConnectivity::Offline,
            false,
            false,
        )]);

        env.reconcile(200).await;

        assert_eq!(env.status("agent1"), AgentStatus::Provisioning);
        assert!(env.compute.vm_deletes().is_empty());
    }

    #[tokio::test]
    async fn building_agent_is_disabled_even_without_a_usable_record() {
        let env = Env::new();
        // Swept while still booting, then registered late and took a job.
        let mut record = env.provisioned();
        record
            .mark_deprovisioning(None, AgentResources::default(), 150)
            .unwrap();
        env.registry.put_agent(&record).unwrap();
        env.ci.set_agents(vec![
            busy_agent(11, "agent1", true),
            busy_agent(50, "static-builder", true),
        ]);

        let report = env.reconcile(200).await;

        assert_eq!(env.ci.disabled(), vec![11, 50]);
        assert_eq!(report.disabled, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.unknown, 1);
        assert_eq!(env.status("agent1"), AgentStatus::Deprovisioning);
        assert!(env.registry.get_agent_by_name("static-builder").unwrap().is_none());
    }

    #[tokio::test]
    async fn building_record_reported_ready_is_rejected() {
        let env = Env::new();
        let mut record = env.provisioned();
        record.mark_building(11, 150).unwrap();
        env.registry.put_agent(&record).unwrap();
        env.ci.set_agents(vec![idle_agent(11, "agent1")]);

        let report = env.reconcile(200).await;

        assert_eq!(report.rejected, 1);
        assert_eq!(env.status("agent1"), AgentStatus::Building);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let env = Env::new();
        for _ in 0..3 {
            env.provisioned();
        }
        env.ci.set_agents(vec![
            idle_agent(11, "agent1"),
            busy_agent(12, "agent2", true),
            finished_agent(13, "agent3"),
            finished_agent(14, "stranger"),
        ]);

        env.reconcile(200).await;
        let first = env.registry.list_agents().unwrap();

        let second_report = env.reconcile(260).await;
        let second = env.registry.list_agents().unwrap();

        assert_eq!(first, second);
        assert_eq!(second_report.ready, 0);
        assert_eq!(second_report.building, 0);
        assert_eq!(second_report.deprovisioning, 0);
        // The agent was disabled by the first pass.
        assert_eq!(second_report.disabled, 0);
        assert_eq!(env.ci.disabled(), vec![12]);
        assert_eq!(env.compute.vm_deletes().len(), 1);
    }
}
