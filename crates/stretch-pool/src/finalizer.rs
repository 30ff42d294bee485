//! Deprovisioning finalizer — second phase of agent teardown.
//!
//! VM deletion is asynchronous in the cloud. A `Deprovisioning` record is
//! only finalized once its VM is confirmed gone; until then the NIC, public
//! IP and disk are still attached and cannot be removed. When the VM is gone
//! the dependent resources are deleted, the agent is removed from the CI
//! pool and the record moves to `Done`.

use tracing::{debug, info, warn};

use stretch_ci::AgentPool;
use stretch_compute::{ComputeResult, Provisioner};
use stretch_state::{AgentRecord, AgentStatus};

use crate::error::PoolResult;
use crate::manager::Cycle;

/// Finalize every `Deprovisioning` record whose VM is gone. Returns how many
/// reached `Done`.
pub async fn finalize<C: AgentPool, P: Provisioner>(cx: &Cycle<'_, C, P>) -> PoolResult<usize> {
    let mut finalized = 0;

    for record in cx.registry.list_by_status(&[AgentStatus::Deprovisioning])? {
        let vm_id = record
            .resources
            .vm_id
            .clone()
            .unwrap_or_else(|| cx.compute.vm_resource_id(&record.vm_name));

        if cx.compute.get_vm(&vm_id).await?.is_some() {
            debug!(vm_name = %record.vm_name, "vm deletion still in progress");
            continue;
        }

        finalize_one(cx, record).await?;
        finalized += 1;
    }

    Ok(finalized)
}

async fn finalize_one<C: AgentPool, P: Provisioner>(
    cx: &Cycle<'_, C, P>,
    mut record: AgentRecord,
) -> PoolResult<()> {
    let resources = record.resources.clone();

    if let Some(id) = &resources.nic_id {
        best_effort(&record.vm_name, "nic", id, cx.compute.delete_nic(id).await);
    }
    if let Some(id) = &resources.public_ip_id {
        best_effort(&record.vm_name, "public ip", id, cx.compute.delete_public_ip(id).await);
    }
    if let Some(id) = &resources.disk_id {
        best_effort(&record.vm_name, "disk", id, cx.compute.delete_disk(id).await);
    }

    if let Some(agent_id) = record.external_agent_id {
        cx.ci.delete_agent(agent_id).await?;
    }

    record.mark_done(cx.now)?;
    cx.registry.put_agent(&record)?;
    info!(vm_name = %record.vm_name, "agent deprovisioned");
    Ok(())
}

fn best_effort(vm_name: &str, kind: &str, id: &str, result: ComputeResult<()>) {
    match result {
        Ok(()) => debug!(%vm_name, %kind, %id, "deleted"),
        Err(e) => warn!(%vm_name, %kind, %id, error = %e, "failed to delete resource"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::PoolSettings;
    use crate::test_support::*;
    use stretch_state::{AgentRegistry, AgentResources};

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
                settings: test_settings(1),
            }
        }

        /// A record whose VM deletion was already requested.
        fn deprovisioning(&self, agent_id: Option<u32>) -> AgentRecord {
            let mut record = self.registry.create_agent("agent", 100).unwrap();
            let name = record.vm_name.clone();
            self.compute.add_vm(&name);
            record
                .mark_deprovisioning(
                    agent_id,
                    AgentResources {
                        vm_id: Some(format!("/vms/{name}")),
                        nic_id: Some(format!("/nics/{name}")),
                        public_ip_id: Some(format!("/ips/{name}")),
                        disk_id: Some(format!("/disks/{name}-os")),
                    },
                    200,
                )
                .unwrap();
            self.registry.put_agent(&record).unwrap();
            record
        }

        async fn finalize(&self, now: u64) -> usize {
            let cx = Cycle {
                registry: &self.registry,
                ci: &self.ci,
                compute: &self.compute,
                settings: &self.settings,
                now,
            };
            finalize(&cx).await.unwrap()
        }

        fn record(&self, name: &str) -> AgentRecord {
            self.registry.get_agent_by_name(name).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn waits_while_vm_still_exists() {
        let env = Env::new();
        env.deprovisioning(Some(11));

        assert_eq!(env.finalize(300).await, 0);
        assert_eq!(env.record("agent1").status, AgentStatus::Deprovisioning);
        assert!(env.compute.resource_deletes().is_empty());
        assert!(env.ci.deleted().is_empty());
    }

    #[tokio::test]
    async fn finalizes_once_vm_is_gone() {
        let env = Env::new();
        env.deprovisioning(Some(11));
        env.ci.set_agents(vec![finished_agent(11, "agent1")]);
        env.compute.complete_vm_deletion("/vms/agent1");

        assert_eq!(env.finalize(400).await, 1);

        let record = env.record("agent1");
        assert_eq!(record.status, AgentStatus::Done);
        assert_eq!(record.timestamps.deprovisioned, Some(400));
        assert_eq!(
            env.compute.resource_deletes(),
            vec![
                "/nics/agent1".to_string(),
                "/ips/agent1".to_string(),
                "/disks/agent1-os".to_string(),
            ]
        );
        assert_eq!(env.ci.deleted(), vec![11]);
    }

    #[tokio::test]
    async fn done_records_are_not_revisited() {
        let env = Env::new();
        env.deprovisioning(Some(11));
        env.compute.complete_vm_deletion("/vms/agent1");

        env.finalize(400).await;
        assert_eq!(env.finalize(460).await, 0);
        assert_eq!(env.ci.deleted(), vec![11]);
        assert_eq!(env.record("agent1").timestamps.deprovisioned, Some(400));
    }

    #[tokio::test]
    async fn resource_delete_failure_does_not_block() {
        let env = Env::new();
        env.deprovisioning(Some(11));
        env.compute.complete_vm_deletion("/vms/agent1");
        env.compute.fail_resource_delete("/ips/agent1");

        assert_eq!(env.finalize(400).await, 1);
        assert_eq!(env.record("agent1").status, AgentStatus::Done);
        assert_eq!(
            env.compute.resource_deletes(),
            vec!["/nics/agent1".to_string(), "/disks/agent1-os".to_string()]
        );
    }

    #[tokio::test]
    async fn never_registered_agent_skips_ci_delete() {
        let env = Env::new();
        env.deprovisioning(None);
        env.compute.complete_vm_deletion("/vms/agent1");

        assert_eq!(env.finalize(400).await, 1);
        assert!(env.ci.deleted().is_empty());
        assert_eq!(env.record("agent1").status, AgentStatus::Done);
    }
}
