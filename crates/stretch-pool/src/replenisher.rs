//! Replenisher — creates new agents.
//!
//! The registry record is written before the create request is issued, so
//! a crash or failure mid-create leaves a `Provisioning` record that the
//! stale sweep eventually reclaims instead of an untracked VM.

use tracing::info;

use stretch_ci::AgentPool;
use stretch_compute::{CreateVmRequest, Provisioner};

use crate::error::PoolResult;
use crate::manager::Cycle;

/// Create `count` agents, returning their VM names.
pub async fn replenish<C: AgentPool, P: Provisioner>(
    cx: &Cycle<'_, C, P>,
    count: u32,
) -> PoolResult<Vec<String>> {
    let mut created = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let mut record = cx.registry.create_agent(&cx.settings.vm_prefix, cx.now)?;
        record.resources.vm_id = Some(cx.compute.vm_resource_id(&record.vm_name));
        cx.registry.put_agent(&record)?;

        info!(vm_name = %record.vm_name, "creating agent");
        let request = CreateVmRequest {
            vm_name: record.vm_name.clone(),
            ci_url: cx.settings.ci_url.clone(),
            ci_token: cx.settings.ci_token.clone(),
            pool_name: cx.settings.pool_name.clone(),
        };
        cx.compute.create_vm(&request).await?;
        created.push(record.vm_name);
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use stretch_state::{AgentRegistry, AgentStatus};

    #[tokio::test]
    async fn creates_records_then_vms() {
        let registry = AgentRegistry::open_in_memory().unwrap();
        let ci = FakeCi::new();
        let compute = FakeCompute::new();
        let settings = test_settings(2);
        let cx = Cycle {
            registry: &registry,
            ci: &ci,
            compute: &compute,
            settings: &settings,
            now: 500,
        };

        let names = replenish(&cx, 2).await.unwrap();
        assert_eq!(names, vec!["agent1".to_string(), "agent2".to_string()]);

        let requests = compute.created();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].vm_name, "agent1");
        assert_eq!(requests[0].pool_name, "stretch");
        assert_eq!(requests[0].ci_token, "pat");

        let record = registry.get_agent_by_name("agent2").unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Provisioning);
        assert_eq!(record.timestamps.created, 500);
        assert_eq!(record.resources.vm_id.as_deref(), Some("/vms/agent2"));
        assert!(compute.has_vm("/vms/agent2"));
    }

    #[tokio::test]
    async fn zero_count_does_nothing() {
        let registry = AgentRegistry::open_in_memory().unwrap();
        let ci = FakeCi::new();
        let compute = FakeCompute::new();
        let settings = test_settings(0);
        let cx = Cycle {
            registry: &registry,
            ci: &ci,
            compute: &compute,
            settings: &settings,
            now: 500,
        };

        assert!(replenish(&cx, 0).await.unwrap().is_empty());
        assert!(registry.list_agents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn names_continue_after_existing_records() {
        let registry = AgentRegistry::open_in_memory().unwrap();
        registry.create_agent("agent", 1).unwrap();
        let ci = FakeCi::new();
        let compute = FakeCompute::new();
        let settings = test_settings(1);
        let cx = Cycle {
            registry: &registry,
            ci: &ci,
            compute: &compute,
            settings: &settings,
            now: 500,
        };

        assert_eq!(replenish(&cx, 1).await.unwrap(), vec!["agent2".to_string()]);
    }
}
