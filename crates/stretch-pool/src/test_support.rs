//! In-memory fakes of the CI system and the compute provisioner.
//!
//! `FakeCompute` models asynchronous deletion: `delete_vm` only records the
//! request, and the VM stays visible until `complete_vm_deletion` is called.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use stretch_ci::{AgentConnectivity, AgentPool, CiError, CiResult, JobRequest, PoolAgent};
use stretch_compute::{ComputeError, ComputeResult, CreateVmRequest, Provisioner, VmResources};

use crate::manager::PoolSettings;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Agent builders ────────────────────────────────────────────────

pub fn pool_agent(
    id: u32,
    name: &str,
    status: AgentConnectivity,
    assigned: bool,
    completed: bool,
) -> PoolAgent {
    PoolAgent {
        id,
        name: name.to_string(),
        status,
        enabled: true,
        assigned_request: assigned.then(|| serde_json::json!({ "requestId": 1000 + id })),
        last_completed_request: completed.then(|| serde_json::json!({ "requestId": id })),
    }
}

/// Online, no job yet.
pub fn idle_agent(id: u32, name: &str) -> PoolAgent {
    pool_agent(id, name, AgentConnectivity::Online, false, false)
}

/// Running its first job.
pub fn busy_agent(id: u32, name: &str, enabled: bool) -> PoolAgent {
    let mut agent = pool_agent(id, name, AgentConnectivity::Online, true, false);
    agent.enabled = enabled;
    agent
}

/// Finished its job and went offline.
pub fn finished_agent(id: u32, name: &str) -> PoolAgent {
    pool_agent(id, name, AgentConnectivity::Offline, false, true)
}

pub fn test_settings(min_size: u32) -> PoolSettings {
    PoolSettings {
        min_size,
        vm_prefix: "agent".to_string(),
        ci_url: "https://dev.azure.com/contoso".to_string(),
        ci_token: "pat".to_string(),
        pool_name: "stretch".to_string(),
        provisioning_timeout: Duration::from_secs(1800),
        lease_ttl: Duration::from_secs(300),
        holder: "test-holder".to_string(),
    }
}

// ── CI ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeCi {
    agents: Mutex<Vec<PoolAgent>>,
    jobs: Mutex<Vec<JobRequest>>,
    disabled: Mutex<Vec<u32>>,
    deleted: Mutex<Vec<u32>>,
    fail_listing: Mutex<bool>,
}

impl FakeCi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_agents(&self, agents: Vec<PoolAgent>) {
        *lock(&self.agents) = agents;
    }

    /// Queue `waiting` unreserved and `reserved` reserved job requests.
    pub fn set_queue(&self, waiting: u32, reserved: u32) {
        let mut jobs = Vec::new();
        for i in 0..waiting {
            jobs.push(JobRequest {
                request_id: u64::from(i),
                reserved_agent: None,
            });
        }
        for i in 0..reserved {
            jobs.push(JobRequest {
                request_id: u64::from(waiting + i),
                reserved_agent: Some(serde_json::json!({ "id": i })),
            });
        }
        *lock(&self.jobs) = jobs;
    }

    pub fn fail_listing(&self, fail: bool) {
        *lock(&self.fail_listing) = fail;
    }

    pub fn disabled(&self) -> Vec<u32> {
        lock(&self.disabled).clone()
    }

    pub fn deleted(&self) -> Vec<u32> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl AgentPool for FakeCi {
    async fn list_agents(&self) -> CiResult<Vec<PoolAgent>> {
        if *lock(&self.fail_listing) {
            return Err(CiError::Status {
                method: "GET",
                url: "fake://agents".to_string(),
                status: 503,
            });
        }
        Ok(lock(&self.agents).clone())
    }

    async fn disable_agent(&self, agent_id: u32) -> CiResult<()> {
        lock(&self.disabled).push(agent_id);
        for agent in lock(&self.agents).iter_mut() {
            if agent.id == agent_id {
                agent.enabled = false;
            }
        }
        Ok(())
    }

    async fn delete_agent(&self, agent_id: u32) -> CiResult<()> {
        lock(&self.deleted).push(agent_id);
        lock(&self.agents).retain(|a| a.id != agent_id);
        Ok(())
    }

    async fn list_job_requests(&self) -> CiResult<Vec<JobRequest>> {
        Ok(lock(&self.jobs).clone())
    }
}

// ── Compute ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeCompute {
    vms: Mutex<BTreeMap<String, VmResources>>,
    created: Mutex<Vec<CreateVmRequest>>,
    vm_deletes: Mutex<Vec<String>>,
    resource_deletes: Mutex<Vec<String>>,
    fail_create: Mutex<bool>,
    fail_resource_delete: Mutex<Option<String>>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_resources(&self, vm_name: &str) -> VmResources {
        VmResources {
            vm_id: self.vm_resource_id(vm_name),
            nic_id: Some(format!("/nics/{vm_name}")),
            public_ip_id: Some(format!("/ips/{vm_name}")),
            disk_id: Some(format!("/disks/{vm_name}-os")),
        }
    }

    /// Pretend a VM with this name exists, as if created out of band.
    pub fn add_vm(&self, vm_name: &str) {
        let resources = self.live_resources(vm_name);
        lock(&self.vms).insert(resources.vm_id.clone(), resources);
    }

    /// The cloud finished deleting the VM.
    pub fn complete_vm_deletion(&self, vm_id: &str) {
        lock(&self.vms).remove(vm_id);
    }

    pub fn has_vm(&self, vm_id: &str) -> bool {
        lock(&self.vms).contains_key(vm_id)
    }

    pub fn fail_create(&self, fail: bool) {
        *lock(&self.fail_create) = fail;
    }

    /// Make deletion of the given resource id fail.
    pub fn fail_resource_delete(&self, id: &str) {
        *lock(&self.fail_resource_delete) = Some(id.to_string());
    }

    pub fn created(&self) -> Vec<CreateVmRequest> {
        lock(&self.created).clone()
    }

    pub fn vm_deletes(&self) -> Vec<String> {
        lock(&self.vm_deletes).clone()
    }

    pub fn resource_deletes(&self) -> Vec<String> {
        lock(&self.resource_deletes).clone()
    }

    fn delete_resource(&self, id: &str) -> ComputeResult<()> {
        if lock(&self.fail_resource_delete).as_deref() == Some(id) {
            return Err(ComputeError::Status {
                method: "DELETE",
                url: id.to_string(),
                status: 409,
            });
        }
        lock(&self.resource_deletes).push(id.to_string());
        Ok(())
    }
}

#[async_trait]
impl Provisioner for FakeCompute {
    fn vm_resource_id(&self, vm_name: &str) -> String {
        format!("/vms/{vm_name}")
    }

    fn derived_resources(&self, vm_name: &str) -> VmResources {
        VmResources {
            vm_id: self.vm_resource_id(vm_name),
            nic_id: Some(format!("/nics/{vm_name}")),
            public_ip_id: Some(format!("/ips/{vm_name}")),
            disk_id: None,
        }
    }

    async fn get_vm(&self, vm_id: &str) -> ComputeResult<Option<VmResources>> {
        Ok(lock(&self.vms).get(vm_id).cloned())
    }

    async fn delete_vm(&self, vm_id: &str) -> ComputeResult<()> {
        lock(&self.vm_deletes).push(vm_id.to_string());
        Ok(())
    }

    async fn delete_nic(&self, nic_id: &str) -> ComputeResult<()> {
        self.delete_resource(nic_id)
    }

    async fn delete_public_ip(&self, ip_id: &str) -> ComputeResult<()> {
        self.delete_resource(ip_id)
    }

    async fn delete_disk(&self, disk_id: &str) -> ComputeResult<()> {
        self.delete_resource(disk_id)
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> ComputeResult<()> {
        if *lock(&self.fail_create) {
            return Err(ComputeError::Status {
                method: "PUT",
                url: self.vm_resource_id(&request.vm_name),
                status: 500,
            });
        }
        lock(&self.created).push(request.clone());
        self.add_vm(&request.vm_name);
        Ok(())
    }
}
