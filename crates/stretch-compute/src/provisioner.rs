//! The provisioner seam between the reconciler and the cloud.

use async_trait::async_trait;

use crate::error::ComputeResult;

/// Resource ids of a live VM and what is attached to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmResources {
    pub vm_id: String,
    pub nic_id: Option<String>,
    pub public_ip_id: Option<String>,
    pub disk_id: Option<String>,
}

/// Everything needed to bring up one agent VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVmRequest {
    /// VM name; also the name the agent registers under.
    pub vm_name: String,
    pub ci_url: String,
    pub ci_token: String,
    pub pool_name: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Resource id the VM named `vm_name` has (or will have).
    fn vm_resource_id(&self, vm_name: &str) -> String;

    /// Ids of the NIC and public IP created alongside `vm_name`, which share
    /// its name. The OS disk id is only known once the VM exists.
    fn derived_resources(&self, vm_name: &str) -> VmResources;

    /// Look up a VM; `None` once it no longer exists.
    async fn get_vm(&self, vm_id: &str) -> ComputeResult<Option<VmResources>>;

    /// Request VM deletion. Returns once the request is accepted.
    async fn delete_vm(&self, vm_id: &str) -> ComputeResult<()>;

    async fn delete_nic(&self, nic_id: &str) -> ComputeResult<()>;

    async fn delete_public_ip(&self, ip_id: &str) -> ComputeResult<()>;

    async fn delete_disk(&self, disk_id: &str) -> ComputeResult<()>;

    /// Request creation of the public IP, NIC and VM for one agent.
    async fn create_vm(&self, request: &CreateVmRequest) -> ComputeResult<()>;
}

/// The command the VM runs on first boot: the configured install command
/// followed by the CI url, access token, pool name and agent name.
pub fn bootstrap_command(install_command: &str, request: &CreateVmRequest) -> String {
    format!(
        "{} {} {} {} {}",
        install_command.trim_end(),
        request.ci_url,
        request.ci_token,
        request.pool_name,
        request.vm_name
    )
}
