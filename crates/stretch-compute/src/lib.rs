//! stretch-compute — build-agent VM provisioning.
//!
//! The reconciler drives cloud resources through the [`Provisioner`] trait.
//! [`AzureProvisioner`] implements it with Azure Resource Manager REST
//! calls: one public IP, one NIC and one VM per agent, all named after the
//! agent, plus a CustomScript extension that installs and registers the CI
//! agent on first boot.
//!
//! Deletes are requests, not confirmations: ARM deletes VMs asynchronously,
//! and callers poll [`Provisioner::get_vm`] to learn when a VM is gone.

pub mod azure;
pub mod error;
pub mod provisioner;

pub use azure::AzureProvisioner;
pub use error::{ComputeError, ComputeResult};
pub use provisioner::{CreateVmRequest, Provisioner, VmResources, bootstrap_command};
