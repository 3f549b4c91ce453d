//! Runtime effects on machines and storage.
//!
//! The control plane never talks a hypervisor protocol itself: it drives an
//! implementation of [`Hypervisor`]. [`Simulator`] is an in-process one.

mod simulator;

pub use simulator::{Fault, Simulator};

use crate::resources::{DomainState, HostPackage, Iface, Network, StorageDevice, StoragePool, Vm};

use async_trait::async_trait;
use bon::Builder;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Error Handling
use vmplane_error::VmplaneError;

/// Volume allocation parameters.
#[derive(Debug, Clone, Eq, PartialEq, Builder)]
pub struct VolumeRequest {
    #[builder(into)]
    pub name: String,
    /// Capacity in bytes
    pub capacity: u64,
    #[builder(into)]
    pub format: String,
    /// Backing file the new volume is derived from.
    #[builder(into)]
    pub base: Option<String>,
}

/// A volume as it exists on the hypervisor side.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeAllocation {
    pub name: String,
    pub path: String,
    pub capacity: u64,
    pub allocation: u64,
    pub format: String,
    pub backing: Option<String>,
}

/*
* Every call is keyed by the vm identity.
* Failures are returned to the caller, which turns them into task failures
* when running inside a task.
*/
#[async_trait]
pub trait Hypervisor: Send + Sync + fmt::Debug {
    // Domains
    async fn define(&self, vm: &Vm) -> Result<(), VmplaneError>;
    async fn undefine(&self, uuid: &Uuid) -> Result<(), VmplaneError>;
    /// Push name, sizing and graphics changes.
    async fn update(&self, vm: &Vm) -> Result<(), VmplaneError>;
    async fn state(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError>;

    // Lifecycle
    async fn start(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError>;
    async fn stop(&self, uuid: &Uuid, force: bool) -> Result<DomainState, VmplaneError>;
    async fn reboot(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError>;
    async fn suspend(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError>;
    async fn resume(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError>;

    // Snapshots
    async fn snapshot_create(&self, uuid: &Uuid, name: &str) -> Result<DomainState, VmplaneError>;
    async fn snapshot_revert(&self, uuid: &Uuid, name: &str) -> Result<DomainState, VmplaneError>;
    async fn snapshot_delete(&self, uuid: &Uuid, name: &str) -> Result<(), VmplaneError>;

    // Devices
    async fn attach_device(&self, uuid: &Uuid, device: &StorageDevice) -> Result<(), VmplaneError>;
    async fn update_device(&self, uuid: &Uuid, device: &StorageDevice) -> Result<(), VmplaneError>;
    async fn detach_device(&self, uuid: &Uuid, dev: &str) -> Result<(), VmplaneError>;
    async fn list_devices(&self, uuid: &Uuid) -> Result<Vec<StorageDevice>, VmplaneError>;
    async fn attach_iface(&self, uuid: &Uuid, iface: &Iface) -> Result<(), VmplaneError>;
    async fn update_iface(&self, uuid: &Uuid, iface: &Iface) -> Result<(), VmplaneError>;
    async fn detach_iface(&self, uuid: &Uuid, mac: &MacAddr6) -> Result<(), VmplaneError>;

    // Storage
    async fn create_volume(
        &self,
        pool: &StoragePool,
        request: &VolumeRequest,
    ) -> Result<VolumeAllocation, VmplaneError>;
    async fn clone_volume(
        &self,
        source: &str,
        pool: &StoragePool,
        name: &str,
    ) -> Result<VolumeAllocation, VmplaneError>;
    async fn upload_volume(
        &self,
        pool: &StoragePool,
        name: &str,
        data: &[u8],
    ) -> Result<VolumeAllocation, VmplaneError>;
    async fn delete_volume(&self, path: &str) -> Result<(), VmplaneError>;
    /// Returns volumes found on the backing device.
    async fn pool_activate(&self, pool: &StoragePool) -> Result<Vec<VolumeAllocation>, VmplaneError>;
    async fn pool_deactivate(&self, pool: &StoragePool) -> Result<(), VmplaneError>;

    // Networks
    async fn network_activate(&self, network: &Network) -> Result<(), VmplaneError>;
    async fn network_deactivate(&self, network: &Network) -> Result<(), VmplaneError>;

    // Host
    /// Packages with an update pending.
    async fn host_packages(&self) -> Result<Vec<HostPackage>, VmplaneError>;
    async fn update_package(&self, name: &str) -> Result<(), VmplaneError>;
}
