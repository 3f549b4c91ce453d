use super::{Hypervisor, VolumeAllocation, VolumeRequest};
use crate::resources::{
    DomainState, HostPackage, Iface, Network, PoolType, StorageDevice, StoragePool, Vm, VmState,
    GIB,
};

use async_trait::async_trait;
use macaddr::MacAddr6;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex as SyncMutex, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::sync::Mutex;
use uuid::Uuid;

// Error Handling
use log::{debug, trace};
use vmplane_error::{LibError, VmplaneError};

/// Simulator operations that can be made to fail or to lag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Fault {
    Define,
    Undefine,
    Update,
    Start,
    Stop,
    Reboot,
    Suspend,
    Resume,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
    AttachDevice,
    UpdateDevice,
    DetachDevice,
    ListDevices,
    AttachIface,
    UpdateIface,
    DetachIface,
    CreateVolume,
    CloneVolume,
    UploadVolume,
    DeleteVolume,
    PoolActivate,
    PoolDeactivate,
    NetworkActivate,
    NetworkDeactivate,
    HostPackages,
    UpdatePackage,
}

#[derive(Debug, Clone)]
struct Domain {
    name: String,
    state: DomainState,
    devices: Vec<StorageDevice>,
    ifaces: Vec<Iface>,
    snapshots: BTreeMap<String, DomainState>,
}

#[derive(Debug, Default)]
struct Machines {
    domains: HashMap<Uuid, Domain>,
    volumes: BTreeMap<String, VolumeAllocation>,
    pools: BTreeSet<String>,
    networks: BTreeSet<String>,
    /// Pending updates by package name.
    packages: BTreeMap<String, HostPackage>,
}

/**
An in-process hypervisor.
Keeps domains and volumes in memory and enforces power state transitions.
*/
#[derive(Debug, Default)]
pub struct Simulator {
    machines: Mutex<Machines>,
    faults: SyncMutex<HashSet<Fault>>,
    panics: SyncMutex<HashSet<Fault>>,
    latencies: SyncMutex<HashMap<Fault, Duration>>,
}

impl Simulator {
    /// A simulator whose host has a few package updates pending.
    pub fn new() -> Self {
        let mut machines = Machines::default();
        for (name, version, repository) in [
            ("qemu-kvm", "8.2.2-1", "updates"),
            ("libvirt-daemon", "10.1.0-1", "updates"),
            ("edk2-ovmf", "20240214-2", "fedora"),
        ] {
            let package = HostPackage {
                package_name: name.to_owned(),
                version: version.to_owned(),
                arch: "x86_64".to_owned(),
                repository: repository.to_owned(),
            };
            machines.packages.insert(name.to_owned(), package);
        }
        Self {
            machines: Mutex::new(machines),
            ..Self::default()
        }
    }
    /// Make every following call of this operation fail.
    pub fn fail_on(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fault);
    }
    pub fn heal(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fault);
        self.panics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fault);
    }
    /// Make every following call of this operation panic.
    pub fn panic_on(&self, fault: Fault) {
        self.panics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fault);
    }
    /// Delay every following call of this operation.
    pub fn set_latency(&self, fault: Fault, latency: Duration) {
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fault, latency);
    }
    pub async fn volume(&self, path: &str) -> Option<VolumeAllocation> {
        self.machines.lock().await.volumes.get(path).cloned()
    }
    pub async fn is_defined(&self, uuid: &Uuid) -> bool {
        self.machines.lock().await.domains.contains_key(uuid)
    }
    pub async fn is_pool_active(&self, name: &str) -> bool {
        self.machines.lock().await.pools.contains(name)
    }
    pub async fn is_network_active(&self, name: &str) -> bool {
        self.machines.lock().await.networks.contains(name)
    }
    async fn enter(&self, op: Fault) -> Result<(), VmplaneError> {
        let latency = self
            .latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&op)
            .copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let panicking = self
            .panics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&op);
        if panicking {
            panic!("simulated {op} panic");
        }
        let failing = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&op);
        if failing {
            return Err(fail(&format!("simulated {op} failure"), "the operation was set to fail"));
        }
        trace!("[simulator] {op}");
        Ok(())
    }
    /*
     * Run a power transition on a domain.
     * The transition closure returns the new state, or None if not allowed.
     */
    async fn transition<F>(&self, op: Fault, uuid: &Uuid, next: F) -> Result<DomainState, VmplaneError>
    where
        F: FnOnce(VmState) -> Option<VmState> + Send,
    {
        self.enter(op).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        match next(domain.state.state) {
            Some(state) => {
                domain.state.state = state;
                debug!("[simulator] domain {:#?} is now {}", domain.name, state);
                Ok(domain.state)
            }
            None => Err(fail(
                &format!("can not {} domain {:#?} while {}", op, domain.name, domain.state.state),
                "check the domain state first",
            )),
        }
    }
}

fn fail(msg: &str, help: &str) -> VmplaneError {
    LibError::builder().msg(msg).help(help).build().into()
}
fn domain_mut<'a>(machines: &'a mut Machines, uuid: &Uuid) -> Result<&'a mut Domain, VmplaneError> {
    machines
        .domains
        .get_mut(uuid)
        .ok_or_else(|| fail(&format!("no domain with uuid {uuid}"), "define the domain first"))
}
fn volume_path(pool: &StoragePool, name: &str) -> String {
    format!("{}/{}", pool.target_dir(), name)
}

#[async_trait]
impl Hypervisor for Simulator {
    async fn define(&self, vm: &Vm) -> Result<(), VmplaneError> {
        self.enter(Fault::Define).await?;
        let mut machines = self.machines.lock().await;
        if machines.domains.contains_key(&vm.uuid) {
            return Err(fail(
                &format!("domain {} is already defined", vm.uuid),
                "undefine it first",
            ));
        }
        let domain = Domain {
            name: vm.name.clone(),
            state: DomainState {
                state: vm.state,
                cpus: vm.cpus,
                memory: vm.memory,
            },
            devices: vm.storages.clone(),
            ifaces: vm.ifaces.clone(),
            snapshots: BTreeMap::new(),
        };
        machines.domains.insert(vm.uuid, domain);
        Ok(())
    }
    async fn undefine(&self, uuid: &Uuid) -> Result<(), VmplaneError> {
        self.enter(Fault::Undefine).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        if domain.state.state.is_active() {
            return Err(fail(
                &format!("domain {:#?} is still active", domain.name),
                "stop the domain first",
            ));
        }
        machines.domains.remove(uuid);
        Ok(())
    }
    async fn update(&self, vm: &Vm) -> Result<(), VmplaneError> {
        self.enter(Fault::Update).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, &vm.uuid)?;
        domain.name = vm.name.clone();
        domain.state.cpus = vm.cpus;
        domain.state.memory = vm.memory;
        Ok(())
    }
    async fn state(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError> {
        let mut machines = self.machines.lock().await;
        Ok(domain_mut(&mut machines, uuid)?.state)
    }

    async fn start(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError> {
        self.transition(Fault::Start, uuid, |e| {
            (!e.is_active()).then_some(VmState::Running)
        })
        .await
    }
    async fn stop(&self, uuid: &Uuid, force: bool) -> Result<DomainState, VmplaneError> {
        trace!("[simulator] stop forced: {force}");
        self.transition(Fault::Stop, uuid, |e| e.is_active().then_some(VmState::Shutoff))
            .await
    }
    async fn reboot(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError> {
        self.transition(Fault::Reboot, uuid, |e| {
            (e == VmState::Running).then_some(VmState::Running)
        })
        .await
    }
    async fn suspend(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError> {
        self.transition(Fault::Suspend, uuid, |e| {
            (e == VmState::Running).then_some(VmState::Paused)
        })
        .await
    }
    async fn resume(&self, uuid: &Uuid) -> Result<DomainState, VmplaneError> {
        self.transition(Fault::Resume, uuid, |e| {
            (e == VmState::Paused).then_some(VmState::Running)
        })
        .await
    }

    async fn snapshot_create(&self, uuid: &Uuid, name: &str) -> Result<DomainState, VmplaneError> {
        self.enter(Fault::SnapshotCreate).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        if domain.snapshots.contains_key(name) {
            return Err(fail(
                &format!("domain {:#?} already has a snapshot {:#?}", domain.name, name),
                "pick another name",
            ));
        }
        let state = domain.state;
        domain.snapshots.insert(name.to_owned(), state);
        Ok(state)
    }
    async fn snapshot_revert(&self, uuid: &Uuid, name: &str) -> Result<DomainState, VmplaneError> {
        self.enter(Fault::SnapshotRevert).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        let state = match domain.snapshots.get(name) {
            Some(state) => *state,
            None => {
                return Err(fail(
                    &format!("domain {:#?} has no snapshot {:#?}", domain.name, name),
                    "",
                ))
            }
        };
        domain.state = state;
        Ok(state)
    }
    async fn snapshot_delete(&self, uuid: &Uuid, name: &str) -> Result<(), VmplaneError> {
        self.enter(Fault::SnapshotDelete).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        match domain.snapshots.remove(name) {
            Some(_) => Ok(()),
            None => Err(fail(
                &format!("domain {:#?} has no snapshot {:#?}", domain.name, name),
                "",
            )),
        }
    }

    async fn attach_device(&self, uuid: &Uuid, device: &StorageDevice) -> Result<(), VmplaneError> {
        self.enter(Fault::AttachDevice).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        if domain.devices.iter().any(|e| e.dev == device.dev) {
            return Err(fail(&format!("device {} is already attached", device.dev), ""));
        }
        domain.devices.push(device.clone());
        Ok(())
    }
    async fn update_device(&self, uuid: &Uuid, device: &StorageDevice) -> Result<(), VmplaneError> {
        self.enter(Fault::UpdateDevice).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        match domain.devices.iter_mut().find(|e| e.dev == device.dev) {
            Some(e) => {
                *e = device.clone();
                Ok(())
            }
            None => Err(fail(&format!("device {} is not attached", device.dev), "")),
        }
    }
    async fn detach_device(&self, uuid: &Uuid, dev: &str) -> Result<(), VmplaneError> {
        self.enter(Fault::DetachDevice).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        let before = domain.devices.len();
        domain.devices.retain(|e| e.dev != dev);
        if domain.devices.len() == before {
            return Err(fail(&format!("device {dev} is not attached"), ""));
        }
        Ok(())
    }
    async fn list_devices(&self, uuid: &Uuid) -> Result<Vec<StorageDevice>, VmplaneError> {
        self.enter(Fault::ListDevices).await?;
        let mut machines = self.machines.lock().await;
        Ok(domain_mut(&mut machines, uuid)?.devices.clone())
    }
    async fn attach_iface(&self, uuid: &Uuid, iface: &Iface) -> Result<(), VmplaneError> {
        self.enter(Fault::AttachIface).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        if domain.ifaces.iter().any(|e| e.mac == iface.mac) {
            return Err(fail(&format!("interface {} is already attached", iface.mac), ""));
        }
        domain.ifaces.push(iface.clone());
        Ok(())
    }
    async fn update_iface(&self, uuid: &Uuid, iface: &Iface) -> Result<(), VmplaneError> {
        self.enter(Fault::UpdateIface).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        match domain.ifaces.iter_mut().find(|e| e.mac == iface.mac) {
            Some(e) => {
                *e = iface.clone();
                Ok(())
            }
            None => Err(fail(&format!("interface {} is not attached", iface.mac), "")),
        }
    }
    async fn detach_iface(&self, uuid: &Uuid, mac: &MacAddr6) -> Result<(), VmplaneError> {
        self.enter(Fault::DetachIface).await?;
        let mut machines = self.machines.lock().await;
        let domain = domain_mut(&mut machines, uuid)?;
        let before = domain.ifaces.len();
        domain.ifaces.retain(|e| &e.mac != mac);
        if domain.ifaces.len() == before {
            return Err(fail(&format!("interface {mac} is not attached"), ""));
        }
        Ok(())
    }

    async fn create_volume(
        &self,
        pool: &StoragePool,
        request: &VolumeRequest,
    ) -> Result<VolumeAllocation, VmplaneError> {
        self.enter(Fault::CreateVolume).await?;
        let path = volume_path(pool, &request.name);
        let mut machines = self.machines.lock().await;
        if machines.volumes.contains_key(&path) {
            return Err(fail(&format!("volume {path} already exists"), ""));
        }
        let volume = VolumeAllocation {
            name: request.name.clone(),
            path: path.clone(),
            capacity: request.capacity,
            allocation: 0,
            format: request.format.clone(),
            backing: request.base.clone(),
        };
        machines.volumes.insert(path, volume.clone());
        Ok(volume)
    }
    async fn clone_volume(
        &self,
        source: &str,
        pool: &StoragePool,
        name: &str,
    ) -> Result<VolumeAllocation, VmplaneError> {
        self.enter(Fault::CloneVolume).await?;
        let path = volume_path(pool, name);
        let mut machines = self.machines.lock().await;
        let origin = match machines.volumes.get(source) {
            Some(e) => e.clone(),
            None => return Err(fail(&format!("no volume at {source}"), "")),
        };
        if machines.volumes.contains_key(&path) {
            return Err(fail(&format!("volume {path} already exists"), ""));
        }
        let volume = VolumeAllocation {
            name: name.to_owned(),
            path: path.clone(),
            ..origin
        };
        machines.volumes.insert(path, volume.clone());
        Ok(volume)
    }
    async fn upload_volume(
        &self,
        pool: &StoragePool,
        name: &str,
        data: &[u8],
    ) -> Result<VolumeAllocation, VmplaneError> {
        self.enter(Fault::UploadVolume).await?;
        let path = volume_path(pool, name);
        let format = if name.ends_with(".iso") { "iso" } else { "raw" };
        let volume = VolumeAllocation {
            name: name.to_owned(),
            path: path.clone(),
            capacity: data.len() as u64,
            allocation: data.len() as u64,
            format: format.to_owned(),
            backing: None,
        };
        self.machines.lock().await.volumes.insert(path, volume.clone());
        Ok(volume)
    }
    async fn delete_volume(&self, path: &str) -> Result<(), VmplaneError> {
        self.enter(Fault::DeleteVolume).await?;
        match self.machines.lock().await.volumes.remove(path) {
            Some(_) => Ok(()),
            None => Err(fail(&format!("no volume at {path}"), "")),
        }
    }
    async fn pool_activate(&self, pool: &StoragePool) -> Result<Vec<VolumeAllocation>, VmplaneError> {
        self.enter(Fault::PoolActivate).await?;
        let mut machines = self.machines.lock().await;
        machines.pools.insert(pool.name.clone());
        // Lun based pools expose a single fixed unit.
        if pool.kind.is_lun_based() {
            let name = "unit:0:0:1".to_owned();
            let path = volume_path(pool, &name);
            machines
                .volumes
                .entry(path.clone())
                .or_insert_with(|| VolumeAllocation {
                    name,
                    path,
                    capacity: 10 * GIB,
                    allocation: 10 * GIB,
                    format: "raw".to_owned(),
                    backing: None,
                });
        }
        let dir = format!("{}/", pool.target_dir());
        let found = machines
            .volumes
            .values()
            .filter(|e| e.path.starts_with(&dir))
            .cloned()
            .collect();
        Ok(found)
    }
    async fn pool_deactivate(&self, pool: &StoragePool) -> Result<(), VmplaneError> {
        trace!("[simulator] deactivate pool {:#?} ({})", pool.name, pool.kind);
        self.enter(Fault::PoolDeactivate).await?;
        self.machines.lock().await.pools.remove(&pool.name);
        Ok(())
    }
    async fn network_activate(&self, network: &Network) -> Result<(), VmplaneError> {
        trace!("[simulator] activate network {:#?}", network.name);
        self.enter(Fault::NetworkActivate).await?;
        self.machines.lock().await.networks.insert(network.name.clone());
        Ok(())
    }
    async fn network_deactivate(&self, network: &Network) -> Result<(), VmplaneError> {
        trace!("[simulator] deactivate network {:#?}", network.name);
        self.enter(Fault::NetworkDeactivate).await?;
        self.machines.lock().await.networks.remove(&network.name);
        Ok(())
    }
    async fn host_packages(&self) -> Result<Vec<HostPackage>, VmplaneError> {
        self.enter(Fault::HostPackages).await?;
        Ok(self.machines.lock().await.packages.values().cloned().collect())
    }
    async fn update_package(&self, name: &str) -> Result<(), VmplaneError> {
        self.enter(Fault::UpdatePackage).await?;
        match self.machines.lock().await.packages.remove(name) {
            Some(package) => {
                debug!("[simulator] updated {} to {}", name, package.version);
                Ok(())
            }
            None => Err(fail(
                &format!("no pending update for package {:#?}", name),
                "list pending updates first",
            )),
        }
    }
}
