//! Validated operations on every entity.
//!
//! Synchronous operations validate then apply under the inventory write
//! lock. Slow ones reserve what they will create, hand the work to the task
//! registry and reply with the task handle.

mod claim;
mod clone;
mod filter;
mod host;
mod ifaces;
mod inventory;
mod networks;
mod pools;
mod reports;
mod snapshots;
mod software;
mod storages;
mod templates;
mod validate;
mod vms;
mod volumes;

#[cfg(test)]
pub(crate) mod fixture;

// Reexports
pub use filter::ListFilter;
pub use host::{Directory, HostDirectory, StaticDirectory};
pub use inventory::Inventory;
pub use validate::GraphicsParams;

use crate::config::VmplaneConfig;
use crate::database::{Change, Kind, RecordStore};
use crate::hypervisor::{Hypervisor, VolumeAllocation};
use crate::resources::{
    Connection, DebugReport, Network, NetworkState, PoolSource, PoolState, PoolType, Repository,
    Snapshot, StoragePool, StorageVolume, Template, Vm, VmState,
};
use crate::task::{TaskFilter, TaskInfo, TaskManager};

use bon::bon;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

// Error Handling
use log::{debug, error, info, warn};
use miette::Error;
use vmplane_error::{VmplaneError, WrapError};

/// Outcome of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// 200
    Ok(T),
    /// 201
    Created(T),
    /// 202, the work runs as a task.
    Accepted(TaskInfo),
    /// 204
    NoContent,
    /// 303, the resource now lives at another uri.
    SeeOther(String),
}

impl<T> Reply<T> {
    pub fn status(&self) -> u16 {
        match self {
            Reply::Ok(_) => 200,
            Reply::Created(_) => 201,
            Reply::Accepted(_) => 202,
            Reply::NoContent => 204,
            Reply::SeeOther(_) => 303,
        }
    }
    /// Body of a 200 or 201 reply.
    pub fn into_inner(self) -> Option<T> {
        match self {
            Reply::Ok(e) | Reply::Created(e) => Some(e),
            _ => None,
        }
    }
    pub fn task(&self) -> Option<&TaskInfo> {
        match self {
            Reply::Accepted(task) => Some(task),
            _ => None,
        }
    }
    pub fn location(&self) -> Option<&str> {
        match self {
            Reply::SeeOther(uri) => Some(uri),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    config: VmplaneConfig,
    inventory: RwLock<Inventory>,
    tasks: TaskManager,
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
}

/**
The control plane.
Cheap to clone, every clone drives the same inventory and task registry.
*/
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

#[bon]
impl Orchestrator {
    #[builder]
    pub fn new(
        config: Option<VmplaneConfig>,
        hypervisor: Arc<dyn Hypervisor>,
        store: Arc<dyn RecordStore>,
        directory: Option<Arc<dyn Directory>>,
    ) -> Self {
        let shared = Shared {
            config: config.unwrap_or_default(),
            inventory: RwLock::new(Inventory::default()),
            tasks: TaskManager::new(),
            hypervisor,
            store,
            directory: directory.unwrap_or_else(|| Arc::new(HostDirectory)),
        };
        Self {
            inner: Arc::new(shared),
        }
    }
}

impl Orchestrator {
    pub fn config(&self) -> &VmplaneConfig {
        &self.inner.config
    }
    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }
    pub fn task_lookup(&self, id: u64) -> Result<Reply<TaskInfo>, VmplaneError> {
        Ok(Reply::Ok(self.inner.tasks.lookup(id)?))
    }
    pub fn task_list(&self, filter: &TaskFilter) -> Result<Reply<Vec<TaskInfo>>, VmplaneError> {
        Ok(Reply::Ok(self.inner.tasks.list(filter)?))
    }
    pub fn users(&self) -> Reply<Vec<String>> {
        Reply::Ok(self.inner.directory.users())
    }
    pub fn groups(&self) -> Reply<Vec<String>> {
        Reply::Ok(self.inner.directory.groups())
    }
    /// Abort outstanding tasks.
    pub fn shutdown(&self) {
        self.inner.tasks.shutdown();
    }

    /*
     * Persist the draft journal then swap the draft in.
     * On a store failure the current inventory is kept untouched.
     */
    async fn commit(&self, inventory: &mut Inventory, mut draft: Inventory) -> Result<(), VmplaneError> {
        let journal = draft.take_journal();
        if !journal.is_empty() {
            debug!("committing {} changes", journal.len());
            self.inner.store.commit(journal).await?;
        }
        *inventory = draft;
        Ok(())
    }

    /*
     * Persist the draft journal, then apply its runtime effect.
     * When the effect fails the stored documents are put back and the
     * current inventory is kept untouched.
     */
    async fn commit_then<F>(
        &self,
        inventory: &mut Inventory,
        mut draft: Inventory,
        effect: F,
    ) -> Result<(), VmplaneError>
    where
        F: Future<Output = Result<(), VmplaneError>>,
    {
        let journal = draft.take_journal();
        let undo = self.undo_journal(&journal).await?;
        if !journal.is_empty() {
            debug!("committing {} changes", journal.len());
            self.inner.store.commit(journal).await?;
        }
        if let Err(e) = effect.await {
            if let Err(err) = self.inner.store.commit(undo).await {
                error!("record store out of sync with the hypervisor: {}", err);
            }
            return Err(e);
        }
        *inventory = draft;
        Ok(())
    }

    /// Changes restoring the stored documents a journal overwrites.
    async fn undo_journal(&self, journal: &[Change]) -> Result<Vec<Change>, VmplaneError> {
        let mut undo = vec![];
        for change in journal.iter().rev() {
            let (kind, key) = match change {
                Change::Put { kind, key, .. } => (*kind, key.clone()),
                Change::Delete { kind, key } => (*kind, key.clone()),
            };
            let restore = match self.inner.store.get(kind, &key).await? {
                Some(document) => Change::Put {
                    kind,
                    key,
                    document,
                },
                None => Change::Delete { kind, key },
            };
            undo.push(restore);
        }
        Ok(undo)
    }

    /// Best effort removal of volumes left behind by a failed operation.
    async fn discard_volumes(&self, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.inner.hypervisor.delete_volume(path).await {
                warn!("couldn't remove leftover volume {:#?}: {}", path, e);
            }
        }
    }

    /// Register a volume the hypervisor allocated.
    fn register_volume(
        &self,
        pool: &str,
        allocation: VolumeAllocation,
        ref_cnt: u32,
        origin: Option<&StorageVolume>,
    ) -> StorageVolume {
        StorageVolume {
            name: allocation.name,
            pool: pool.to_owned(),
            path: allocation.path,
            capacity: allocation.capacity,
            allocation: allocation.allocation,
            bootable: allocation.backing.is_some() || allocation.format == "iso",
            format: allocation.format,
            ref_cnt,
            base: allocation.backing,
            os_distro: origin.map_or("unknown".to_owned(), |e| e.os_distro.clone()),
            os_version: origin.map_or("unknown".to_owned(), |e| e.os_version.clone()),
        }
    }

    /*
     * Rebuild the inventory from the record store.
     * Domains the hypervisor does not know anymore are defined again, shut off.
     */
    pub async fn load(&self) -> Result<(), VmplaneError> {
        info!("[start] loading inventory from the record store");
        let store = &self.inner.store;
        let mut inventory = Inventory::default();
        for (_, e) in decode::<Template>(store, Kind::Template).await? {
            inventory.templates.insert(e.name.clone(), e);
        }
        for (_, e) in decode::<StoragePool>(store, Kind::StoragePool).await? {
            inventory.pools.insert(e.name.clone(), e);
        }
        for (_, e) in decode::<StorageVolume>(store, Kind::StorageVolume).await? {
            inventory.volumes.insert((e.pool.clone(), e.name.clone()), e);
        }
        for (_, e) in decode::<Network>(store, Kind::Network).await? {
            inventory.networks.insert(e.name.clone(), e);
        }
        for (_, e) in decode::<Snapshot>(store, Kind::Snapshot).await? {
            inventory.snapshots.insert((e.vm, e.name.clone()), e);
        }
        for (_, e) in decode::<DebugReport>(store, Kind::DebugReport).await? {
            inventory.reports.insert(e.name.clone(), e);
        }
        for (_, e) in decode::<Repository>(store, Kind::Repository).await? {
            inventory.repositories.insert(e.repo_id.clone(), e);
        }
        for (_, mut vm) in decode::<Vm>(store, Kind::Vm).await? {
            match self.inner.hypervisor.state(&vm.uuid).await {
                Ok(state) => vm.state = state.state,
                Err(_) => {
                    debug!("defining missing domain for vm {:#?}", vm.name);
                    vm.state = VmState::Shutoff;
                    self.inner.hypervisor.define(&vm).await?;
                }
            }
            inventory.vms.insert(vm.name.clone(), vm);
        }
        info!(
            "[end] loaded {} templates, {} vms, {} pools, {} volumes, {} networks",
            inventory.templates.len(),
            inventory.vms.len(),
            inventory.pools.len(),
            inventory.volumes.len(),
            inventory.networks.len()
        );
        *self.inner.inventory.write().await = inventory;
        Ok(())
    }

    /*
     * Create and activate the default storage pool and network
     * when they are missing.
     */
    pub async fn ensure_defaults(&self) -> Result<(), VmplaneError> {
        let config = &self.inner.config;
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();

        if !draft.pools.contains_key(&config.storage.default_pool) {
            let mut pool = StoragePool {
                name: config.storage.default_pool.clone(),
                kind: PoolType::Dir,
                path: Some(config.storage.default_pool_path.clone()),
                source: PoolSource::default(),
                capacity: 0,
                allocated: 0,
                state: PoolState::Inactive,
                autostart: true,
            };
            let found = self.inner.hypervisor.pool_activate(&pool).await?;
            pool.state = PoolState::Active;
            for allocation in found {
                let volume = self.register_volume(&pool.name, allocation, 0, None);
                draft.put_volume(volume)?;
            }
            info!("created default storage pool {:#?}", pool.name);
            draft.put_pool(pool)?;
        }
        if !draft.networks.contains_key(&config.network.default_network) {
            let network = Network {
                name: config.network.default_network.clone(),
                connection: Connection::Nat,
                subnet: Some(config.network.default_subnet),
                interface: None,
                state: NetworkState::Active,
                autostart: true,
            };
            self.inner.hypervisor.network_activate(&network).await?;
            info!("created default network {:#?}", network.name);
            draft.put_network(network)?;
        }
        self.commit(&mut inventory, draft).await
    }
}

async fn decode<T: DeserializeOwned>(
    store: &Arc<dyn RecordStore>,
    kind: Kind,
) -> Result<Vec<(String, T)>, VmplaneError> {
    let mut res = vec![];
    for (key, document) in store.list(kind).await? {
        match serde_json::from_value(document) {
            Ok(e) => res.push((key, e)),
            Err(e) => {
                let err = WrapError::builder()
                    .msg(&format!("Couldn't decode stored {kind} {:#?}", key))
                    .help("fix or remove the record from the store")
                    .origin(Error::from_err(e))
                    .build();
                return Err(err.into());
            }
        }
    }
    Ok(res)
}
