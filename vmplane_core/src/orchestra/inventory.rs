use crate::database::{Change, Kind};
use crate::resources::{
    DebugReport, Network, Repository, Snapshot, StoragePool, StorageVolume, Template, Vm,
};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// Error Handling
use vmplane_error::{Reason, VmplaneError};

/**
Every durable entity, in memory.

Mutations go through the `put_*`/`remove_*` methods which journal the
matching record store change. The orchestrator mutates a clone of the
inventory, commits the journal, then swaps the clone in.
*/
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub(super) templates: BTreeMap<String, Template>,
    pub(super) vms: BTreeMap<String, Vm>,
    pub(super) pools: BTreeMap<String, StoragePool>,
    /// By (pool, name)
    pub(super) volumes: BTreeMap<(String, String), StorageVolume>,
    pub(super) networks: BTreeMap<String, Network>,
    /// By (vm uuid, name)
    pub(super) snapshots: BTreeMap<(Uuid, String), Snapshot>,
    pub(super) reports: BTreeMap<String, DebugReport>,
    /// By repo id
    pub(super) repositories: BTreeMap<String, Repository>,

    // Held by running tasks, never persisted.
    busy: BTreeSet<Uuid>,
    reserved: BTreeSet<(Kind, String)>,

    journal: Vec<Change>,
}

fn not_found(reason: Reason, what: &str, name: &str) -> VmplaneError {
    VmplaneError::not_found(reason, &format!("Couldn't find {} {:#?}", what, name))
}

impl Inventory {
    ////////////////////////////////
    // Lookups
    pub fn template(&self, name: &str) -> Result<&Template, VmplaneError> {
        self.templates
            .get(name)
            .ok_or_else(|| not_found(Reason::TemplateNotFound, "template", name))
    }
    pub fn vm(&self, name: &str) -> Result<&Vm, VmplaneError> {
        self.vms
            .get(name)
            .ok_or_else(|| not_found(Reason::VmNotFound, "vm", name))
    }
    pub fn vm_by_uuid(&self, uuid: &Uuid) -> Result<&Vm, VmplaneError> {
        self.vms
            .values()
            .find(|e| &e.uuid == uuid)
            .ok_or_else(|| not_found(Reason::VmNotFound, "vm", &uuid.to_string()))
    }
    pub fn pool(&self, name: &str) -> Result<&StoragePool, VmplaneError> {
        self.pools
            .get(name)
            .ok_or_else(|| not_found(Reason::PoolNotFound, "storage pool", name))
    }
    pub fn volume(&self, pool: &str, name: &str) -> Result<&StorageVolume, VmplaneError> {
        self.volumes
            .get(&(pool.to_owned(), name.to_owned()))
            .ok_or_else(|| {
                not_found(Reason::VolumeNotFound, "storage volume", &format!("{pool}/{name}"))
            })
    }
    pub fn network(&self, name: &str) -> Result<&Network, VmplaneError> {
        self.networks
            .get(name)
            .ok_or_else(|| not_found(Reason::NetworkNotFound, "network", name))
    }
    pub fn snapshot(&self, vm: &Uuid, name: &str) -> Result<&Snapshot, VmplaneError> {
        self.snapshots
            .get(&(*vm, name.to_owned()))
            .ok_or_else(|| not_found(Reason::SnapshotNotFound, "snapshot", name))
    }
    pub fn report(&self, name: &str) -> Result<&DebugReport, VmplaneError> {
        self.reports
            .get(name)
            .ok_or_else(|| not_found(Reason::ReportNotFound, "debug report", name))
    }
    pub fn repository(&self, repo_id: &str) -> Result<&Repository, VmplaneError> {
        self.repositories
            .get(repo_id)
            .ok_or_else(|| not_found(Reason::RepositoryNotFound, "repository", repo_id))
    }

    ////////////////////////////////
    // Referrers
    pub fn templates_using_pool(&self, pool: &str) -> Vec<String> {
        self.templates
            .values()
            .filter(|e| e.uses_pool(pool))
            .map(|e| e.name.clone())
            .collect()
    }
    pub fn templates_using_network(&self, network: &str) -> Vec<String> {
        self.templates
            .values()
            .filter(|e| e.uses_network(network))
            .map(|e| e.name.clone())
            .collect()
    }
    pub fn vms_using_network(&self, network: &str) -> Vec<&Vm> {
        self.vms
            .values()
            .filter(|e| e.ifaces.iter().any(|i| i.network == network))
            .collect()
    }
    pub fn pool_volumes(&self, pool: &str) -> Vec<&StorageVolume> {
        self.volumes.values().filter(|e| e.pool == pool).collect()
    }
    /// Snapshots of a vm, oldest first.
    pub fn vm_snapshots(&self, vm: &Uuid) -> Vec<&Snapshot> {
        let mut res: Vec<&Snapshot> = self.snapshots.values().filter(|e| &e.vm == vm).collect();
        res.sort_by(|a, b| a.seq.cmp(&b.seq).then(a.name.cmp(&b.name)));
        res
    }

    ////////////////////////////////
    // Reservations
    /// Name is used by an entity or held by a running task.
    pub fn is_taken(&self, kind: Kind, name: &str) -> bool {
        let exists = match kind {
            Kind::Template => self.templates.contains_key(name),
            Kind::Vm => self.vms.contains_key(name),
            Kind::StoragePool => self.pools.contains_key(name),
            Kind::Network => self.networks.contains_key(name),
            Kind::DebugReport => self.reports.contains_key(name),
            Kind::Repository => self.repositories.contains_key(name),
            Kind::StorageVolume | Kind::Snapshot => false,
        };
        exists || self.reserved.contains(&(kind, name.to_owned()))
    }
    pub fn reserve(&mut self, kind: Kind, name: &str) {
        self.reserved.insert((kind, name.to_owned()));
    }
    pub fn release(&mut self, kind: Kind, name: &str) {
        self.reserved.remove(&(kind, name.to_owned()));
    }
    pub fn set_busy(&mut self, vm: &Uuid) {
        self.busy.insert(*vm);
    }
    pub fn clear_busy(&mut self, vm: &Uuid) {
        self.busy.remove(vm);
    }
    pub fn is_busy(&self, vm: &Uuid) -> bool {
        self.busy.contains(vm)
    }
    /// Reject operations on a vm a task is working on.
    pub fn check_idle(&self, vm: &Vm) -> Result<(), VmplaneError> {
        if self.is_busy(&vm.uuid) {
            return Err(VmplaneError::conflict(
                Reason::VmBusy,
                &format!("vm {:#?} is busy with a running task", vm.name),
            ));
        }
        Ok(())
    }

    ////////////////////////////////
    // Staged writes
    fn stage<T: Serialize>(&mut self, kind: Kind, key: String, doc: &T) -> Result<(), VmplaneError> {
        let document = serde_json::to_value(doc)?;
        self.journal.push(Change::Put {
            kind,
            key,
            document,
        });
        Ok(())
    }
    fn unstage(&mut self, kind: Kind, key: String) {
        self.journal.push(Change::Delete { kind, key });
    }
    pub fn take_journal(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.journal)
    }

    pub fn put_template(&mut self, template: Template) -> Result<(), VmplaneError> {
        self.stage(Kind::Template, template.name.clone(), &template)?;
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }
    pub fn remove_template(&mut self, name: &str) -> Result<Template, VmplaneError> {
        let template = self.template(name)?.clone();
        self.templates.remove(name);
        self.unstage(Kind::Template, name.to_owned());
        Ok(template)
    }
    /*
     * Vm records are keyed by uuid, a rename replaces the in-memory entry.
     */
    pub fn put_vm(&mut self, vm: Vm) -> Result<(), VmplaneError> {
        self.stage(Kind::Vm, vm.uuid.to_string(), &vm)?;
        self.vms.retain(|_, e| e.uuid != vm.uuid);
        self.vms.insert(vm.name.clone(), vm);
        Ok(())
    }
    pub fn remove_vm(&mut self, name: &str) -> Result<Vm, VmplaneError> {
        let vm = self.vm(name)?.clone();
        self.vms.remove(name);
        self.unstage(Kind::Vm, vm.uuid.to_string());
        Ok(vm)
    }
    pub fn put_pool(&mut self, pool: StoragePool) -> Result<(), VmplaneError> {
        self.stage(Kind::StoragePool, pool.name.clone(), &pool)?;
        self.pools.insert(pool.name.clone(), pool);
        Ok(())
    }
    pub fn remove_pool(&mut self, name: &str) -> Result<StoragePool, VmplaneError> {
        let pool = self.pool(name)?.clone();
        self.pools.remove(name);
        self.unstage(Kind::StoragePool, name.to_owned());
        Ok(pool)
    }
    pub fn put_volume(&mut self, volume: StorageVolume) -> Result<(), VmplaneError> {
        let key = format!("{}/{}", volume.pool, volume.name);
        self.stage(Kind::StorageVolume, key, &volume)?;
        self.volumes
            .insert((volume.pool.clone(), volume.name.clone()), volume);
        Ok(())
    }
    pub fn remove_volume(&mut self, pool: &str, name: &str) -> Result<StorageVolume, VmplaneError> {
        let volume = self.volume(pool, name)?.clone();
        self.volumes.remove(&(pool.to_owned(), name.to_owned()));
        self.unstage(Kind::StorageVolume, format!("{pool}/{name}"));
        Ok(volume)
    }
    pub fn put_network(&mut self, network: Network) -> Result<(), VmplaneError> {
        self.stage(Kind::Network, network.name.clone(), &network)?;
        self.networks.insert(network.name.clone(), network);
        Ok(())
    }
    pub fn remove_network(&mut self, name: &str) -> Result<Network, VmplaneError> {
        let network = self.network(name)?.clone();
        self.networks.remove(name);
        self.unstage(Kind::Network, name.to_owned());
        Ok(network)
    }
    pub fn put_snapshot(&mut self, snapshot: Snapshot) -> Result<(), VmplaneError> {
        self.stage(Kind::Snapshot, snapshot.key(), &snapshot)?;
        self.snapshots
            .insert((snapshot.vm, snapshot.name.clone()), snapshot);
        Ok(())
    }
    pub fn remove_snapshot(&mut self, vm: &Uuid, name: &str) -> Result<Snapshot, VmplaneError> {
        let snapshot = self.snapshot(vm, name)?.clone();
        self.snapshots.remove(&(*vm, name.to_owned()));
        self.unstage(Kind::Snapshot, snapshot.key());
        Ok(snapshot)
    }
    pub fn put_report(&mut self, report: DebugReport) -> Result<(), VmplaneError> {
        self.stage(Kind::DebugReport, report.name.clone(), &report)?;
        self.reports.insert(report.name.clone(), report);
        Ok(())
    }
    pub fn remove_report(&mut self, name: &str) -> Result<DebugReport, VmplaneError> {
        let report = self.report(name)?.clone();
        self.reports.remove(name);
        self.unstage(Kind::DebugReport, name.to_owned());
        Ok(report)
    }
    pub fn put_repository(&mut self, repository: Repository) -> Result<(), VmplaneError> {
        self.stage(Kind::Repository, repository.repo_id.clone(), &repository)?;
        self.repositories
            .insert(repository.repo_id.clone(), repository);
        Ok(())
    }
    pub fn remove_repository(&mut self, repo_id: &str) -> Result<Repository, VmplaneError> {
        let repository = self.repository(repo_id)?.clone();
        self.repositories.remove(repo_id);
        self.unstage(Kind::Repository, repo_id.to_owned());
        Ok(repository)
    }

    ////////////////////////////////
    // Reference counting
    pub fn acquire_volume(&mut self, pool: &str, name: &str) -> Result<StorageVolume, VmplaneError> {
        let mut volume = self.volume(pool, name)?.clone();
        volume.ref_cnt += 1;
        self.put_volume(volume.clone())?;
        Ok(volume)
    }
    /// Returns the remaining reference count.
    pub fn release_volume(&mut self, pool: &str, name: &str) -> Result<u32, VmplaneError> {
        let mut volume = self.volume(pool, name)?.clone();
        volume.ref_cnt = volume.ref_cnt.saturating_sub(1);
        let remaining = volume.ref_cnt;
        self.put_volume(volume)?;
        Ok(remaining)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    // Error Handling
    use miette::Result;

    fn volume(name: &str) -> StorageVolume {
        StorageVolume {
            name: name.to_owned(),
            pool: "default-pool".to_owned(),
            path: format!("/var/lib/vmplane/images/{name}"),
            capacity: 1 << 30,
            allocation: 0,
            format: "qcow2".to_owned(),
            ref_cnt: 0,
            bootable: false,
            base: None,
            os_distro: "unknown".to_owned(),
            os_version: "unknown".to_owned(),
        }
    }

    #[test]
    fn journal_follows_writes() -> Result<()> {
        let mut inventory = Inventory::default();
        inventory.put_volume(volume("a.img"))?;
        inventory.acquire_volume("default-pool", "a.img")?;
        assert_eq!(inventory.volume("default-pool", "a.img")?.ref_cnt, 1);
        assert_eq!(inventory.release_volume("default-pool", "a.img")?, 0);
        assert_eq!(inventory.release_volume("default-pool", "a.img")?, 0);
        inventory.remove_volume("default-pool", "a.img")?;

        let journal = inventory.take_journal();
        assert_eq!(journal.len(), 5);
        assert!(matches!(journal.last(), Some(Change::Delete { kind: Kind::StorageVolume, .. })));
        assert!(inventory.take_journal().is_empty());
        Ok(())
    }

    #[test]
    fn reservations_count_as_taken() -> Result<()> {
        let mut inventory = Inventory::default();
        assert!(!inventory.is_taken(Kind::Vm, "vm-clone-1"));
        inventory.reserve(Kind::Vm, "vm-clone-1");
        assert!(inventory.is_taken(Kind::Vm, "vm-clone-1"));
        inventory.release(Kind::Vm, "vm-clone-1");
        assert!(!inventory.is_taken(Kind::Vm, "vm-clone-1"));
        Ok(())
    }

    #[test]
    fn missing_entities_are_not_found() -> Result<()> {
        let inventory = Inventory::default();
        let err = inventory.vm("nope").unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(err.reason(), Some(Reason::VmNotFound));
        Ok(())
    }
}
