use super::validate::{check_name, next_free_name, now, parse_params};
use super::claim::Claim;
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::resources::Snapshot;
use crate::task::Reporter;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

// Error Handling
use log::{info, warn};
use vmplane_error::{Reason, VmplaneError};

/// Alias of the snapshot a vm currently points to.
const CURRENT: &str = "current";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotParams {
    name: Option<String>,
}

fn reservation(vm: &Uuid, name: &str) -> String {
    format!("{vm}/{name}")
}

impl Orchestrator {
    /*
     * Snapshot a vm in a task.
     * The new snapshot's parent is the current one, and it becomes current.
     * Without a name, the unix timestamp is used.
     */
    pub async fn snapshot_create(&self, vm: &str, body: Value) -> Result<Reply<Snapshot>, VmplaneError> {
        let params: SnapshotParams = parse_params(body)?;

        let (claim, uuid, name) = {
            let mut inventory = self.inner.inventory.write().await;
            let owner = inventory.vm(vm)?.clone();
            inventory.check_idle(&owner)?;

            let taken = |name: &str| {
                inventory.snapshot(&owner.uuid, name).is_ok()
                    || inventory.is_taken(Kind::Snapshot, &reservation(&owner.uuid, name))
            };
            let name = match params.name {
                Some(name) => {
                    check_name("snapshot", &name)?;
                    if name == CURRENT {
                        return Err(VmplaneError::invalid(
                            Reason::SnapshotNameReserved,
                            &format!("{:#?} is a reserved snapshot name", CURRENT),
                        ));
                    }
                    if taken(&name) {
                        return Err(VmplaneError::conflict(
                            Reason::SnapshotNameInUse,
                            &format!("vm {:#?} already has a snapshot {:#?}", vm, name),
                        ));
                    }
                    name
                }
                None => {
                    let stamp = now().to_string();
                    if taken(&stamp) {
                        next_free_name(&format!("{stamp}-"), taken)
                    } else {
                        stamp
                    }
                }
            };
            let claim = Claim::new(&self.inner)
                .name(&mut inventory, Kind::Snapshot, &reservation(&owner.uuid, &name))
                .busy(&mut inventory, &owner.uuid);
            (claim, owner.uuid, name)
        };

        let this = self.clone();
        let uri = format!("/vms/{vm}/snapshots/{name}");
        let task = self.inner.tasks.submit(&uri, move |reporter| async move {
            let res = this.snapshot_run(&reporter, &uuid, &name).await;
            if res.is_ok() {
                claim.disarm();
            }
            res
        });
        Ok(Reply::Accepted(task))
    }

    async fn snapshot_run(&self, reporter: &Reporter, uuid: &Uuid, name: &str) -> Result<(), VmplaneError> {
        let captured = self.inner.hypervisor.snapshot_create(uuid, name).await?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut vm = draft.vm_by_uuid(uuid)?.clone();
        let seq = draft.vm_snapshots(uuid).last().map_or(0, |e| e.seq + 1);
        let snapshot = Snapshot {
            name: name.to_owned(),
            vm: *uuid,
            parent: vm.current_snapshot.clone().unwrap_or_default(),
            created: now(),
            seq,
            state: captured.state,
            cpus: captured.cpus,
            memory: captured.memory,
        };
        vm.current_snapshot = Some(name.to_owned());
        draft.put_snapshot(snapshot)?;
        draft.put_vm(vm.clone())?;
        draft.release(Kind::Snapshot, &reservation(uuid, name));
        draft.clear_busy(uuid);
        if let Err(e) = self.commit(&mut inventory, draft).await {
            drop(inventory);
            // Keep the hypervisor in line with the store.
            if let Err(err) = self.inner.hypervisor.snapshot_delete(uuid, name).await {
                warn!("couldn't drop unrecorded snapshot {:#?}: {}", name, err);
            }
            return Err(e);
        }
        info!("created snapshot {:#?} of vm {:#?}", name, vm.name);
        reporter.report(&format!("snapshot {name} of {} created", vm.name), true);
        Ok(())
    }

    /// `current` resolves the vm current snapshot.
    pub async fn snapshot_lookup(&self, vm: &str, name: &str) -> Result<Reply<Snapshot>, VmplaneError> {
        if name == CURRENT {
            return self.snapshot_current(vm).await;
        }
        let inventory = self.inner.inventory.read().await;
        let owner = inventory.vm(vm)?;
        Ok(Reply::Ok(inventory.snapshot(&owner.uuid, name)?.clone()))
    }

    pub async fn snapshot_current(&self, vm: &str) -> Result<Reply<Snapshot>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        let owner = inventory.vm(vm)?;
        match &owner.current_snapshot {
            Some(name) => Ok(Reply::Ok(inventory.snapshot(&owner.uuid, name)?.clone())),
            None => Err(VmplaneError::not_found(
                Reason::SnapshotNotFound,
                &format!("vm {:#?} has no snapshot yet", vm),
            )),
        }
    }

    /// Oldest first.
    pub async fn snapshot_list(&self, vm: &str) -> Result<Reply<Vec<Snapshot>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        let owner = inventory.vm(vm)?;
        let res = inventory
            .vm_snapshots(&owner.uuid)
            .into_iter()
            .cloned()
            .collect();
        Ok(Reply::Ok(res))
    }

    /*
     * Restore the captured state synchronously, the vm reflects it
     * before the call returns.
     */
    pub async fn snapshot_revert(&self, vm: &str, name: &str) -> Result<Reply<Snapshot>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;
        let snapshot = draft.snapshot(&owner.uuid, name)?.clone();

        let uuid = owner.uuid;
        let state = snapshot.captured();
        owner.state = state.state;
        owner.cpus = state.cpus;
        owner.memory = state.memory;
        owner.current_snapshot = Some(snapshot.name.clone());
        draft.put_vm(owner)?;
        let effect = async {
            self.inner
                .hypervisor
                .snapshot_revert(&uuid, &snapshot.name)
                .await?;
            Ok::<(), VmplaneError>(())
        };
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("reverted vm {:#?} to snapshot {:#?}", vm, name);
        Ok(Reply::Ok(snapshot))
    }

    /*
     * Children of the deleted snapshot are re-parented to its parent.
     * When it was current, current moves to its parent, or is unset
     * for a root snapshot.
     */
    pub async fn snapshot_delete(&self, vm: &str, name: &str) -> Result<Reply<Snapshot>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;
        let snapshot = draft.snapshot(&owner.uuid, name)?.clone();

        let uuid = owner.uuid;
        let children: Vec<Snapshot> = draft
            .vm_snapshots(&owner.uuid)
            .into_iter()
            .filter(|e| e.parent == snapshot.name)
            .cloned()
            .collect();
        for mut child in children {
            child.parent = snapshot.parent.clone();
            draft.put_snapshot(child)?;
        }
        if owner.current_snapshot.as_deref() == Some(name) {
            owner.current_snapshot = match snapshot.parent.is_empty() {
                true => None,
                false => Some(snapshot.parent.clone()),
            };
            draft.put_vm(owner)?;
        }
        draft.remove_snapshot(&snapshot.vm, name)?;
        let effect = self.inner.hypervisor.snapshot_delete(&uuid, &snapshot.name);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("deleted snapshot {:#?} of vm {:#?}", name, vm);
        Ok(Reply::NoContent)
    }
}
