use super::validate::next_free_name;
use super::claim::Claim;
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::rand::unique_mac;
use crate::resources::{StorageVolume, Vm, VmInfo, VmState};
use crate::task::Reporter;

use macaddr::MacAddr6;
use uuid::Uuid;

// Error Handling
use log::{info, warn};
use vmplane_error::{Reason, VmplaneError};

/// A volume the clone is bound to.
enum Binding {
    /// Duplicated for the clone, owned by it.
    Fresh(StorageVolume),
    /// Lun volumes can not be duplicated, the clone shares them.
    Shared { pool: String, name: String },
}

impl Orchestrator {
    /*
     * Clone a shut off vm under "<name>-clone-<n>".
     * The new name is reserved and the source marked busy until the task
     * ends, whatever its outcome.
     */
    pub async fn vm_clone(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        let (claim, source, target) = {
            let mut inventory = self.inner.inventory.write().await;
            let source = inventory.vm(name)?.clone();
            inventory.check_idle(&source)?;
            if source.state != VmState::Shutoff {
                return Err(VmplaneError::invalid(
                    Reason::VmRunning,
                    &format!("can not clone vm {:#?} while {}", name, source.state),
                ));
            }
            let target = next_free_name(&format!("{name}-clone-"), |e| {
                inventory.is_taken(Kind::Vm, e)
            });
            let claim = Claim::new(&self.inner)
                .name(&mut inventory, Kind::Vm, &target)
                .busy(&mut inventory, &source.uuid);
            (claim, source, target)
        };

        let this = self.clone();
        let uri = format!("/vms/{target}");
        let task = self.inner.tasks.submit(&uri, move |reporter| async move {
            let res = this.clone_run(&reporter, &source, &target).await;
            if res.is_ok() {
                claim.disarm();
            }
            res
        });
        Ok(Reply::Accepted(task))
    }

    async fn clone_run(&self, reporter: &Reporter, source: &Vm, target: &str) -> Result<(), VmplaneError> {
        info!("[start] cloning vm {:#?} to {:#?}", source.name, target);
        let mut clone = source.clone();
        clone.name = target.to_owned();
        clone.uuid = Uuid::new_v4();
        clone.current_snapshot = None;

        let mut bindings: Vec<Binding> = vec![];
        let res = self
            .clone_volumes(reporter, source, &mut clone, &mut bindings)
            .await;
        let created: Vec<String> = bindings
            .iter()
            .filter_map(|e| match e {
                Binding::Fresh(volume) => Some(volume.path.clone()),
                Binding::Shared { .. } => None,
            })
            .collect();
        if let Err(e) = res {
            self.discard_volumes(&created).await;
            return Err(e);
        }

        let mut macs: Vec<MacAddr6> = vec![];
        for iface in clone.ifaces.iter_mut() {
            iface.mac = unique_mac(&macs)?;
            macs.push(iface.mac);
        }

        let hypervisor = &self.inner.hypervisor;
        if let Err(e) = hypervisor.define(&clone).await {
            self.discard_volumes(&created).await;
            return Err(e);
        }

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut staged = Ok(());
        for binding in bindings {
            staged = match binding {
                Binding::Fresh(volume) => draft.put_volume(volume),
                Binding::Shared { pool, name } => draft.acquire_volume(&pool, &name).map(|_| ()),
            };
            if staged.is_err() {
                break;
            }
        }
        draft.release(Kind::Vm, target);
        draft.clear_busy(&source.uuid);
        let res = match staged.and_then(|_| draft.put_vm(clone.clone())) {
            Ok(()) => self.commit(&mut inventory, draft).await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            drop(inventory);
            if let Err(err) = hypervisor.undefine(&clone.uuid).await {
                warn!("couldn't undefine vm {:#?}: {}", clone.name, err);
            }
            self.discard_volumes(&created).await;
            return Err(e);
        }
        info!("[end] cloned vm {:#?} to {:#?}", source.name, target);
        reporter.report(&format!("cloned {} to {}", source.name, target), true);
        Ok(())
    }

    /*
     * Duplicate every volume backed device of the source.
     * Bindings are pushed as they are made so a failure can be undone.
     */
    async fn clone_volumes(
        &self,
        reporter: &Reporter,
        source: &Vm,
        clone: &mut Vm,
        bindings: &mut Vec<Binding>,
    ) -> Result<(), VmplaneError> {
        for (index, device) in clone.storages.iter_mut().enumerate() {
            let Some((pool_name, vol_name)) = device.volume() else {
                continue;
            };
            let (pool, volume) = {
                let inventory = self.inner.inventory.read().await;
                (
                    inventory.pool(pool_name)?.clone(),
                    inventory.volume(pool_name, vol_name)?.clone(),
                )
            };
            if pool.kind.is_lun_based() || volume.is_iso() {
                bindings.push(Binding::Shared {
                    pool: pool.name.clone(),
                    name: volume.name.clone(),
                });
                device.owned = false;
                continue;
            }
            reporter.report(
                &format!("cloning volume {} of {}", volume.name, source.name),
                false,
            );
            let name = format!("{}-{}.img", clone.uuid, index);
            let allocation = self
                .inner
                .hypervisor
                .clone_volume(&volume.path, &pool, &name)
                .await?;
            let fresh = self.register_volume(&pool.name, allocation, 1, Some(&volume));
            device.path = fresh.path.clone();
            device.vol = Some(fresh.name.clone());
            device.owned = true;
            bindings.push(Binding::Fresh(fresh));
        }
        Ok(())
    }
}
