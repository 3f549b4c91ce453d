use super::inventory::Inventory;
use super::validate::{
    check_cpus, check_media_path, check_memory, check_name, next_free_name, parse_params,
    uri_name, GraphicsParams,
};
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::hypervisor::VolumeRequest;
use crate::rand::unique_mac;
use crate::resources::{
    DeviceType, Iface, IfaceType, StorageDevice, StoragePool, Template, Vm, VmInfo, VmState, GIB,
};

use chrono::{Duration, Utc};
use macaddr::MacAddr6;
use serde::Deserialize;
use serde_json::Value;
use strum::Display;
use uuid::Uuid;

// Error Handling
use log::{info, warn};
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct VmParams {
    name: Option<String>,
    /// Template uri
    template: String,
    /// Pool uri overriding the template one.
    storagepool: Option<String>,
    graphics: Option<GraphicsParams>,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VmUpdate {
    name: Option<String>,
    cpus: Option<u32>,
    memory: Option<u64>,
    graphics: Option<GraphicsUpdate>,
    users: Option<Vec<String>>,
    groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GraphicsUpdate {
    passwd: Option<String>,
    /// Seconds from now
    #[serde(rename = "passwdValidTo")]
    passwd_valid_to: Option<i64>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "lowercase")]
enum Power {
    Start,
    Poweroff,
    Shutdown,
    Reboot,
    Suspend,
    Resume,
}
impl Power {
    fn allowed(&self, state: VmState) -> bool {
        match self {
            Power::Start => !state.is_active(),
            Power::Poweroff => state.is_active(),
            Power::Shutdown | Power::Reboot | Power::Suspend => state == VmState::Running,
            Power::Resume => state == VmState::Paused,
        }
    }
    /// State the domain is left in.
    fn target(&self) -> VmState {
        match self {
            Power::Start | Power::Reboot | Power::Resume => VmState::Running,
            Power::Poweroff | Power::Shutdown => VmState::Shutoff,
            Power::Suspend => VmState::Paused,
        }
    }
}

/// Resolve a referenced entity, a miss is a bad request rather than a 404.
fn referenced<T>(res: Result<T, VmplaneError>, reason: Reason, what: &str) -> Result<T, VmplaneError> {
    res.map_err(|_| VmplaneError::invalid(reason, &format!("{what} does not exist")))
}

impl Orchestrator {
    fn check_access(&self, users: &[String], groups: &[String]) -> Result<(), VmplaneError> {
        let directory = &self.inner.directory;
        if let Some(user) = users.iter().find(|e| !directory.has_user(e)) {
            return Err(VmplaneError::invalid(
                Reason::UserNotFound,
                &format!("user {:#?} does not exist on the host", user),
            ));
        }
        if let Some(group) = groups.iter().find(|e| !directory.has_group(e)) {
            return Err(VmplaneError::invalid(
                Reason::GroupNotFound,
                &format!("group {:#?} does not exist on the host", group),
            ));
        }
        Ok(())
    }

    /*
     * Back every template disk with a volume of the pool.
     * Fresh volumes are owned by the vm, existing ones are shared.
     * Paths of allocated volumes are pushed to `created`.
     */
    async fn provision_disks(
        &self,
        draft: &mut Inventory,
        pool: &StoragePool,
        template: &Template,
        vm: &mut Vm,
        created: &mut Vec<String>,
    ) -> Result<(), VmplaneError> {
        let mut disks = template.disks.clone();
        disks.sort_by_key(|e| e.index);
        for disk in disks {
            let dev = vm.next_dev(DeviceType::Disk)?;
            let (volume, owned) = match &disk.volume {
                Some(name) => {
                    let volume = referenced(
                        draft.volume(&pool.name, name),
                        Reason::VolumeNotFound,
                        &format!("volume {}/{}", pool.name, name),
                    )?;
                    if volume.ref_cnt > 0 && !volume.is_iso() {
                        return Err(VmplaneError::conflict(
                            Reason::VolumeInUse,
                            &format!("volume {:#?} is already used by another vm", name),
                        ));
                    }
                    (draft.acquire_volume(&pool.name, name)?, false)
                }
                None => {
                    let size = disk.size.unwrap_or(self.inner.config.vm.disk_size);
                    let request = VolumeRequest::builder()
                        .name(format!("{}-{}.img", vm.uuid, disk.index))
                        .capacity(size * GIB)
                        .format(disk.format.as_deref().unwrap_or("qcow2"))
                        .maybe_base(disk.base.clone())
                        .build();
                    let allocation = self.inner.hypervisor.create_volume(pool, &request).await?;
                    created.push(allocation.path.clone());
                    let origin = draft
                        .volumes
                        .values()
                        .find(|e| Some(&e.path) == disk.base.as_ref())
                        .cloned();
                    let volume = self.register_volume(&pool.name, allocation, 1, origin.as_ref());
                    draft.put_volume(volume.clone())?;
                    (volume, true)
                }
            };
            vm.storages.push(StorageDevice {
                dev,
                kind: DeviceType::Disk,
                path: volume.path.clone(),
                pool: Some(pool.name.clone()),
                vol: Some(volume.name.clone()),
                owned,
            });
        }
        Ok(())
    }

    /*
     * Instantiate a template.
     * The vm copies every template field it needs, later template edits
     * do not reach it.
     */
    pub async fn vm_create(&self, body: Value) -> Result<Reply<VmInfo>, VmplaneError> {
        let params: VmParams = parse_params(body)?;
        let config = &self.inner.config;
        let hypervisor = &self.inner.hypervisor;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();

        let template_name = uri_name(&params.template, "templates")?;
        let template = referenced(
            draft.template(template_name),
            Reason::VmTemplateMissing,
            &format!("template {:#?}", template_name),
        )?
        .clone();

        let name = match params.name {
            Some(name) => {
                check_name("vm", &name)?;
                if draft.is_taken(Kind::Vm, &name) {
                    return Err(VmplaneError::conflict(
                        Reason::VmNameInUse,
                        &format!("vm {:#?} already exists", name),
                    ));
                }
                name
            }
            None => next_free_name(&format!("{}-vm-", template.name), |e| {
                draft.is_taken(Kind::Vm, e)
            }),
        };

        let pool_uri = params
            .storagepool
            .unwrap_or_else(|| template.storagepool.clone());
        let pool_name = uri_name(&pool_uri, "storagepools")?;
        let pool = referenced(
            draft.pool(pool_name),
            Reason::PoolNotFound,
            &format!("storage pool {:#?}", pool_name),
        )?
        .clone();
        if !pool.is_active() {
            return Err(VmplaneError::invalid(
                Reason::PoolInactive,
                &format!("storage pool {:#?} is not active", pool.name),
            ));
        }
        if pool.kind.is_lun_based() && template.disks.iter().any(|e| e.volume.is_none()) {
            return Err(VmplaneError::invalid(
                Reason::TemplateVolumeRequired,
                &format!("disks on the {} pool {:#?} must reference volumes", pool.kind, pool.name),
            ));
        }
        if let Some(cdrom) = &template.cdrom {
            check_media_path(cdrom)?;
        }
        for network in &template.networks {
            referenced(
                draft.network(network),
                Reason::NetworkNotFound,
                &format!("network {:#?}", network),
            )?;
        }
        self.check_access(&params.users, &params.groups)?;
        let graphics = match &params.graphics {
            Some(graphics) => graphics.apply(&template.graphics)?,
            None => template.graphics.clone(),
        };

        let mut vm = Vm {
            name,
            uuid: Uuid::new_v4(),
            template: template.name.clone(),
            state: VmState::Shutoff,
            cpus: template.cpus,
            memory: template.memory,
            graphics,
            users: params.users,
            groups: params.groups,
            icon: template.icon.clone(),
            os_distro: template.os_distro.clone(),
            os_version: template.os_version.clone(),
            storages: vec![],
            ifaces: vec![],
            current_snapshot: None,
        };
        if let Some(cdrom) = &template.cdrom {
            vm.storages.push(StorageDevice {
                dev: vm.next_dev(DeviceType::Cdrom)?,
                kind: DeviceType::Cdrom,
                path: cdrom.clone(),
                pool: None,
                vol: None,
                owned: false,
            });
        }
        for network in &template.networks {
            let taken: Vec<MacAddr6> = vm.ifaces.iter().map(|e| e.mac).collect();
            vm.ifaces.push(Iface {
                mac: unique_mac(&taken)?,
                kind: IfaceType::Network,
                network: network.clone(),
                model: config.network.iface_model.clone(),
            });
        }

        info!("[start] creating vm {:#?} from template {:#?}", vm.name, template.name);
        let mut created: Vec<String> = vec![];
        let staged = self
            .provision_disks(&mut draft, &pool, &template, &mut vm, &mut created)
            .await
            .and_then(|_| draft.put_vm(vm.clone()));
        if let Err(e) = staged {
            self.discard_volumes(&created).await;
            return Err(e);
        }
        if let Err(e) = hypervisor.define(&vm).await {
            self.discard_volumes(&created).await;
            return Err(e);
        }
        if let Err(e) = self.commit(&mut inventory, draft).await {
            if let Err(err) = hypervisor.undefine(&vm.uuid).await {
                warn!("couldn't undefine vm {:#?}: {}", vm.name, err);
            }
            self.discard_volumes(&created).await;
            return Err(e);
        }
        info!("[end] created vm {:#?} ({})", vm.name, vm.uuid);
        Ok(Reply::Created(vm.info()))
    }

    pub async fn vm_lookup(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.vm(name)?.info()))
    }

    pub async fn vm_list(&self) -> Result<Reply<Vec<VmInfo>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.vms.values().map(|e| e.info()).collect()))
    }

    /*
     * Partial update, all supplied fields are validated before any is
     * applied. A rename answers with the new location.
     */
    pub async fn vm_update(&self, name: &str, body: Value) -> Result<Reply<VmInfo>, VmplaneError> {
        let params: VmUpdate = parse_params(body)?;
        let config = &self.inner.config;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let current = draft.vm(name)?.clone();
        draft.check_idle(&current)?;
        let mut vm = current.clone();

        if let Some(new) = &params.name {
            if new != name {
                check_name("vm", new)?;
                if vm.state.is_active() {
                    return Err(VmplaneError::invalid(
                        Reason::VmRunning,
                        &format!("can not rename vm {:#?} while {}", name, vm.state),
                    ));
                }
                if draft.is_taken(Kind::Vm, new) {
                    return Err(VmplaneError::conflict(
                        Reason::VmNameInUse,
                        &format!("vm {:#?} already exists", new),
                    ));
                }
                vm.name = new.clone();
            }
        }
        if let Some(cpus) = params.cpus {
            check_cpus(cpus, config.vm.max_vcpus)?;
            vm.cpus = cpus;
        }
        if let Some(memory) = params.memory {
            check_memory(memory, config.vm.min_memory)?;
            vm.memory = memory;
        }
        if let Some(graphics) = &params.graphics {
            if let Some(passwd) = &graphics.passwd {
                vm.graphics.passwd = Some(passwd.clone());
                vm.graphics.passwd_valid_to = None;
            }
            if let Some(seconds) = graphics.passwd_valid_to {
                let expiry = (seconds > 0)
                    .then(|| Duration::try_seconds(seconds))
                    .flatten()
                    .and_then(|e| Utc::now().checked_add_signed(e));
                match expiry {
                    Some(expiry) => vm.graphics.passwd_valid_to = Some(expiry),
                    None => {
                        return Err(VmplaneError::invalid(
                            Reason::PasswdExpiryInvalid,
                            &format!("passwdValidTo must be a positive number of seconds, got {seconds}"),
                        ))
                    }
                }
            }
        }
        let users = params.users.unwrap_or_else(|| vm.users.clone());
        let groups = params.groups.unwrap_or_else(|| vm.groups.clone());
        self.check_access(&users, &groups)?;
        vm.users = users;
        vm.groups = groups;

        if vm == current {
            return Ok(Reply::Ok(vm.info()));
        }
        self.inner.hypervisor.update(&vm).await?;
        draft.put_vm(vm.clone())?;
        if let Err(e) = self.commit(&mut inventory, draft).await {
            if let Err(err) = self.inner.hypervisor.update(&current).await {
                warn!("couldn't restore vm {:#?} on the hypervisor: {}", name, err);
            }
            return Err(e);
        }

        if vm.name != current.name {
            info!("renamed vm {:#?} to {:#?}", current.name, vm.name);
            Ok(Reply::SeeOther(vm.uri()))
        } else {
            Ok(Reply::Ok(vm.info()))
        }
    }

    async fn vm_power(&self, name: &str, power: Power) -> Result<Reply<VmInfo>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut vm = draft.vm(name)?.clone();
        draft.check_idle(&vm)?;
        if !power.allowed(vm.state) {
            return Err(VmplaneError::invalid(
                Reason::VmStateInvalid,
                &format!("can not {} vm {:#?} while {}", power, name, vm.state),
            ));
        }
        vm.state = power.target();
        draft.put_vm(vm.clone())?;

        let hypervisor = &self.inner.hypervisor;
        let effect = async {
            match power {
                Power::Start => hypervisor.start(&vm.uuid).await?,
                Power::Poweroff => hypervisor.stop(&vm.uuid, true).await?,
                Power::Shutdown => hypervisor.stop(&vm.uuid, false).await?,
                Power::Reboot => hypervisor.reboot(&vm.uuid).await?,
                Power::Suspend => hypervisor.suspend(&vm.uuid).await?,
                Power::Resume => hypervisor.resume(&vm.uuid).await?,
            };
            Ok::<(), VmplaneError>(())
        };
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("{} vm {:#?}: {}", power, name, vm.state);
        Ok(Reply::Ok(vm.info()))
    }
    pub async fn vm_start(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        self.vm_power(name, Power::Start).await
    }
    /// Forced stop
    pub async fn vm_poweroff(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        self.vm_power(name, Power::Poweroff).await
    }
    pub async fn vm_shutdown(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        self.vm_power(name, Power::Shutdown).await
    }
    pub async fn vm_reboot(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        self.vm_power(name, Power::Reboot).await
    }
    pub async fn vm_suspend(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        self.vm_power(name, Power::Suspend).await
    }
    pub async fn vm_resume(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        self.vm_power(name, Power::Resume).await
    }

    /*
     * Stop, undefine, drop references.
     * Owned volumes nobody references anymore are removed from disk
     * once the deletion is committed.
     */
    pub async fn vm_delete(&self, name: &str) -> Result<Reply<VmInfo>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let vm = draft.vm(name)?.clone();
        draft.check_idle(&vm)?;

        info!("[start] deleting vm {:#?}", name);
        let mut orphans: Vec<String> = vec![];
        for device in &vm.storages {
            let Some((pool, vol)) = device.volume() else {
                continue;
            };
            if draft.volume(pool, vol).is_err() {
                warn!("vm {:#?} referenced a missing volume {}/{}", name, pool, vol);
                continue;
            }
            let remaining = draft.release_volume(pool, vol)?;
            if remaining == 0 && device.owned {
                orphans.push(draft.remove_volume(pool, vol)?.path);
            }
        }
        let snapshots: Vec<String> = draft
            .vm_snapshots(&vm.uuid)
            .iter()
            .map(|e| e.name.clone())
            .collect();
        for snapshot in snapshots {
            draft.remove_snapshot(&vm.uuid, &snapshot)?;
        }
        draft.remove_vm(name)?;

        let hypervisor = &self.inner.hypervisor;
        let effect = async {
            if vm.state.is_active() {
                hypervisor.stop(&vm.uuid, true).await?;
            }
            if let Err(e) = hypervisor.undefine(&vm.uuid).await {
                if vm.state.is_active() {
                    if let Err(err) = hypervisor.start(&vm.uuid).await {
                        warn!("couldn't restart vm {:#?}: {}", name, err);
                    }
                }
                return Err(e);
            }
            Ok::<(), VmplaneError>(())
        };
        self.commit_then(&mut inventory, draft, effect).await?;
        self.discard_volumes(&orphans).await;
        info!("[end] deleted vm {:#?} and {} volumes", name, orphans.len());
        Ok(Reply::NoContent)
    }
}
