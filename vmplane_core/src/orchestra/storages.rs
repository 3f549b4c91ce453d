use super::validate::{check_media_path, is_remote, parse_params};
use super::{Orchestrator, Reply};
use crate::resources::{DeviceType, StorageDevice};

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

// Error Handling
use log::info;
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageParams {
    #[serde(rename = "type")]
    kind: DeviceType,
    dev: Option<String>,
    path: Option<String>,
    pool: Option<String>,
    vol: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageUpdate {
    path: String,
}

impl StorageParams {
    /*
     * A device is backed by a path or by a pool volume, never both.
     */
    fn check_source(&self) -> Result<(), VmplaneError> {
        let message = match (&self.path, &self.pool, &self.vol) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Some((
                Reason::StorageSourceAmbiguous,
                "a device takes either a path or a pool and a volume",
            )),
            (None, Some(_), None) => Some((
                Reason::StorageVolumeRequired,
                "a pool reference needs a volume",
            )),
            (None, None, Some(_)) => Some((
                Reason::StorageSourceMissing,
                "a volume reference needs a pool",
            )),
            (None, None, None) => Some((
                Reason::StorageSourceMissing,
                "a device needs a path or a pool and a volume",
            )),
            _ => None,
        };
        match message {
            Some((reason, message)) => Err(VmplaneError::invalid(reason, message)),
            None => Ok(()),
        }
    }
}

impl Orchestrator {
    pub async fn storage_attach(&self, vm: &str, body: Value) -> Result<Reply<StorageDevice>, VmplaneError> {
        let params: StorageParams = parse_params(body)?;
        params.check_source()?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;

        let dev = match &params.dev {
            Some(dev) => {
                if owner.storages.iter().any(|e| &e.dev == dev) {
                    return Err(VmplaneError::conflict(
                        Reason::DeviceNameInUse,
                        &format!("vm {:#?} already has a device {:#?}", vm, dev),
                    ));
                }
                dev.clone()
            }
            None => owner.next_dev(params.kind)?,
        };

        let device = match (&params.path, &params.pool, &params.vol) {
            (Some(path), _, _) => {
                match params.kind {
                    DeviceType::Cdrom => check_media_path(path)?,
                    DeviceType::Disk if is_remote(path) || !Path::new(path).exists() => {
                        return Err(VmplaneError::invalid(
                            Reason::StoragePathNotFound,
                            &format!("disk image {:#?} does not exist", path),
                        ))
                    }
                    DeviceType::Disk => {}
                }
                StorageDevice {
                    dev,
                    kind: params.kind,
                    path: path.clone(),
                    pool: None,
                    vol: None,
                    owned: false,
                }
            }
            (None, Some(pool), Some(vol)) => {
                let pool = draft.pool(pool).map_err(|_| {
                    VmplaneError::invalid(
                        Reason::PoolNotFound,
                        &format!("storage pool {:#?} does not exist", pool),
                    )
                })?;
                if !pool.is_active() {
                    return Err(VmplaneError::invalid(
                        Reason::PoolInactive,
                        &format!("storage pool {:#?} is not active", pool.name),
                    ));
                }
                let pool = pool.name.clone();
                let volume = draft.volume(&pool, vol).map_err(|_| {
                    VmplaneError::invalid(
                        Reason::VolumeNotFound,
                        &format!("pool {:#?} has no volume {:#?}", pool, vol),
                    )
                })?;
                if volume.ref_cnt > 0 && !volume.is_iso() {
                    return Err(VmplaneError::conflict(
                        Reason::VolumeInUse,
                        &format!("volume {:#?} is already used by a vm", vol),
                    ));
                }
                let volume = draft.acquire_volume(&pool, vol)?;
                StorageDevice {
                    dev,
                    kind: params.kind,
                    path: volume.path,
                    pool: Some(pool),
                    vol: Some(volume.name),
                    owned: false,
                }
            }
            _ => return Err(VmplaneError::invalid(Reason::StorageSourceMissing, "no device source")),
        };

        let uuid = owner.uuid;
        owner.storages.push(device.clone());
        draft.put_vm(owner)?;
        let effect = self.inner.hypervisor.attach_device(&uuid, &device);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("attached {} {:#?} to vm {:#?}", device.kind, device.dev, vm);
        Ok(Reply::Created(device))
    }

    pub async fn storage_lookup(&self, vm: &str, dev: &str) -> Result<Reply<StorageDevice>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.vm(vm)?.device(dev)?.clone()))
    }

    pub async fn storage_list(&self, vm: &str) -> Result<Reply<Vec<StorageDevice>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.vm(vm)?.storages.clone()))
    }

    /*
     * Only a cdrom can change its path.
     * The new path is checked like on attach.
     */
    pub async fn storage_update(
        &self,
        vm: &str,
        dev: &str,
        body: Value,
    ) -> Result<Reply<StorageDevice>, VmplaneError> {
        let params: StorageUpdate = parse_params(body)?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;
        let mut device = owner.device(dev)?.clone();
        if device.kind != DeviceType::Cdrom {
            return Err(VmplaneError::invalid(
                Reason::DeviceUpdateInvalid,
                &format!("only a cdrom path can be changed, {:#?} is a {}", dev, device.kind),
            ));
        }
        check_media_path(&params.path)?;

        if let Some((pool, vol)) = device.volume() {
            if draft.volume(pool, vol).is_ok() {
                let (pool, vol) = (pool.to_owned(), vol.to_owned());
                draft.release_volume(&pool, &vol)?;
            }
        }
        device.path = params.path;
        device.pool = None;
        device.vol = None;
        device.owned = false;

        let uuid = owner.uuid;
        for e in owner.storages.iter_mut().filter(|e| e.dev == device.dev) {
            *e = device.clone();
        }
        draft.put_vm(owner)?;
        let effect = self.inner.hypervisor.update_device(&uuid, &device);
        self.commit_then(&mut inventory, draft, effect).await?;
        Ok(Reply::Ok(device))
    }

    /// Owned volumes nobody references anymore are deleted.
    pub async fn storage_detach(&self, vm: &str, dev: &str) -> Result<Reply<StorageDevice>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;
        let device = owner.device(dev)?.clone();

        let mut orphans: Vec<String> = vec![];
        if let Some((pool, vol)) = device.volume() {
            if draft.volume(pool, vol).is_ok() && draft.release_volume(pool, vol)? == 0 && device.owned {
                orphans.push(draft.remove_volume(pool, vol)?.path);
            }
        }
        let uuid = owner.uuid;
        owner.storages.retain(|e| e.dev != dev);
        draft.put_vm(owner)?;
        let effect = self.inner.hypervisor.detach_device(&uuid, dev);
        self.commit_then(&mut inventory, draft, effect).await?;
        self.discard_volumes(&orphans).await;
        info!("detached {:#?} from vm {:#?}", dev, vm);
        Ok(Reply::NoContent)
    }
}

#[cfg(test)]
mod test {
    use super::super::fixture::Fixture;
    use super::*;
    use crate::database::{Kind, RecordStore};
    use crate::hypervisor::{Fault, Hypervisor};
    use crate::resources::GIB;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // Error Handling
    use miette::Result;

    fn reason<T: std::fmt::Debug>(res: Result<T, VmplaneError>) -> Option<Reason> {
        res.unwrap_err().reason()
    }

    async fn volume(fx: &Fixture, name: &str) -> Result<(), VmplaneError> {
        let reply = fx
            .orchestrator
            .volume_create("default-pool", json!({ "name": name, "capacity": GIB }))
            .await?;
        fx.wait(reply.task().unwrap()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn reject_bad_sources() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.template("test").await?;
        fx.vm("test", "vm").await?;
        volume(&fx, "data.img").await?;
        let orchestrator = &fx.orchestrator;
        let iso = fx.iso();

        let cases = [
            (json!({ "type": "cdrom", "path": "/tmp/nonexistent.iso" }), Reason::StoragePathNotFound),
            (json!({ "type": "disk", "path": iso, "pool": "default-pool", "vol": "data.img" }), Reason::StorageSourceAmbiguous),
            (json!({ "type": "disk", "pool": "default-pool" }), Reason::StorageVolumeRequired),
            (json!({ "type": "disk", "vol": "data.img" }), Reason::StorageSourceMissing),
            (json!({ "type": "disk" }), Reason::StorageSourceMissing),
            (json!({ "type": "disk", "pool": "nope", "vol": "data.img" }), Reason::PoolNotFound),
            (json!({ "type": "disk", "pool": "default-pool", "vol": "nope" }), Reason::VolumeNotFound),
            (json!({ "type": "floppy", "path": iso }), Reason::ParamsInvalid),
            (json!({ "type": "cdrom", "path": iso, "dev": "hda" }), Reason::DeviceNameInUse),
        ];
        for (body, expected) in cases {
            assert_eq!(reason(orchestrator.storage_attach("vm", body).await), Some(expected));
        }
        let storages = orchestrator.storage_list("vm").await?.into_inner().unwrap();
        assert_eq!(storages.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn attach_update_detach() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.template("test").await?;
        fx.vm("test", "vm").await?;
        volume(&fx, "data.img").await?;
        let orchestrator = &fx.orchestrator;

        let reply = orchestrator
            .storage_attach("vm", json!({ "type": "disk", "pool": "default-pool", "vol": "data.img" }))
            .await?;
        assert_eq!(reply.status(), 201);
        let disk = reply.into_inner().unwrap();
        assert_eq!(disk.dev, "vdb");
        let data = orchestrator.volume_lookup("default-pool", "data.img").await?.into_inner().unwrap();
        assert_eq!(data.ref_cnt, 1);

        let reply = orchestrator
            .storage_attach("vm", json!({ "type": "cdrom", "path": fx.iso() }))
            .await?;
        let cdrom = reply.into_inner().unwrap();
        assert_eq!(cdrom.dev, "hdb");

        let url = "https://example.org/fedora.iso";
        let reply = orchestrator
            .storage_update("vm", &cdrom.dev, json!({ "path": url }))
            .await?;
        assert_eq!(reply.status(), 200);
        assert_eq!(reply.into_inner().map(|e| e.path), Some(url.to_owned()));
        let res = orchestrator
            .storage_update("vm", &cdrom.dev, json!({ "path": "/tmp/nonexistent.iso" }))
            .await;
        assert_eq!(reason(res), Some(Reason::StoragePathNotFound));
        let res = orchestrator
            .storage_update("vm", "vdb", json!({ "path": fx.iso() }))
            .await;
        assert_eq!(reason(res), Some(Reason::DeviceUpdateInvalid));

        assert_eq!(orchestrator.storage_detach("vm", "vdb").await?.status(), 204);
        assert_eq!(orchestrator.storage_detach("vm", &cdrom.dev).await?.status(), 204);
        let data = orchestrator.volume_lookup("default-pool", "data.img").await?.into_inner().unwrap();
        assert_eq!(data.ref_cnt, 0);
        assert!(fx.simulator.volume(&data.path).await.is_some());

        let err = orchestrator.storage_lookup("vm", "vdb").await.unwrap_err();
        assert_eq!(err.status(), 404);
        Ok(())
    }

    #[tokio::test]
    async fn detaching_an_owned_disk_deletes_it() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.template("test").await?;
        fx.vm("test", "vm").await?;
        let disk = fx.orchestrator.storage_lookup("vm", "vda").await?.into_inner().unwrap();
        assert!(disk.owned);
        fx.orchestrator.storage_detach("vm", "vda").await?;
        assert!(fx.simulator.volume(&disk.path).await.is_none());
        let volumes = fx.orchestrator.volume_list("default-pool").await?.into_inner().unwrap();
        assert!(volumes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_commit_leaves_devices_alone() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.template("test").await?;
        let vm = fx.vm("test", "vm").await?;
        volume(&fx, "data.img").await?;
        let orchestrator = &fx.orchestrator;

        fx.store.set_failing(true);
        let res = orchestrator
            .storage_attach("vm", json!({ "type": "disk", "pool": "default-pool", "vol": "data.img" }))
            .await;
        assert!(res.is_err());
        let res = orchestrator
            .storage_update("vm", "hda", json!({ "path": "https://example.org/fedora.iso" }))
            .await;
        assert!(res.is_err());
        assert!(orchestrator.storage_detach("vm", "vda").await.is_err());
        fx.store.set_failing(false);

        let storages = orchestrator.storage_list("vm").await?.into_inner().unwrap();
        assert_eq!(fx.simulator.list_devices(&vm.uuid).await?, storages);
        let cdrom = storages.iter().find(|e| e.dev == "hda").map(|e| e.path.clone());
        assert_eq!(cdrom, Some(fx.iso()));
        let data = orchestrator.volume_lookup("default-pool", "data.img").await?.into_inner().unwrap();
        assert_eq!(data.ref_cnt, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_detach_keeps_the_disk() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.template("test").await?;
        let vm = fx.vm("test", "vm").await?;
        let disk = fx.orchestrator.storage_lookup("vm", "vda").await?.into_inner().unwrap();

        fx.simulator.fail_on(Fault::DetachDevice);
        assert!(fx.orchestrator.storage_detach("vm", "vda").await.is_err());
        fx.simulator.heal(Fault::DetachDevice);

        assert!(fx.simulator.volume(&disk.path).await.is_some());
        assert!(fx.orchestrator.storage_lookup("vm", "vda").await.is_ok());
        let stored = fx.store.get(Kind::Vm, &vm.uuid.to_string()).await?.unwrap();
        assert_eq!(stored["storages"].as_array().map(|e| e.len()), Some(2));
        let volumes = fx.orchestrator.volume_list("default-pool").await?.into_inner().unwrap();
        assert_eq!(volumes.len(), 1);
        Ok(())
    }
}
