use super::claim::Claim;
use super::inventory::Inventory;
use super::pools::refresh_usage;
use super::validate::{check_media_path, check_name, parse_params};
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::hypervisor::{VolumeAllocation, VolumeRequest};
use crate::resources::{StoragePool, StorageVolume};
use crate::task::Reporter;

use human_bytes::human_bytes;
use serde::Deserialize;
use serde_json::Value;

// Error Handling
use log::info;
use vmplane_error::{Reason, VmplaneError};

const FORMATS: [&str; 5] = ["qcow2", "raw", "iso", "vmdk", "vdi"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct VolumeParams {
    name: Option<String>,
    /// Bytes
    capacity: Option<u64>,
    format: Option<String>,
    /// Backing file the volume is derived from.
    base: Option<String>,
}

/// What a volume task fills the new volume with.
#[derive(Debug)]
enum Content {
    Empty(VolumeRequest),
    Upload(Vec<u8>),
}

fn reservation(pool: &str, name: &str) -> String {
    format!("{pool}/{name}")
}

impl Orchestrator {
    /*
     * Reserve a volume name in a pool that can receive new volumes.
     */
    fn reserve_volume(
        &self,
        inventory: &mut Inventory,
        pool: &str,
        name: &str,
    ) -> Result<(StoragePool, Claim), VmplaneError> {
        let pool = inventory.pool(pool)?.clone();
        if !pool.is_active() {
            return Err(VmplaneError::invalid(
                Reason::PoolInactive,
                &format!("storage pool {:#?} is not active", pool.name),
            ));
        }
        if pool.kind.is_lun_based() {
            return Err(VmplaneError::not_allowed(
                Reason::ReadOnlyCollection,
                &format!("volumes of {} pool {:#?} are discovered, not created", pool.kind, pool.name),
            ));
        }
        let key = reservation(&pool.name, name);
        if inventory.volume(&pool.name, name).is_ok() || inventory.is_taken(Kind::StorageVolume, &key) {
            return Err(VmplaneError::conflict(
                Reason::VolumeNameInUse,
                &format!("storage volume {:#?} already exists in pool {:#?}", name, pool.name),
            ));
        }
        let claim = Claim::new(&self.inner).name(inventory, Kind::StorageVolume, &key);
        Ok((pool, claim))
    }

    /// Hand the allocation over to a task, releasing the name if it fails.
    async fn submit_volume(
        &self,
        pool: StoragePool,
        claim: Claim,
        name: String,
        content: Content,
    ) -> Result<Reply<StorageVolume>, VmplaneError> {
        let this = self.clone();
        let uri = format!("/storagepools/{}/storagevolumes/{}", pool.name, name);
        let task = self.inner.tasks.submit(&uri, move |reporter| async move {
            let res = this.volume_run(&reporter, &pool, &name, content).await;
            if res.is_ok() {
                claim.disarm();
            }
            res
        });
        Ok(Reply::Accepted(task))
    }

    async fn volume_run(
        &self,
        reporter: &Reporter,
        pool: &StoragePool,
        name: &str,
        content: Content,
    ) -> Result<(), VmplaneError> {
        info!("[start] allocating volume {:#?} in pool {:#?}", name, pool.name);
        let hypervisor = &self.inner.hypervisor;
        let allocation: VolumeAllocation = match &content {
            Content::Empty(request) => {
                reporter.report(
                    &format!("allocating {}", human_bytes(request.capacity as f64)),
                    false,
                );
                hypervisor.create_volume(pool, request).await?
            }
            Content::Upload(data) => {
                reporter.report(
                    &format!("uploading {}", human_bytes(data.len() as f64)),
                    false,
                );
                hypervisor.upload_volume(pool, name, data).await?
            }
        };
        let path = allocation.path.clone();

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        draft.release(Kind::StorageVolume, &reservation(&pool.name, name));
        let volume = self.register_volume(&pool.name, allocation, 0, None);
        let res = draft
            .put_volume(volume.clone())
            .and_then(|_| refresh_usage(&mut draft, &pool.name));
        let res = match res {
            Ok(()) => self.commit(&mut inventory, draft).await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            drop(inventory);
            self.discard_volumes(&[path]).await;
            return Err(e);
        }
        info!(
            "[end] allocated volume {:#?} ({}) in pool {:#?}",
            volume.name,
            human_bytes(volume.capacity as f64),
            pool.name
        );
        reporter.report(&format!("created {}", volume.uri()), true);
        Ok(())
    }

    /*
     * Allocate an empty volume, optionally backed by an existing image.
     */
    pub async fn volume_create(&self, pool: &str, body: Value) -> Result<Reply<StorageVolume>, VmplaneError> {
        self.check_writable(pool)?;
        let params: VolumeParams = parse_params(body)?;
        let Some(name) = params.name else {
            return Err(VmplaneError::invalid(
                Reason::VolumeNameRequired,
                "a storage volume needs a name",
            ));
        };
        check_name("storage volume", &name)?;
        let capacity = match params.capacity {
            Some(e) if e > 0 => e,
            _ => {
                return Err(VmplaneError::invalid(
                    Reason::VolumeCapacityInvalid,
                    &format!("storage volume {:#?} needs a positive capacity in bytes", name),
                ))
            }
        };
        let format = params.format.unwrap_or("qcow2".to_owned());
        if !FORMATS.contains(&format.as_str()) {
            return Err(VmplaneError::invalid(
                Reason::ParamsInvalid,
                &format!("unknown volume format {:#?}, expected one of {:?}", format, FORMATS),
            ));
        }
        if let Some(base) = &params.base {
            check_media_path(base)?;
        }
        let request = VolumeRequest::builder()
            .name(name.clone())
            .capacity(capacity)
            .format(format)
            .maybe_base(params.base)
            .build();

        let (pool, claim) = {
            let mut inventory = self.inner.inventory.write().await;
            self.reserve_volume(&mut inventory, pool, &name)?
        };
        self.submit_volume(pool, claim, name, Content::Empty(request)).await
    }

    /// Store the request body as a new volume.
    pub async fn volume_upload(
        &self,
        pool: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<Reply<StorageVolume>, VmplaneError> {
        self.check_writable(pool)?;
        let limit = self.inner.config.limits.max_body_size;
        if data.len() as u64 > limit {
            return Err(VmplaneError::too_large(
                &format!(
                    "upload of {} exceeds the {} limit",
                    human_bytes(data.len() as f64),
                    human_bytes(limit as f64)
                ),
                "raise limits.max_body_size or upload a smaller file",
            ));
        }
        check_name("storage volume", name)?;
        let (pool, claim) = {
            let mut inventory = self.inner.inventory.write().await;
            self.reserve_volume(&mut inventory, pool, name)?
        };
        self.submit_volume(pool, claim, name.to_owned(), Content::Upload(data)).await
    }

    pub async fn volume_lookup(&self, pool: &str, name: &str) -> Result<Reply<StorageVolume>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        if self.is_iso_collection(pool) {
            return Self::iso_volumes(&inventory)
                .into_iter()
                .find(|e| e.name == name)
                .map(Reply::Ok)
                .ok_or_else(|| {
                    VmplaneError::not_found(
                        Reason::VolumeNotFound,
                        &format!("no iso volume {:#?}", name),
                    )
                });
        }
        Ok(Reply::Ok(inventory.volume(pool, name)?.clone()))
    }

    pub async fn volume_list(&self, pool: &str) -> Result<Reply<Vec<StorageVolume>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        if self.is_iso_collection(pool) {
            return Ok(Reply::Ok(Self::iso_volumes(&inventory)));
        }
        inventory.pool(pool)?;
        let volumes = inventory.pool_volumes(pool).into_iter().cloned().collect();
        Ok(Reply::Ok(volumes))
    }

    /*
     * Only unreferenced volumes of an active pool can be deleted.
     */
    pub async fn volume_delete(&self, pool: &str, name: &str) -> Result<Reply<StorageVolume>, VmplaneError> {
        self.check_writable(pool)?;
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let storage_pool = draft.pool(pool)?.clone();
        let volume = draft.volume(pool, name)?.clone();
        if volume.ref_cnt > 0 {
            return Err(VmplaneError::conflict(
                Reason::VolumeInUse,
                &format!("storage volume {:#?} is used by {} devices", name, volume.ref_cnt),
            ));
        }
        if !storage_pool.is_active() {
            return Err(VmplaneError::invalid(
                Reason::PoolInactive,
                &format!("storage pool {:#?} is not active", pool),
            ));
        }
        draft.remove_volume(pool, name)?;
        refresh_usage(&mut draft, pool)?;
        let effect = self.inner.hypervisor.delete_volume(&volume.path);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("deleted volume {:#?} from pool {:#?}", name, pool);
        Ok(Reply::NoContent)
    }
}
