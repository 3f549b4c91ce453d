use super::inventory::Inventory;
use super::validate::{check_name, parse_params};
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::resources::{PoolSource, PoolState, PoolType, StoragePool, StorageVolume};

use serde::Deserialize;
use serde_json::Value;

// Error Handling
use log::{info, warn};
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolParams {
    name: String,
    #[serde(rename = "type")]
    kind: PoolType,
    path: Option<String>,
    #[serde(default)]
    source: PoolSource,
    #[serde(default)]
    autostart: bool,
}

fn in_use(inventory: &Inventory, pool: &str) -> Vec<String> {
    inventory
        .pool_volumes(pool)
        .into_iter()
        .filter(|e| e.ref_cnt > 0)
        .map(|e| e.name.clone())
        .collect()
}

/// Recompute what a pool has handed out after its volumes changed.
pub(super) fn refresh_usage(draft: &mut Inventory, pool: &str) -> Result<(), VmplaneError> {
    let allocated: u64 = draft.pool_volumes(pool).iter().map(|e| e.allocation).sum();
    let mut pool = draft.pool(pool)?.clone();
    if pool.allocated != allocated {
        pool.allocated = allocated;
        draft.put_pool(pool)?;
    }
    Ok(())
}

impl Orchestrator {
    /// The derived collection can be read, never written.
    pub(super) fn check_writable(&self, pool: &str) -> Result<(), VmplaneError> {
        if pool == self.inner.config.storage.iso_collection {
            return Err(VmplaneError::not_allowed(
                Reason::ReadOnlyCollection,
                &format!("{:#?} is a read-only collection", pool),
            ));
        }
        Ok(())
    }
    pub(super) fn is_iso_collection(&self, pool: &str) -> bool {
        pool == self.inner.config.storage.iso_collection
    }
    /// Iso volumes of every active pool.
    pub(super) fn iso_volumes(inventory: &Inventory) -> Vec<StorageVolume> {
        inventory
            .volumes
            .values()
            .filter(|e| e.is_iso())
            .filter(|e| inventory.pool(&e.pool).map_or(false, |p| p.is_active()))
            .cloned()
            .collect()
    }
    fn iso_pool(&self, inventory: &Inventory) -> StoragePool {
        let volumes = Self::iso_volumes(inventory);
        StoragePool {
            name: self.inner.config.storage.iso_collection.clone(),
            kind: PoolType::Dir,
            path: None,
            source: PoolSource::default(),
            capacity: volumes.iter().map(|e| e.capacity).sum(),
            allocated: volumes.iter().map(|e| e.allocation).sum(),
            state: PoolState::Active,
            autostart: false,
        }
    }

    /// Pools are created inactive.
    pub async fn pool_create(&self, body: Value) -> Result<Reply<StoragePool>, VmplaneError> {
        let params: PoolParams = parse_params(body)?;
        check_name("storage pool", &params.name)?;
        self.check_writable(&params.name)?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        if draft.is_taken(Kind::StoragePool, &params.name) {
            return Err(VmplaneError::conflict(
                Reason::PoolNameInUse,
                &format!("storage pool {:#?} already exists", params.name),
            ));
        }
        let pool = StoragePool {
            name: params.name,
            kind: params.kind,
            path: params.path,
            source: params.source,
            capacity: 0,
            allocated: 0,
            state: PoolState::Inactive,
            autostart: params.autostart,
        };
        pool.check_source()?;
        draft.put_pool(pool.clone())?;
        self.commit(&mut inventory, draft).await?;
        info!("created {} storage pool {:#?}", pool.kind, pool.name);
        Ok(Reply::Created(pool))
    }

    pub async fn pool_lookup(&self, name: &str) -> Result<Reply<StoragePool>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        if self.is_iso_collection(name) {
            return Ok(Reply::Ok(self.iso_pool(&inventory)));
        }
        Ok(Reply::Ok(inventory.pool(name)?.clone()))
    }

    pub async fn pool_list(&self) -> Result<Reply<Vec<StoragePool>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.pools.values().cloned().collect()))
    }

    /*
     * Volumes the hypervisor finds on the backing storage are registered,
     * unreferenced.
     */
    pub async fn pool_activate(&self, name: &str) -> Result<Reply<StoragePool>, VmplaneError> {
        self.check_writable(name)?;
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut pool = draft.pool(name)?.clone();
        if pool.is_active() {
            return Err(VmplaneError::invalid(
                Reason::PoolActive,
                &format!("storage pool {:#?} is already active", name),
            ));
        }
        let found = self.inner.hypervisor.pool_activate(&pool).await?;
        for allocation in found {
            if draft.volume(name, &allocation.name).is_err() {
                let volume = self.register_volume(name, allocation, 0, None);
                draft.put_volume(volume)?;
            }
        }
        let volumes = draft.pool_volumes(name);
        pool.capacity = volumes.iter().map(|e| e.capacity).sum();
        pool.allocated = volumes.iter().map(|e| e.allocation).sum();
        pool.state = PoolState::Active;
        draft.put_pool(pool.clone())?;
        if let Err(e) = self.commit(&mut inventory, draft).await {
            if let Err(err) = self.inner.hypervisor.pool_deactivate(&pool).await {
                warn!("storage pool {:#?} is up but recorded inactive: {}", name, err);
            }
            return Err(e);
        }
        info!("activated storage pool {:#?}", name);
        Ok(Reply::Ok(pool))
    }

    pub async fn pool_deactivate(&self, name: &str) -> Result<Reply<StoragePool>, VmplaneError> {
        self.check_writable(name)?;
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut pool = draft.pool(name)?.clone();
        if !pool.is_active() {
            return Err(VmplaneError::invalid(
                Reason::PoolInactive,
                &format!("storage pool {:#?} is not active", name),
            ));
        }
        let busy = in_use(&draft, name);
        if !busy.is_empty() {
            return Err(VmplaneError::conflict(
                Reason::PoolVolumesInUse,
                &format!("volumes {:?} of pool {:#?} are in use", busy, name),
            ));
        }
        pool.state = PoolState::Inactive;
        draft.put_pool(pool.clone())?;
        let effect = self.inner.hypervisor.pool_deactivate(&pool);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("deactivated storage pool {:#?}", name);
        Ok(Reply::Ok(pool))
    }

    /*
     * Only inactive pools no template references can go.
     * Their volume records go with them, files are left on disk.
     */
    pub async fn pool_delete(&self, name: &str) -> Result<Reply<StoragePool>, VmplaneError> {
        self.check_writable(name)?;
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let pool = draft.pool(name)?.clone();

        let templates = draft.templates_using_pool(name);
        if !templates.is_empty() {
            return Err(VmplaneError::conflict(
                Reason::PoolInUseByTemplate,
                &format!("storage pool {:#?} is used by templates {:?}", name, templates),
            ));
        }
        if pool.is_active() {
            return Err(VmplaneError::conflict(
                Reason::PoolActive,
                &format!("deactivate storage pool {:#?} first", name),
            ));
        }
        let busy = in_use(&draft, name);
        if !busy.is_empty() {
            return Err(VmplaneError::conflict(
                Reason::PoolVolumesInUse,
                &format!("volumes {:?} of pool {:#?} are in use", busy, name),
            ));
        }
        let volumes: Vec<String> = draft
            .pool_volumes(name)
            .into_iter()
            .map(|e| e.name.clone())
            .collect();
        for volume in volumes {
            draft.remove_volume(name, &volume)?;
        }
        draft.remove_pool(name)?;
        self.commit(&mut inventory, draft).await?;
        info!("deleted storage pool {:#?}", name);
        Ok(Reply::NoContent)
    }
}

#[cfg(test)]
mod test {
    use super::super::fixture::Fixture;
    use super::*;
    use crate::hypervisor::Fault;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // Error Handling
    use miette::Result;

    fn reason<T: std::fmt::Debug>(res: Result<T, VmplaneError>) -> Option<Reason> {
        res.unwrap_err().reason()
    }

    #[tokio::test]
    async fn pool_lifecycle() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let body = json!({ "name": "pool", "type": "dir", "path": fx.path("pool") });

        let reply = orchestrator.pool_create(body.clone()).await?;
        assert_eq!(reply.status(), 201);
        assert_eq!(reply.into_inner().map(|e| e.state), Some(PoolState::Inactive));
        assert_eq!(reason(orchestrator.pool_create(body).await), Some(Reason::PoolNameInUse));

        assert_eq!(reason(orchestrator.pool_deactivate("pool").await), Some(Reason::PoolInactive));
        let reply = orchestrator.pool_activate("pool").await?;
        assert_eq!(reply.into_inner().map(|e| e.state), Some(PoolState::Active));
        assert_eq!(reason(orchestrator.pool_activate("pool").await), Some(Reason::PoolActive));
        assert_eq!(reason(orchestrator.pool_delete("pool").await), Some(Reason::PoolActive));

        orchestrator.pool_deactivate("pool").await?;
        assert_eq!(orchestrator.pool_delete("pool").await?.status(), 204);
        assert_eq!(orchestrator.pool_lookup("pool").await.unwrap_err().status(), 404);
        Ok(())
    }

    #[tokio::test]
    async fn reject_bad_pools() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let cases = [
            (json!({ "name": "p", "type": "zfs" }), Reason::ParamsInvalid),
            (json!({ "name": "p", "type": "dir" }), Reason::PoolSourceInvalid),
            (json!({ "name": "p", "type": "netfs", "source": { "host": "nfs.local" } }), Reason::PoolSourceInvalid),
            (json!({ "name": "p", "type": "logical", "source": { "color": "red" } }), Reason::ParamsInvalid),
            (json!({ "name": "", "type": "dir", "path": "/tmp" }), Reason::NameInvalid),
        ];
        for (body, expected) in cases {
            assert_eq!(reason(orchestrator.pool_create(body).await), Some(expected));
        }
        let reply = orchestrator
            .pool_create(json!({
                "name": "nfs",
                "type": "netfs",
                "source": { "host": "nfs.local", "path": "/export/images" }
            }))
            .await?;
        assert_eq!(reply.status(), 201);
        Ok(())
    }

    #[tokio::test]
    async fn referenced_pools_are_kept() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        orchestrator
            .pool_create(json!({ "name": "pool", "type": "dir", "path": fx.path("pool") }))
            .await?;
        orchestrator
            .template_create(json!({
                "name": "test",
                "cdrom": fx.iso(),
                "storagepool": "/storagepools/pool"
            }))
            .await?;

        let err = orchestrator.pool_delete("pool").await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.reason(), Some(Reason::PoolInUseByTemplate));

        orchestrator
            .template_update("test", json!({ "storagepool": "/storagepools/default-pool" }))
            .await?;
        assert_eq!(orchestrator.pool_delete("pool").await?.status(), 204);
        Ok(())
    }

    #[tokio::test]
    async fn volumes_in_use_block_deactivation() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.template("test").await?;
        fx.vm("test", "vm").await?;
        let err = fx.orchestrator.pool_deactivate("default-pool").await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::PoolVolumesInUse));
        fx.orchestrator.vm_delete("vm").await?;
        assert_eq!(fx.orchestrator.pool_deactivate("default-pool").await?.status(), 200);
        Ok(())
    }

    #[tokio::test]
    async fn iso_collection_is_read_only() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let reply = orchestrator
            .volume_upload("default-pool", "fedora.iso", b"fake iso".to_vec())
            .await?;
        fx.wait(reply.task().unwrap()).await?;

        let isos = orchestrator.pool_lookup("isos").await?.into_inner().unwrap();
        assert!(isos.is_active());
        let volumes = orchestrator.volume_list("isos").await?.into_inner().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "fedora.iso");

        let body = json!({ "name": "isos", "type": "dir", "path": "/tmp" });
        assert_eq!(orchestrator.pool_create(body).await.unwrap_err().status(), 405);
        assert_eq!(orchestrator.pool_activate("isos").await.unwrap_err().status(), 405);
        assert_eq!(orchestrator.pool_deactivate("isos").await.unwrap_err().status(), 405);
        assert_eq!(orchestrator.pool_delete("isos").await.unwrap_err().status(), 405);
        let res = orchestrator
            .volume_create("isos", json!({ "name": "a.img", "capacity": 1024 }))
            .await;
        assert_eq!(res.unwrap_err().status(), 405);
        assert_eq!(orchestrator.volume_delete("isos", "fedora.iso").await.unwrap_err().status(), 405);
        Ok(())
    }

    #[tokio::test]
    async fn pool_state_follows_the_store() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        orchestrator
            .pool_create(json!({ "name": "pool", "type": "dir", "path": fx.path("pool") }))
            .await?;

        // Activated then turned back down
        fx.store.set_failing(true);
        assert!(orchestrator.pool_activate("pool").await.is_err());
        fx.store.set_failing(false);
        assert!(!fx.simulator.is_pool_active("pool").await);
        let pool = orchestrator.pool_lookup("pool").await?.into_inner().unwrap();
        assert!(!pool.is_active());

        orchestrator.pool_activate("pool").await?;
        fx.store.set_failing(true);
        assert!(orchestrator.pool_deactivate("pool").await.is_err());
        fx.store.set_failing(false);
        assert!(fx.simulator.is_pool_active("pool").await);

        fx.simulator.fail_on(Fault::PoolDeactivate);
        assert!(orchestrator.pool_deactivate("pool").await.is_err());
        fx.simulator.heal(Fault::PoolDeactivate);
        let pool = orchestrator.pool_lookup("pool").await?.into_inner().unwrap();
        assert!(pool.is_active());

        orchestrator.pool_deactivate("pool").await?;
        assert!(!fx.simulator.is_pool_active("pool").await);
        Ok(())
    }
}
