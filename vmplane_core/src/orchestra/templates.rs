use super::inventory::Inventory;
use super::validate::{
    check_cpus, check_media_path, check_memory, check_name, check_networks_field, media_exists,
    next_free_name, parse_params, uri_name, GraphicsParams,
};
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::resources::{DiskSpec, Graphics, Template, TemplateInfo};

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

// Error Handling
use log::info;
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateParams {
    name: String,
    os_distro: Option<String>,
    os_version: Option<String>,
    icon: Option<String>,
    cpus: Option<u32>,
    memory: Option<u64>,
    cdrom: Option<String>,
    disks: Option<Vec<DiskSpec>>,
    storagepool: Option<String>,
    networks: Option<Vec<String>>,
    graphics: Option<GraphicsParams>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateUpdate {
    name: Option<String>,
    os_distro: Option<String>,
    os_version: Option<String>,
    icon: Option<String>,
    cpus: Option<u32>,
    memory: Option<u64>,
    /// An explicit null removes the cdrom.
    #[serde(default, with = "::serde_with::rust::double_option")]
    cdrom: Option<Option<String>>,
    disks: Option<Vec<DiskSpec>>,
    storagepool: Option<String>,
    networks: Option<Vec<String>>,
    graphics: Option<GraphicsParams>,
}

/// References a stored template holds that do not resolve anymore.
fn broken_references(inventory: &Inventory, template: &Template) -> BTreeMap<String, Vec<String>> {
    let mut invalid: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(cdrom) = &template.cdrom {
        if !media_exists(cdrom) {
            invalid.insert("cdrom".to_owned(), vec![cdrom.clone()]);
        }
    }
    let bases: Vec<String> = template
        .disks
        .iter()
        .filter_map(|e| e.base.clone())
        .filter(|e| !media_exists(e))
        .collect();
    if !bases.is_empty() {
        invalid.insert("disks".to_owned(), bases);
    }
    let networks: Vec<String> = template
        .networks
        .iter()
        .filter(|e| inventory.network(e).is_err())
        .cloned()
        .collect();
    if !networks.is_empty() {
        invalid.insert("networks".to_owned(), networks);
    }
    if inventory.pool(template.pool_name()).is_err() {
        invalid.insert("storagepools".to_owned(), vec![template.storagepool.clone()]);
    }
    invalid
}

fn template_info(inventory: &Inventory, template: &Template) -> TemplateInfo {
    TemplateInfo {
        invalid: broken_references(inventory, template),
        template: template.clone(),
    }
}

fn check_networks(inventory: &Inventory, networks: &[String]) -> Result<(), VmplaneError> {
    for name in networks {
        if inventory.network(name).is_err() {
            return Err(VmplaneError::invalid(
                Reason::NetworkNotFound,
                &format!("network {:#?} does not exist", name),
            ));
        }
    }
    Ok(())
}

/// Normalize a pool reference to its uri, the pool must exist.
fn check_pool(inventory: &Inventory, uri: &str) -> Result<String, VmplaneError> {
    let name = uri_name(uri, "storagepools")?;
    if inventory.pool(name).is_err() {
        return Err(VmplaneError::invalid(
            Reason::PoolNotFound,
            &format!("storage pool {:#?} does not exist", name),
        ));
    }
    Ok(format!("/storagepools/{name}"))
}

/*
 * Disks against the template pool.
 * Lun based pools only hand out existing volumes.
 */
fn check_disk_sources(inventory: &Inventory, template: &Template) -> Result<(), VmplaneError> {
    let pool = inventory.pool(template.pool_name())?;
    for disk in &template.disks {
        if pool.kind.is_lun_based() && disk.volume.is_none() {
            return Err(VmplaneError::invalid(
                Reason::TemplateVolumeRequired,
                &format!(
                    "disk {} must reference a volume of the {} pool {:#?}",
                    disk.index, pool.kind, pool.name
                ),
            ));
        }
        if let Some(volume) = &disk.volume {
            if inventory.volume(&pool.name, volume).is_err() {
                return Err(VmplaneError::invalid(
                    Reason::VolumeNotFound,
                    &format!("pool {:#?} has no volume {:#?}", pool.name, volume),
                ));
            }
        }
        if let Some(base) = &disk.base {
            check_media_path(base)?;
        }
    }
    Ok(())
}

impl Orchestrator {
    fn default_disks(&self) -> Vec<DiskSpec> {
        vec![DiskSpec {
            index: 0,
            size: Some(self.inner.config.vm.disk_size),
            base: None,
            volume: None,
            format: None,
        }]
    }
    fn default_graphics(&self) -> Graphics {
        let vm = &self.inner.config.vm;
        Graphics::new(vm.graphics, vm.listen)
    }
    /// Distro of a known iso volume at that path.
    fn distro_of(inventory: &Inventory, path: &str) -> (String, String) {
        match inventory.volumes.values().find(|e| e.path == path) {
            Some(volume) => (volume.os_distro.clone(), volume.os_version.clone()),
            None => ("unknown".to_owned(), "unknown".to_owned()),
        }
    }

    pub async fn template_create(&self, body: Value) -> Result<Reply<TemplateInfo>, VmplaneError> {
        check_networks_field(&body)?;
        let params: TemplateParams = parse_params(body)?;
        check_name("template", &params.name)?;

        let config = &self.inner.config;
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();

        if draft.is_taken(Kind::Template, &params.name) {
            return Err(VmplaneError::conflict(
                Reason::TemplateNameInUse,
                &format!("template {:#?} already exists", params.name),
            ));
        }
        if let Some(cdrom) = &params.cdrom {
            check_media_path(cdrom)?;
        }
        let storagepool = check_pool(
            &draft,
            &params
                .storagepool
                .unwrap_or_else(|| format!("/storagepools/{}", config.storage.default_pool)),
        )?;
        let networks = params
            .networks
            .unwrap_or_else(|| vec![config.network.default_network.clone()]);
        check_networks(&draft, &networks)?;

        let graphics = match &params.graphics {
            Some(graphics) => graphics.apply(&self.default_graphics())?,
            None => self.default_graphics(),
        };
        let cpus = params.cpus.unwrap_or(config.vm.cpus);
        check_cpus(cpus, config.vm.max_vcpus)?;
        let memory = params.memory.unwrap_or(config.vm.memory);
        check_memory(memory, config.vm.min_memory)?;

        let (os_distro, os_version) = match &params.cdrom {
            Some(cdrom) => Self::distro_of(&draft, cdrom),
            None => ("unknown".to_owned(), "unknown".to_owned()),
        };
        let template = Template {
            name: params.name,
            os_distro: params.os_distro.unwrap_or(os_distro),
            os_version: params.os_version.unwrap_or(os_version),
            icon: params.icon,
            cpus,
            memory,
            cdrom: params.cdrom,
            disks: params.disks.unwrap_or_else(|| self.default_disks()),
            storagepool,
            networks,
            graphics,
        };
        template.check_disks()?;
        template.check_media()?;
        check_disk_sources(&draft, &template)?;

        draft.put_template(template.clone())?;
        self.commit(&mut inventory, draft).await?;
        info!("created template {:#?}", template.name);
        Ok(Reply::Created(template_info(&inventory, &template)))
    }

    pub async fn template_lookup(&self, name: &str) -> Result<Reply<TemplateInfo>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        let template = inventory.template(name)?;
        Ok(Reply::Ok(template_info(&inventory, template)))
    }

    pub async fn template_list(&self) -> Result<Reply<Vec<TemplateInfo>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        let res = inventory
            .templates
            .values()
            .map(|e| template_info(&inventory, e))
            .collect();
        Ok(Reply::Ok(res))
    }

    /*
     * Partial update.
     * References are only checked for the fields the body supplies,
     * a stale cdrom does not block an unrelated change.
     */
    pub async fn template_update(
        &self,
        name: &str,
        body: Value,
    ) -> Result<Reply<TemplateInfo>, VmplaneError> {
        check_networks_field(&body)?;
        let params: TemplateUpdate = parse_params(body)?;

        let config = &self.inner.config;
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut template = draft.template(name)?.clone();

        let renamed = match &params.name {
            Some(new) if new != name => {
                check_name("template", new)?;
                if draft.is_taken(Kind::Template, new) {
                    return Err(VmplaneError::conflict(
                        Reason::TemplateNameInUse,
                        &format!("template {:#?} already exists", new),
                    ));
                }
                template.name = new.clone();
                true
            }
            _ => false,
        };
        match params.cdrom {
            Some(Some(cdrom)) => {
                check_media_path(&cdrom)?;
                template.cdrom = Some(cdrom);
            }
            Some(None) => template.cdrom = None,
            None => {}
        }
        if let Some(networks) = params.networks {
            check_networks(&draft, &networks)?;
            template.networks = networks;
        }
        if let Some(storagepool) = &params.storagepool {
            template.storagepool = check_pool(&draft, storagepool)?;
        }
        if let Some(graphics) = &params.graphics {
            template.graphics = graphics.apply(&template.graphics)?;
        }
        if let Some(cpus) = params.cpus {
            check_cpus(cpus, config.vm.max_vcpus)?;
            template.cpus = cpus;
        }
        if let Some(memory) = params.memory {
            check_memory(memory, config.vm.min_memory)?;
            template.memory = memory;
        }
        let sources_changed = params.disks.is_some() || params.storagepool.is_some();
        if let Some(disks) = params.disks {
            template.disks = disks;
        }
        if let Some(os_distro) = params.os_distro {
            template.os_distro = os_distro;
        }
        if let Some(os_version) = params.os_version {
            template.os_version = os_version;
        }
        if params.icon.is_some() {
            template.icon = params.icon;
        }
        template.check_disks()?;
        template.check_media()?;
        if sources_changed {
            check_disk_sources(&draft, &template)?;
        }

        if renamed {
            draft.remove_template(name)?;
        }
        draft.put_template(template.clone())?;
        self.commit(&mut inventory, draft).await?;

        if renamed {
            info!("renamed template {:#?} to {:#?}", name, template.name);
            Ok(Reply::SeeOther(template.uri()))
        } else {
            Ok(Reply::Ok(template_info(&inventory, &template)))
        }
    }

    /// Copy a template under "<name>-clone<n>".
    pub async fn template_clone(&self, name: &str) -> Result<Reply<TemplateInfo>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut template = draft.template(name)?.clone();
        template.name = next_free_name(&format!("{name}-clone"), |e| {
            draft.is_taken(Kind::Template, e)
        });
        draft.put_template(template.clone())?;
        self.commit(&mut inventory, draft).await?;
        info!("cloned template {:#?} to {:#?}", name, template.name);
        Ok(Reply::SeeOther(template.uri()))
    }

    /// Vms are copies, deleting their template does not touch them.
    pub async fn template_delete(&self, name: &str) -> Result<Reply<TemplateInfo>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        draft.remove_template(name)?;
        self.commit(&mut inventory, draft).await?;
        info!("deleted template {:#?}", name);
        Ok(Reply::NoContent)
    }
}
