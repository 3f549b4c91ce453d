use super::Graphics;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Error Handling
use vmplane_error::{Reason, VmplaneError};

/// One disk of a template.
/// Provides a fresh size (GiB), a backing base path, or an existing volume.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl DiskSpec {
    /// Disk content comes from an existing image rather than a blank allocation.
    /// Boots from a backing image.
    pub fn is_image(&self) -> bool {
        self.base.is_some()
    }
    pub fn check(&self) -> Result<(), VmplaneError> {
        let message = if self.volume.is_some() && (self.size.is_some() || self.base.is_some()) {
            Some("a disk referencing a volume can not also set a size or a base")
        } else if self.size.is_none() && self.base.is_none() && self.volume.is_none() {
            Some("a disk needs a size, a base or a volume")
        } else if self.size == Some(0) {
            Some("disk size must be greater than zero")
        } else {
            None
        };
        match message {
            Some(message) => Err(VmplaneError::invalid(
                Reason::TemplateDiskInvalid,
                &format!("disk {}: {}", self.index, message),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub os_distro: String,
    pub os_version: String,
    pub icon: Option<String>,
    pub cpus: u32,
    /// Memory in MiB
    pub memory: u64,
    /// Boot image path or remote url.
    pub cdrom: Option<String>,
    pub disks: Vec<DiskSpec>,
    /// Pool uri, "/storagepools/<name>".
    pub storagepool: String,
    pub networks: Vec<String>,
    pub graphics: Graphics,
}

impl Template {
    pub fn uri(&self) -> String {
        format!("/templates/{}", self.name)
    }
    pub fn pool_name(&self) -> &str {
        self.storagepool
            .strip_prefix("/storagepools/")
            .unwrap_or(&self.storagepool)
    }
    pub fn uses_pool(&self, name: &str) -> bool {
        self.pool_name() == name
    }
    pub fn uses_network(&self, name: &str) -> bool {
        self.networks.iter().any(|e| e == name)
    }
    /*
     * A template boots either from its cdrom or from disk images.
     * Exactly one of them must be present.
     */
    pub fn check_media(&self) -> Result<(), VmplaneError> {
        let from_disks = self.disks.iter().any(|e| e.is_image());
        match (self.cdrom.is_some(), from_disks) {
            (true, false) | (false, true) => Ok(()),
            (false, false) => Err(VmplaneError::invalid(
                Reason::TemplateMediaMissing,
                &format!("template {:#?} has neither a cdrom nor a disk image", self.name),
            )),
            (true, true) => Err(VmplaneError::invalid(
                Reason::TemplateMediaAmbiguous,
                &format!(
                    "template {:#?} has both a cdrom and a disk image",
                    self.name
                ),
            )),
        }
    }
    pub fn check_disks(&self) -> Result<(), VmplaneError> {
        let mut indexes = vec![];
        for disk in &self.disks {
            disk.check()?;
            if indexes.contains(&disk.index) {
                return Err(VmplaneError::invalid(
                    Reason::TemplateDiskInvalid,
                    &format!("disk index {} is used twice", disk.index),
                ));
            }
            indexes.push(disk.index);
        }
        Ok(())
    }
}

/// Template as shown to callers.
/// `invalid` lists references that no longer resolve, by field.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    #[serde(flatten)]
    pub template: Template,
    pub invalid: BTreeMap<String, Vec<String>>,
}
