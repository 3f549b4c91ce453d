use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// Error Handling
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PoolType {
    Dir,
    Netfs,
    Logical,
    Iscsi,
    Scsi,
}
impl PoolType {
    /// Volumes are discovered on the backing device, never allocated.
    pub fn is_lun_based(&self) -> bool {
        matches!(self, PoolType::Iscsi | PoolType::Scsi)
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PoolState {
    Active,
    #[default]
    Inactive,
}

/// Where a pool gets its storage from, depending on its type.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PoolType,
    pub path: Option<String>,
    pub source: PoolSource,
    pub capacity: u64,
    pub allocated: u64,
    pub state: PoolState,
    pub autostart: bool,
}

impl StoragePool {
    pub fn uri(&self) -> String {
        format!("/storagepools/{}", self.name)
    }
    pub fn is_active(&self) -> bool {
        self.state == PoolState::Active
    }
    /*
     * Every pool type needs its own source fields.
     */
    pub fn check_source(&self) -> Result<(), VmplaneError> {
        let source = &self.source;
        let missing = match self.kind {
            PoolType::Dir => self.path.is_none().then_some("path"),
            PoolType::Netfs => (source.host.is_none() || source.path.is_none())
                .then_some("source.host and source.path"),
            PoolType::Logical => source.devices.is_empty().then_some("source.devices"),
            PoolType::Iscsi => (source.host.is_none() || source.target.is_none())
                .then_some("source.host and source.target"),
            PoolType::Scsi => source.adapter_name.is_none().then_some("source.adapter_name"),
        };
        match missing {
            Some(fields) => Err(VmplaneError::invalid(
                Reason::PoolSourceInvalid,
                &format!("a {} pool requires {}", self.kind, fields),
            )),
            None => Ok(()),
        }
    }
    /// Directory new volumes land in.
    pub fn target_dir(&self) -> String {
        match &self.path {
            Some(path) => path.trim_end_matches('/').to_owned(),
            None => format!("/dev/{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageVolume {
    pub name: String,
    pub pool: String,
    pub path: String,
    pub capacity: u64,
    pub allocation: u64,
    pub format: String,
    /// Live bindings (vm devices) keeping the volume alive.
    pub ref_cnt: u32,
    pub bootable: bool,
    #[serde(default)]
    pub base: Option<String>,
    pub os_distro: String,
    pub os_version: String,
}

impl StorageVolume {
    pub fn uri(&self) -> String {
        format!("/storagepools/{}/storagevolumes/{}", self.pool, self.name)
    }
    pub fn is_iso(&self) -> bool {
        self.format == "iso"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Error Handling
    use miette::Result;

    #[test]
    fn pool_source_by_type() -> Result<()> {
        let mut pool = StoragePool {
            name: "tmp".to_owned(),
            kind: PoolType::Dir,
            path: None,
            source: PoolSource::default(),
            capacity: 0,
            allocated: 0,
            state: PoolState::Inactive,
            autostart: false,
        };
        assert!(pool.check_source().is_err());
        pool.path = Some("/tmp/".to_owned());
        pool.check_source()?;
        assert_eq!(pool.target_dir(), "/tmp");

        pool.kind = PoolType::Scsi;
        assert!(pool.check_source().is_err());
        pool.source.adapter_name = Some("scsi_host2".to_owned());
        pool.check_source()?;
        Ok(())
    }
}
