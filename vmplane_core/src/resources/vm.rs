use super::Graphics;

use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

// Error Handling
use vmplane_error::{Reason, VmplaneError};

#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VmState {
    #[default]
    Shutoff,
    Running,
    Paused,
    Shutdown,
    Crashed,
}
impl VmState {
    /// The domain holds runtime resources.
    pub fn is_active(&self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }
}

/// Runtime state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct DomainState {
    pub state: VmState,
    pub cpus: u32,
    pub memory: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceType {
    Cdrom,
    Disk,
}
impl DeviceType {
    fn prefix(&self) -> &'static str {
        match self {
            DeviceType::Cdrom => "hd",
            DeviceType::Disk => "vd",
        }
    }
}

/// A storage device attached to a vm.
/// Backed either by a plain path or by a pool volume.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageDevice {
    pub dev: String,
    #[serde(rename = "type")]
    pub kind: DeviceType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol: Option<String>,
    /// The volume was allocated for this vm and dies with it.
    #[serde(default)]
    pub owned: bool,
}
impl StorageDevice {
    pub fn volume(&self) -> Option<(&str, &str)> {
        match (&self.pool, &self.vol) {
            (Some(pool), Some(vol)) => Some((pool, vol)),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IfaceType {
    #[default]
    Network,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Iface {
    pub mac: MacAddr6,
    #[serde(rename = "type")]
    pub kind: IfaceType,
    pub network: String,
    pub model: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub name: String,
    pub uuid: Uuid,
    /// Name of the template the vm was created from.
    pub template: String,
    pub state: VmState,
    pub cpus: u32,
    /// Memory in MiB
    pub memory: u64,
    pub graphics: Graphics,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub icon: Option<String>,
    pub os_distro: String,
    pub os_version: String,
    pub storages: Vec<StorageDevice>,
    pub ifaces: Vec<Iface>,
    pub current_snapshot: Option<String>,
}

impl Vm {
    pub fn uri(&self) -> String {
        format!("/vms/{}", self.name)
    }
    pub fn info(&self) -> VmInfo {
        VmInfo {
            name: self.name.clone(),
            uuid: self.uuid,
            template: self.template.clone(),
            state: self.state,
            cpus: self.cpus,
            memory: self.memory,
            graphics: self.graphics.clone(),
            users: self.users.clone(),
            groups: self.groups.clone(),
            icon: self.icon.clone(),
            os_distro: self.os_distro.clone(),
            os_version: self.os_version.clone(),
        }
    }
    pub fn device(&self, dev: &str) -> Result<&StorageDevice, VmplaneError> {
        self.storages.iter().find(|e| e.dev == dev).ok_or_else(|| {
            VmplaneError::not_found(
                Reason::DeviceNotFound,
                &format!("vm {:#?} has no device {:#?}", self.name, dev),
            )
        })
    }
    pub fn iface(&self, mac: &MacAddr6) -> Result<&Iface, VmplaneError> {
        self.ifaces.iter().find(|e| &e.mac == mac).ok_or_else(|| {
            VmplaneError::not_found(
                Reason::IfaceNotFound,
                &format!("vm {:#?} has no interface {}", self.name, mac),
            )
        })
    }
    /*
     * First free device name for the given bus, "hda", "vdb"...
     */
    pub fn next_dev(&self, kind: DeviceType) -> Result<String, VmplaneError> {
        let prefix = kind.prefix();
        for letter in 'a'..='z' {
            let dev = format!("{prefix}{letter}");
            if !self.storages.iter().any(|e| e.dev == dev) {
                return Ok(dev);
            }
        }
        Err(VmplaneError::invalid(
            Reason::DeviceNameInUse,
            &format!("vm {:#?} has no free {} device name left", self.name, kind),
        ))
    }
}

/// Vm as shown to callers.
/// Devices, interfaces and snapshots are sub-resources.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub uuid: Uuid,
    pub template: String,
    pub state: VmState,
    pub cpus: u32,
    pub memory: u64,
    pub graphics: Graphics,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub icon: Option<String>,
    pub os_distro: String,
    pub os_version: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::GraphicsType;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};

    // Error Handling
    use miette::Result;

    fn device(dev: &str, kind: DeviceType) -> StorageDevice {
        StorageDevice {
            dev: dev.to_owned(),
            kind,
            path: "/tmp/x".to_owned(),
            pool: None,
            vol: None,
            owned: false,
        }
    }

    #[test]
    fn allocate_device_names() -> Result<()> {
        let mut vm = Vm {
            name: "vm".to_owned(),
            uuid: Uuid::new_v4(),
            template: "test".to_owned(),
            state: VmState::Shutoff,
            cpus: 1,
            memory: 1024,
            graphics: Graphics::new(GraphicsType::Vnc, IpAddr::V4(Ipv4Addr::LOCALHOST)),
            users: vec![],
            groups: vec![],
            icon: None,
            os_distro: "unknown".to_owned(),
            os_version: "unknown".to_owned(),
            storages: vec![],
            ifaces: vec![],
            current_snapshot: None,
        };
        assert_eq!(vm.next_dev(DeviceType::Cdrom)?, "hda");
        vm.storages.push(device("hda", DeviceType::Cdrom));
        vm.storages.push(device("vda", DeviceType::Disk));
        vm.storages.push(device("vdc", DeviceType::Disk));
        assert_eq!(vm.next_dev(DeviceType::Cdrom)?, "hdb");
        assert_eq!(vm.next_dev(DeviceType::Disk)?, "vdb");
        assert!(vm.device("vdc").is_ok());
        assert!(vm.device("vdz").is_err());
        Ok(())
    }

    #[test]
    fn active_states() -> Result<()> {
        assert!(VmState::Running.is_active());
        assert!(VmState::Paused.is_active());
        assert!(!VmState::Shutdown.is_active());
        assert_eq!(VmState::Shutoff.to_string(), "shutoff");
        Ok(())
    }
}
