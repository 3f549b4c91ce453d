pub mod load;

use crate::resources::GraphicsType;

// Config
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

pub const MANAGED_DIR: &'static str = "/var/lib/vmplane";
pub const CONFIG_DIR: &'static str = "/etc/vmplane";

/*
* The main control plane configuration struct.
* Every section falls back to its defaults when omitted.
*/
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct VmplaneConfig {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub vm: VmDefaults,
    pub limits: Limits,
    pub database: DatabaseConfig,
    pub reports: ReportConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Pool used by templates that do not name one.
    pub default_pool: String,
    pub default_pool_path: String,
    /// Name of the derived read-only collection of iso volumes.
    pub iso_collection: String,
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_pool: "default-pool".to_owned(),
            default_pool_path: format!("{MANAGED_DIR}/images"),
            iso_collection: "isos".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub default_network: String,
    pub default_subnet: IpNet,
    /// Interface model when an attach request omits it.
    pub iface_model: String,
}
impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_network: "default".to_owned(),
            default_subnet: IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 122, 0), 24)),
            iface_model: "e1000".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct VmDefaults {
    pub cpus: u32,
    /// Memory in MiB
    pub memory: u64,
    /// Disk size in GiB
    pub disk_size: u64,
    pub graphics: GraphicsType,
    pub listen: IpAddr,
    pub max_vcpus: u32,
    pub min_memory: u64,
}
impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory: 1024,
            disk_size: 10,
            graphics: GraphicsType::Vnc,
            listen: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_vcpus: 255,
            min_memory: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    /// Maximum accepted upload size in bytes.
    pub max_body_size: u64,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: format!("sqlite:///{MANAGED_DIR}/vmplane.sqlite?mode=rwc"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    pub dir: String,
}
impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: format!("{MANAGED_DIR}/debugreports"),
        }
    }
}
