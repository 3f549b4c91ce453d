use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Connection {
    Nat,
    Bridge,
    Isolated,
    Macvtap,
}
impl Connection {
    /// Attaches to an existing host interface instead of owning an address range.
    pub fn is_bridged(&self) -> bool {
        matches!(self, Connection::Bridge | Connection::Macvtap)
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkState {
    Active,
    #[default]
    Inactive,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub connection: Connection,
    pub subnet: Option<IpNet>,
    pub interface: Option<String>,
    pub state: NetworkState,
    pub autostart: bool,
}

impl Network {
    pub fn uri(&self) -> String {
        format!("/networks/{}", self.name)
    }
    pub fn is_active(&self) -> bool {
        self.state == NetworkState::Active
    }
    pub fn overlaps(&self, subnet: &IpNet) -> bool {
        match &self.subnet {
            Some(own) => own.contains(subnet) || subnet.contains(own),
            None => false,
        }
    }
}
