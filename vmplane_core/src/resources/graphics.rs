use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use strum::{Display, EnumString};

#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GraphicsType {
    #[default]
    Vnc,
    Spice,
}

/// Remote display of a vm.
/// Templates never carry a password.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Graphics {
    #[serde(rename = "type")]
    pub kind: GraphicsType,
    pub listen: IpAddr,
    #[serde(default)]
    pub passwd: Option<String>,
    #[serde(default, rename = "passwdValidTo")]
    pub passwd_valid_to: Option<DateTime<Utc>>,
}

impl Graphics {
    pub fn new(kind: GraphicsType, listen: IpAddr) -> Self {
        Self {
            kind,
            listen,
            passwd: None,
            passwd_valid_to: None,
        }
    }
    /// Password is set and not expired yet.
    pub fn passwd_active(&self) -> bool {
        match (&self.passwd, &self.passwd_valid_to) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(to)) => *to > Utc::now(),
        }
    }
}
