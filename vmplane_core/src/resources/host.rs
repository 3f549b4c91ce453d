use serde::{Deserialize, Serialize};

/// A host package with an update pending.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostPackage {
    pub package_name: String,
    /// Version the update brings.
    pub version: String,
    pub arch: String,
    /// Repository the update comes from.
    pub repository: String,
}

/// A software repository the host installs packages from.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub repo_id: String,
    pub repo_name: String,
    pub baseurl: String,
    pub enabled: bool,
    #[serde(default)]
    pub gpgcheck: bool,
    #[serde(default)]
    pub gpgkey: Option<String>,
}

impl Repository {
    pub fn uri(&self) -> String {
        format!("/host/repositories/{}", self.repo_id)
    }
}
