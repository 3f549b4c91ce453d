use serde::{Deserialize, Serialize};

/// A json dump of the control plane state, written to disk by a task.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DebugReport {
    pub name: String,
    pub path: String,
    /// Unix timestamp
    pub created: i64,
}

impl DebugReport {
    pub fn uri(&self) -> String {
        format!("/debugreports/{}", self.name)
    }
}
