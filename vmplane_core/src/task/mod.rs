//! Asynchronous task registry.
//!
//! A task is a unit of work running on its own tokio task, polled by id.
//! Tasks are never persisted, ids restart at 1 with the process.

mod manager;
mod reporter;

pub use manager::TaskManager;
pub use reporter::Reporter;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Finished,
    Failed,
}
impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        *self != TaskStatus::Running
    }
}

/// Snapshot of a task as shown to callers.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: u64,
    pub status: TaskStatus,
    pub message: String,
    pub target_uri: String,
}

#[derive(Debug, Clone, Default, Builder)]
pub struct TaskFilter {
    /// Exact status match
    pub status: Option<TaskStatus>,
    /// Regex searched in the target uri.
    #[builder(into)]
    pub target_uri: Option<String>,
}
