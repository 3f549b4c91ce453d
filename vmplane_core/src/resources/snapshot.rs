use super::{DomainState, VmState};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A revertible point in time of a vm.
/// Snapshots of a vm form a chain through their parent name.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    /// Owning vm
    pub vm: Uuid,
    /// Empty for a root snapshot.
    pub parent: String,
    /// Unix timestamp
    pub created: i64,
    /// Creation order among the vm snapshots.
    #[serde(default)]
    pub seq: u64,
    pub state: VmState,
    pub cpus: u32,
    pub memory: u64,
}

impl Snapshot {
    pub fn key(&self) -> String {
        format!("{}/{}", self.vm, self.name)
    }
    pub fn captured(&self) -> DomainState {
        DomainState {
            state: self.state,
            cpus: self.cpus,
            memory: self.memory,
        }
    }
}
