//! In-memory representation of every durable entity.
//!
//! Types here only carry the invariants that hold for a single entity.
//! Rules spanning several entities live in the orchestrator.

pub mod graphics;
pub mod host;
pub mod network;
pub mod report;
pub mod snapshot;
pub mod storage;
pub mod template;
pub mod vm;

// Reexports
pub use graphics::{Graphics, GraphicsType};
pub use host::{HostPackage, Repository};
pub use network::{Connection, Network, NetworkState};
pub use report::DebugReport;
pub use snapshot::Snapshot;
pub use storage::{PoolSource, PoolState, PoolType, StoragePool, StorageVolume};
pub use template::{DiskSpec, Template, TemplateInfo};
pub use vm::{DeviceType, DomainState, Iface, IfaceType, StorageDevice, Vm, VmInfo, VmState};

pub const GIB: u64 = 1 << 30;
