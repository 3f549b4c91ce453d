//! A single process control plane for virtual machines.
//!
//! Entities (templates, vms, storage pools and volumes, networks, snapshots)
//! live in an in-memory [`orchestra::Inventory`] owned by the
//! [`Orchestrator`]. Slow mutations run on the [`task::TaskManager`] and are
//! polled for completion.

pub mod config;
pub mod database;
pub mod hypervisor;
pub mod orchestra;
pub mod rand;
pub mod resources;
pub mod task;

// Reexports
pub use config::VmplaneConfig;
pub use orchestra::{ListFilter, Orchestrator, Reply};
pub use task::{TaskFilter, TaskInfo, TaskManager, TaskStatus};
