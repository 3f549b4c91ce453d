//! Durable entity documents.
//!
//! Every entity is persisted as a json document keyed by `(Kind, key)`.
//! Tasks are never persisted.

pub mod entity;
mod memory;
mod sqlite;

// Reexports
pub use memory::MemoryStore;
pub use sqlite::{connect_db, fresh_db, SqliteStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use strum::{Display, EnumIter, EnumString};

// Error Handling
use vmplane_error::VmplaneError;

#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Template,
    Vm,
    StoragePool,
    StorageVolume,
    Network,
    Snapshot,
    DebugReport,
    Repository,
}

/// One staged mutation of the record store.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Put {
        kind: Kind,
        key: String,
        document: Value,
    },
    Delete {
        kind: Kind,
        key: String,
    },
}

#[async_trait]
pub trait RecordStore: Send + Sync + fmt::Debug {
    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Value>, VmplaneError>;
    async fn put(&self, kind: Kind, key: &str, document: Value) -> Result<(), VmplaneError>;
    async fn delete(&self, kind: Kind, key: &str) -> Result<(), VmplaneError>;
    /// Documents of a kind, in insertion order.
    async fn list(&self, kind: Kind) -> Result<Vec<(String, Value)>, VmplaneError>;
    /*
     * Apply a batch of changes.
     * Stores able to do so apply the whole batch or nothing.
     */
    async fn commit(&self, changes: Vec<Change>) -> Result<(), VmplaneError> {
        for change in changes {
            match change {
                Change::Put {
                    kind,
                    key,
                    document,
                } => self.put(kind, &key, document).await?,
                Change::Delete { kind, key } => self.delete(kind, &key).await?,
            }
        }
        Ok(())
    }
}
