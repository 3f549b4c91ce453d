use super::{Change, Kind, RecordStore};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

// Error Handling
use log::trace;
use vmplane_error::{LibError, VmplaneError};

/// Volatile record store.
/// Keeps documents in insertion order, as sqlite does with its row ids.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<(Kind, String, Value)>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
    /// Make every following write fail, to exercise rollbacks.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
    fn check_writable(&self) -> Result<(), VmplaneError> {
        if self.failing.load(Ordering::SeqCst) {
            let err = LibError::builder()
                .msg("record store rejected the write")
                .help("the store was set to fail")
                .build();
            return Err(err.into());
        }
        Ok(())
    }
    fn apply(records: &mut Vec<(Kind, String, Value)>, change: Change) {
        match change {
            Change::Put {
                kind,
                key,
                document,
            } => match records.iter_mut().find(|e| e.0 == kind && e.1 == key) {
                Some(record) => record.2 = document,
                None => records.push((kind, key, document)),
            },
            Change::Delete { kind, key } => records.retain(|e| !(e.0 == kind && e.1 == key)),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Value>, VmplaneError> {
        let records = self.records.lock().await;
        let res = records
            .iter()
            .find(|e| e.0 == kind && e.1 == key)
            .map(|e| e.2.clone());
        Ok(res)
    }
    async fn put(&self, kind: Kind, key: &str, document: Value) -> Result<(), VmplaneError> {
        self.commit(vec![Change::Put {
            kind,
            key: key.to_owned(),
            document,
        }])
        .await
    }
    async fn delete(&self, kind: Kind, key: &str) -> Result<(), VmplaneError> {
        self.commit(vec![Change::Delete {
            kind,
            key: key.to_owned(),
        }])
        .await
    }
    async fn list(&self, kind: Kind) -> Result<Vec<(String, Value)>, VmplaneError> {
        let records = self.records.lock().await;
        let res = records
            .iter()
            .filter(|e| e.0 == kind)
            .map(|e| (e.1.clone(), e.2.clone()))
            .collect();
        Ok(res)
    }
    async fn commit(&self, changes: Vec<Change>) -> Result<(), VmplaneError> {
        self.check_writable()?;
        let mut records = self.records.lock().await;
        trace!("commit {} changes to memory store", changes.len());
        for change in changes {
            Self::apply(&mut records, change);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // Error Handling
    use miette::Result;

    #[tokio::test]
    async fn put_get_delete() -> Result<()> {
        let store = MemoryStore::new();
        store.put(Kind::Vm, "a", json!({"name": "a"})).await?;
        store.put(Kind::Vm, "b", json!({"name": "b"})).await?;
        store.put(Kind::Vm, "a", json!({"name": "a2"})).await?;
        store.put(Kind::Template, "a", json!({"name": "t"})).await?;

        let keys: Vec<String> = store.list(Kind::Vm).await?.into_iter().map(|e| e.0).collect();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(store.get(Kind::Vm, "a").await?, Some(json!({"name": "a2"})));

        store.delete(Kind::Vm, "a").await?;
        assert_eq!(store.get(Kind::Vm, "a").await?, None);
        assert_eq!(store.list(Kind::Template).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failing_commit_changes_nothing() -> Result<()> {
        let store = MemoryStore::new();
        store.set_failing(true);
        let changes = vec![Change::Put {
            kind: Kind::Network,
            key: "default".to_owned(),
            document: json!({}),
        }];
        assert!(store.commit(changes).await.is_err());
        assert!(store.list(Kind::Network).await?.is_empty());
        Ok(())
    }
}
