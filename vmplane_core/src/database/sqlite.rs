use super::entity::{prelude::*, record};
use super::{Change, Kind, RecordStore};

//Database
use chrono::{NaiveDateTime, Utc};
use sea_orm::{
    sea_query::OnConflict, ActiveValue, ColumnTrait, ConnectionTrait, Database,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use vmplane_migration::{Migrator, MigratorTrait};

use async_trait::async_trait;
use serde_json::Value;

// Error Handling
use log::{debug, trace};
use vmplane_error::VmplaneError;

/*
* Connect to the database and bring its schema up to date.
*/
pub async fn connect_db(url: &str) -> Result<DatabaseConnection, VmplaneError> {
    let db = Database::connect(url).await?;
    Migrator::up(&db, None).await?;
    debug!("connected to database {:#?}", url);
    Ok(db)
}
/*
* Create a fresh database and ovewrite the old one.
*/
pub async fn fresh_db(url: &str) -> Result<DatabaseConnection, VmplaneError> {
    let db = Database::connect(url).await?;
    Migrator::fresh(&db).await?;
    Ok(db)
}

/// Record store backed by the sqlite `record` table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
    pub async fn connect(url: &str) -> Result<Self, VmplaneError> {
        Ok(Self::new(connect_db(url).await?))
    }
    async fn put_with<C: ConnectionTrait>(
        db: &C,
        kind: Kind,
        key: &str,
        document: Value,
    ) -> Result<(), VmplaneError> {
        let now: NaiveDateTime = Utc::now().naive_utc();
        let record = record::ActiveModel {
            kind: ActiveValue::Set(kind.to_string()),
            key: ActiveValue::Set(key.to_owned()),
            definition: ActiveValue::Set(document),

            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),

            ..Default::default()
        };
        // Keep the creation date of an existing record.
        let on_conflict = OnConflict::columns([record::Column::Kind, record::Column::Key])
            .update_columns([record::Column::Definition, record::Column::UpdatedAt])
            .to_owned();
        Record::insert(record)
            .on_conflict(on_conflict)
            .exec_without_returning(db)
            .await?;
        Ok(())
    }
    async fn delete_with<C: ConnectionTrait>(
        db: &C,
        kind: Kind,
        key: &str,
    ) -> Result<(), VmplaneError> {
        Record::delete_many()
            .filter(record::Column::Kind.eq(kind.to_string()))
            .filter(record::Column::Key.eq(key))
            .exec(db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Value>, VmplaneError> {
        let res = Record::find()
            .filter(record::Column::Kind.eq(kind.to_string()))
            .filter(record::Column::Key.eq(key))
            .one(&self.db)
            .await?;
        Ok(res.map(|e| e.definition))
    }
    async fn put(&self, kind: Kind, key: &str, document: Value) -> Result<(), VmplaneError> {
        Self::put_with(&self.db, kind, key, document).await
    }
    async fn delete(&self, kind: Kind, key: &str) -> Result<(), VmplaneError> {
        Self::delete_with(&self.db, kind, key).await
    }
    async fn list(&self, kind: Kind) -> Result<Vec<(String, Value)>, VmplaneError> {
        let records = Record::find()
            .filter(record::Column::Kind.eq(kind.to_string()))
            .order_by_asc(record::Column::Id)
            .all(&self.db)
            .await?;
        Ok(records.into_iter().map(|e| (e.key, e.definition)).collect())
    }
    /*
     * The whole batch runs in a single transaction.
     */
    async fn commit(&self, changes: Vec<Change>) -> Result<(), VmplaneError> {
        let txn = self.db.begin().await?;
        trace!("commit {} changes to sqlite", changes.len());
        for change in changes {
            match change {
                Change::Put {
                    kind,
                    key,
                    document,
                } => Self::put_with(&txn, kind, &key, document).await?,
                Change::Delete { kind, key } => Self::delete_with(&txn, kind, &key).await?,
            }
        }
        txn.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // Error Handling
    use miette::{IntoDiagnostic, Result};

    async fn store(dir: &tempfile::TempDir) -> Result<SqliteStore> {
        let url = format!("sqlite://{}/vmplane.sqlite?mode=rwc", dir.path().display());
        let db = fresh_db(&url).await?;
        Ok(SqliteStore::new(db))
    }

    #[tokio::test]
    async fn connect_to_db() -> Result<()> {
        let dir = tempfile::tempdir().into_diagnostic()?;
        let url = format!("sqlite://{}/vmplane.sqlite?mode=rwc", dir.path().display());
        SqliteStore::connect(&url).await?;
        Ok(())
    }

    #[tokio::test]
    async fn upsert_and_list_in_order() -> Result<()> {
        let dir = tempfile::tempdir().into_diagnostic()?;
        let store = store(&dir).await?;

        store.put(Kind::Network, "default", json!({"name": "default"})).await?;
        store.put(Kind::Network, "lan", json!({"name": "lan"})).await?;
        store
            .put(Kind::Network, "default", json!({"name": "default", "autostart": true}))
            .await?;

        let res = store.list(Kind::Network).await?;
        let keys: Vec<&str> = res.iter().map(|e| e.0.as_str()).collect();
        assert_eq!(keys, vec!["default", "lan"]);
        assert_eq!(
            store.get(Kind::Network, "default").await?,
            Some(json!({"name": "default", "autostart": true}))
        );
        assert_eq!(store.get(Kind::Vm, "default").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn commit_batch() -> Result<()> {
        let dir = tempfile::tempdir().into_diagnostic()?;
        let store = store(&dir).await?;
        store.put(Kind::Template, "old", json!({})).await?;

        let changes = vec![
            Change::Put {
                kind: Kind::Template,
                key: "new".to_owned(),
                document: json!({"name": "new"}),
            },
            Change::Delete {
                kind: Kind::Template,
                key: "old".to_owned(),
            },
        ];
        store.commit(changes).await?;

        let res = store.list(Kind::Template).await?;
        assert_eq!(res, vec![("new".to_owned(), json!({"name": "new"}))]);
        Ok(())
    }
}
