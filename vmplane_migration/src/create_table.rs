//!
//! Generate entities.
//!
//! ```sh
//! # on the repo root
//! sea-orm-cli generate entity --output-dir ./vmplane_core/src/database/entity
//! ```
//!

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Every durable entity document.
        manager
            .create_table(
                Table::create()
                    .table(Record::Table)
                    .if_not_exists()
                    .col(pk_auto(Record::Id))
                    .col(string(Record::Kind))
                    .col(string(Record::Key))
                    .col(json(Record::Definition))
                    .col(date_time(Record::CreatedAt))
                    .col(date_time(Record::UpdatedAt))
                    .to_owned(),
            )
            .await?;
        // One document per (kind, key).
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_record_kind_key")
                    .table(Record::Table)
                    .col(Record::Kind)
                    .col(Record::Key)
                    .unique()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Record::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden, Debug)]
pub enum Record {
    Table,
    Id,
    Kind,
    Key,
    Definition,
    CreatedAt,
    UpdatedAt,
}

#[cfg(test)]
mod tests {
    use crate::{Migrator, MigratorTrait};
    use miette::{IntoDiagnostic, Result};

    #[tokio::test]
    async fn create_db() -> Result<()> {
        let connection = sea_orm::Database::connect("sqlite::memory:")
            .await
            .into_diagnostic()?;
        Migrator::fresh(&connection).await.into_diagnostic()?;
        Ok(())
    }
}
