//! `SeaORM` Entity, matching the `vmplane_migration` schema.

pub mod prelude;

pub mod record;
