pub use super::record::Entity as Record;
