//! Shared SQLite schema declaration and versioning helpers.
//!
//! Both durable stores in this crate (the recovery journal and the projection
//! store) declare their tables through [`VersionedSchema`] so databases are
//! created, validated and migrated the same way everywhere.

mod versioned_schema;

pub use versioned_schema::{
    Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION, DEFAULT_TIMESTAMP,
};
