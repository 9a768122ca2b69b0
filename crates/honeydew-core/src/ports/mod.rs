//! Capability interfaces the caller injects at construction.
//!
//! The core never reflects on user types: the database is a [`Repo`], the
//! user's table is a [`SchemaAdapter`], and that is all it gets to see.
pub mod repo;
pub mod schema;

pub use repo::{Database, Repo, SqlRow, SqlValue};
pub use schema::{SchemaAdapter, TableSchema};
