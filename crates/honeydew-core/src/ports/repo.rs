//! Repo port - the user's database handle behind a capability interface.
//!
//! The core never sees a connection or a driver type; it hands SQL text and
//! positional parameters to whatever the caller injected at construction.

use async_trait::async_trait;

use crate::error::RepoError;

/// Database engines the table source knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Database {
    Postgres,
    CockroachDb,
}

/// A wire value, both as a statement parameter and as a fetched column.
///
/// `Uuid` is its own variant rather than text: a concretely-typed text
/// parameter gets no implicit cast to a `uuid` column, so collapsing the
/// two would break every keyed statement against UUID-keyed tables.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    BigInt(i64),
    Bytes(Vec<u8>),
    Text(String),
    Uuid(uuid::Uuid),
    Null,
}

/// One fetched row, columns in statement order.
pub type SqlRow = Vec<SqlValue>;

/// Runs SQL on behalf of the table source.
///
/// Implementations classify their failures as transient or logical via
/// [`RepoError`]; the source degrades transient errors to "empty" and
/// surfaces logical ones.
#[async_trait]
pub trait Repo: Send + Sync {
    async fn fetch_all(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<SqlRow>, RepoError>;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, RepoError>;

    /// Engine behind this repo; used to pick a dialect when none is
    /// configured explicitly.
    fn database(&self) -> Database {
        Database::Postgres
    }
}
