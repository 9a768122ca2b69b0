//! Repo implementation over an sqlx Postgres pool.
//!
//! Works for CockroachDB as well, which speaks the Postgres wire protocol;
//! construct with [`PgRepo::cockroach`] so the dialect is inferred right.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Row, TypeInfo, ValueRef};

use crate::error::RepoError;
use crate::ports::{Database, Repo, SqlRow, SqlValue};

pub struct PgRepo {
    pool: PgPool,
    database: Database,
}

impl PgRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            database: Database::Postgres,
        }
    }

    pub fn cockroach(pool: PgPool) -> Self {
        Self {
            pool,
            database: Database::CockroachDb,
        }
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    params: Vec<SqlValue>,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = match param {
            SqlValue::BigInt(v) => query.bind(v),
            SqlValue::Bytes(b) => query.bind(b),
            SqlValue::Text(s) => query.bind(s),
            // Bound natively: a text parameter gets no implicit cast to a
            // uuid column.
            SqlValue::Uuid(u) => query.bind(u),
            // The only nullable parameter the dialects emit is the private
            // blob, so a bare null binds as a null bytea.
            SqlValue::Null => query.bind(None::<Vec<u8>>),
        };
    }
    query
}

fn classify(error: sqlx::Error) -> RepoError {
    match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_) => RepoError::transient(error.to_string()),
        _ => RepoError::logical(error.to_string()),
    }
}

fn read_column(row: &PgRow, index: usize) -> Result<SqlValue, RepoError> {
    let type_name = {
        let raw = row
            .try_get_raw(index)
            .map_err(|e| RepoError::logical(e.to_string()))?;
        if raw.is_null() {
            return Ok(SqlValue::Null);
        }
        raw.type_info().name().to_owned()
    };

    let decoded = match type_name.as_str() {
        "INT8" => SqlValue::BigInt(row.try_get::<i64, _>(index).map_err(decode_error)?),
        "INT4" => SqlValue::BigInt(i64::from(
            row.try_get::<i32, _>(index).map_err(decode_error)?,
        )),
        "INT2" => SqlValue::BigInt(i64::from(
            row.try_get::<i16, _>(index).map_err(decode_error)?,
        )),
        "BYTEA" => SqlValue::Bytes(row.try_get::<Vec<u8>, _>(index).map_err(decode_error)?),
        "UUID" => SqlValue::Uuid(row.try_get::<uuid::Uuid, _>(index).map_err(decode_error)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            SqlValue::Text(row.try_get::<String, _>(index).map_err(decode_error)?)
        }
        other => {
            return Err(RepoError::logical(format!(
                "unsupported column type {other}"
            )))
        }
    };
    Ok(decoded)
}

fn decode_error(error: sqlx::Error) -> RepoError {
    RepoError::logical(error.to_string())
}

#[async_trait]
impl Repo for PgRepo {
    async fn fetch_all(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<SqlRow>, RepoError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        rows.iter()
            .map(|row| (0..row.len()).map(|i| read_column(row, i)).collect())
            .collect()
    }

    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, RepoError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    fn database(&self) -> Database {
        self.database
    }
}
