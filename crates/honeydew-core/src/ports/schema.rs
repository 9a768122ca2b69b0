//! Schema port - what the core needs to know about the user's table.
//!
//! Primary-key values are opaque: they cross the wire only through
//! [`SchemaAdapter::dump`] and [`SchemaAdapter::load`], so UUIDs, integers
//! and binary ids round-trip exactly without the core knowing their shape.

use crate::error::SourceError;
use crate::ports::repo::SqlValue;

/// The user's schema, behind a capability interface.
pub trait SchemaAdapter: Send + Sync {
    /// Bare table name, no schema prefix.
    fn table(&self) -> &str;

    /// Optional schema prefix (`public`, a tenant schema, ...).
    fn schema_prefix(&self) -> Option<&str> {
        None
    }

    /// Ordered primary-key field names; compound keys list every field.
    fn primary_key(&self) -> &[String];

    /// App-level value -> wire value for one primary-key field.
    fn dump(&self, field: &str, value: &serde_json::Value) -> Result<SqlValue, SourceError>;

    /// Wire value -> app-level value for one primary-key field.
    fn load(&self, field: &str, value: SqlValue) -> Result<serde_json::Value, SourceError>;
}

/// Ready-made adapter for tables whose key columns are integers, strings,
/// or UUIDs.
///
/// Key fields named in [`uuid_keys`](TableSchema::uuid_keys) cross the
/// wire as native UUIDs; everything else dumps as the JSON value's own
/// shape. Anything richer implements [`SchemaAdapter`] directly.
pub struct TableSchema {
    table: String,
    schema_prefix: Option<String>,
    primary_key: Vec<String>,
    uuid_keys: Vec<String>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, primary_key: &[&str]) -> Self {
        Self {
            table: table.into(),
            schema_prefix: None,
            primary_key: primary_key.iter().map(|f| (*f).to_owned()).collect(),
            uuid_keys: Vec::new(),
        }
    }

    pub fn in_schema(mut self, prefix: impl Into<String>) -> Self {
        self.schema_prefix = Some(prefix.into());
        self
    }

    /// Declare which key fields are `uuid`-typed columns.
    pub fn uuid_keys(mut self, fields: &[&str]) -> Self {
        self.uuid_keys = fields.iter().map(|f| (*f).to_owned()).collect();
        self
    }

    fn is_uuid_key(&self, field: &str) -> bool {
        self.uuid_keys.iter().any(|f| f == field)
    }
}

impl SchemaAdapter for TableSchema {
    fn table(&self) -> &str {
        &self.table
    }

    fn schema_prefix(&self) -> Option<&str> {
        self.schema_prefix.as_deref()
    }

    fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    fn dump(&self, field: &str, value: &serde_json::Value) -> Result<SqlValue, SourceError> {
        if self.is_uuid_key(field) {
            let text = value.as_str().ok_or_else(|| SourceError::Marshal {
                field: field.to_owned(),
                reason: format!("uuid key must be a string, got {value}"),
            })?;
            return uuid::Uuid::parse_str(text)
                .map(SqlValue::Uuid)
                .map_err(|e| SourceError::Marshal {
                    field: field.to_owned(),
                    reason: e.to_string(),
                });
        }
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(SqlValue::BigInt).ok_or_else(|| {
                SourceError::Marshal {
                    field: field.to_owned(),
                    reason: format!("non-integer number {n}"),
                }
            }),
            serde_json::Value::String(s) => Ok(SqlValue::Text(s.clone())),
            serde_json::Value::Null => Ok(SqlValue::Null),
            other => Err(SourceError::Marshal {
                field: field.to_owned(),
                reason: format!("unsupported key value {other}"),
            }),
        }
    }

    fn load(&self, field: &str, value: SqlValue) -> Result<serde_json::Value, SourceError> {
        match value {
            SqlValue::BigInt(v) => Ok(serde_json::Value::from(v)),
            SqlValue::Text(s) => Ok(serde_json::Value::from(s)),
            SqlValue::Uuid(u) => Ok(serde_json::Value::from(u.to_string())),
            SqlValue::Null => Ok(serde_json::Value::Null),
            SqlValue::Bytes(_) => Err(SourceError::Marshal {
                field: field.to_owned(),
                reason: "binary keys need a custom schema adapter".to_owned(),
            }),
        }
    }
}
