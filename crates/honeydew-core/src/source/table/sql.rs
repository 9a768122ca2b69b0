//! SQL dialects.
//!
//! A dialect turns table metadata into the statements the table source
//! runs. Statements take positional `$n` parameters in a dialect-agnostic
//! order; all time arithmetic happens inside the database via
//! [`now_expr`](Dialect::now_expr) so that cooperating nodes never compare
//! their own clocks.

use super::lock::{ABANDONED, FAR_IN_THE_PAST_MS, STALE_WINDOW_MS};
use super::TableMeta;
use crate::source::FilterSelector;

/// Emits engine-specific SQL for every queue operation.
///
/// The one hard constraint on implementations: the reserve statement must
/// be a single atomic UPDATE, so that concurrent pollers on different
/// nodes never claim the same row.
pub trait Dialect: Send + Sync {
    /// Column type used for the lock column.
    fn integer_type(&self) -> &'static str {
        "bigint"
    }

    /// Quoted table reference, honoring any schema prefix.
    fn table_name(&self, meta: &TableMeta) -> String {
        match &meta.schema_prefix {
            Some(prefix) => format!("{}.{}", quote(prefix), quote(&meta.table)),
            None => quote(&meta.table),
        }
    }

    /// Scalar expression for the ready watermark at query time.
    fn ready_expr(&self) -> String {
        format!("({} - {})", self.now_expr(), FAR_IN_THE_PAST_MS)
    }

    /// Scalar expression for the current time as integer milliseconds.
    fn now_expr(&self) -> String {
        "(extract(epoch from now()) * 1000)::bigint".to_owned()
    }

    /// Claim one ready row: `($1 = stale timeout in ms)`, returning its
    /// primary-key columns and private column, or zero rows.
    fn reserve_sql(&self, meta: &TableMeta) -> String;

    /// Reschedule a reserved row: `($1 = delay in seconds, $2 = private
    /// blob, $3.. = pk values)`. Must affect exactly one row.
    fn delay_ready_sql(&self, meta: &TableMeta) -> String {
        format!(
            "UPDATE {table} SET {lock} = {ready} + ($1 * 1000), {private} = $2 WHERE {pk_where}",
            table = self.table_name(meta),
            lock = quote(&meta.lock_field),
            ready = self.ready_expr(),
            private = quote(&meta.private_field),
            pk_where = pk_where(meta, 3, None),
        )
    }

    /// Remove a cancellable row from the queue: `($1.. = pk values)`.
    ///
    /// Returns the row's previous lock value so the caller can tell a
    /// cancelled row from one that was in progress or already finished;
    /// rows outside the cancellable range are left untouched.
    fn cancel_sql(&self, meta: &TableMeta) -> String {
        let lock = quote(&meta.lock_field);
        let private = quote(&meta.private_field);
        let cancellable = format!("t.{lock} >= 0 AND t.{lock} < {}", self.now_expr());
        format!(
            "UPDATE {table} AS t \
             SET {lock} = CASE WHEN {cancellable} THEN NULL ELSE t.{lock} END, \
                 {private} = CASE WHEN {cancellable} THEN NULL ELSE t.{private} END \
             FROM {table} AS prev \
             WHERE {pk_where} AND {pk_join} \
             RETURNING prev.{lock}",
            table = self.table_name(meta),
            pk_where = pk_where(meta, 1, Some("t")),
            pk_join = pk_join(meta, "prev", "t"),
        )
    }

    /// Finalize a completed row: `($1.. = pk values)`.
    fn finish_sql(&self, meta: &TableMeta) -> String {
        format!(
            "UPDATE {table} SET {lock} = NULL, {private} = NULL WHERE {pk_where}",
            table = self.table_name(meta),
            lock = quote(&meta.lock_field),
            private = quote(&meta.private_field),
            pk_where = pk_where(meta, 1, None),
        )
    }

    /// Finalize an incomplete row as a terminal failure: `($1.. = pk values)`.
    fn abandon_sql(&self, meta: &TableMeta) -> String {
        format!(
            "UPDATE {table} SET {lock} = {ABANDONED}, {private} = NULL WHERE {pk_where}",
            table = self.table_name(meta),
            lock = quote(&meta.lock_field),
            private = quote(&meta.private_field),
            pk_where = pk_where(meta, 1, None),
        )
    }

    /// One row of counts: total, abandoned, ready, delayed, stale,
    /// in-progress. No parameters.
    fn status_sql(&self, meta: &TableMeta) -> String {
        let lock = quote(&meta.lock_field);
        let now = self.now_expr();
        let ready = self.ready_expr();
        format!(
            "SELECT count(*), \
             count(*) FILTER (WHERE {lock} < 0), \
             count(*) FILTER (WHERE {lock} BETWEEN 0 AND {ready}), \
             count(*) FILTER (WHERE {lock} > {ready} AND {lock} < {now} - {STALE_WINDOW_MS}), \
             count(*) FILTER (WHERE {lock} >= {now} - {STALE_WINDOW_MS} AND {lock} < {now}), \
             count(*) FILTER (WHERE {lock} >= {now}) \
             FROM {table}",
            table = self.table_name(meta),
        )
    }

    /// Restore stale rows to the column default. Idempotent; no parameters.
    fn reset_stale_sql(&self, meta: &TableMeta) -> String {
        let lock = quote(&meta.lock_field);
        let now = self.now_expr();
        format!(
            "UPDATE {table} SET {lock} = {ready}, {private} = NULL \
             WHERE {lock} >= {now} - {STALE_WINDOW_MS} AND {lock} < {now}",
            table = self.table_name(meta),
            ready = self.ready_expr(),
            private = quote(&meta.private_field),
        )
    }

    /// Primary keys of every row the selector matches. No parameters.
    fn filter_sql(&self, meta: &TableMeta, selector: FilterSelector) -> String {
        match selector {
            FilterSelector::Abandoned => format!(
                "SELECT {pks} FROM {table} WHERE {lock} < 0 ORDER BY {pks}",
                pks = pk_list(meta, None),
                table = self.table_name(meta),
                lock = quote(&meta.lock_field),
            ),
        }
    }
}

/// PostgreSQL: `FOR UPDATE SKIP LOCKED` is the contention primitive.
pub struct Postgres;

impl Dialect for Postgres {
    fn reserve_sql(&self, meta: &TableMeta) -> String {
        reserve_sql(self, meta, true)
    }
}

/// CockroachDB: no row locks to skip; serializable isolation and retryable
/// UPDATE semantics keep the claim atomic instead.
pub struct CockroachDb;

impl Dialect for CockroachDb {
    fn reserve_sql(&self, meta: &TableMeta) -> String {
        reserve_sql(self, meta, false)
    }

    // count(CASE ...) instead of FILTER, which older Cockroach releases
    // reject.
    fn status_sql(&self, meta: &TableMeta) -> String {
        let lock = quote(&meta.lock_field);
        let now = self.now_expr();
        let ready = self.ready_expr();
        format!(
            "SELECT count(*), \
             count(CASE WHEN {lock} < 0 THEN 1 END), \
             count(CASE WHEN {lock} BETWEEN 0 AND {ready} THEN 1 END), \
             count(CASE WHEN {lock} > {ready} AND {lock} < {now} - {STALE_WINDOW_MS} THEN 1 END), \
             count(CASE WHEN {lock} >= {now} - {STALE_WINDOW_MS} AND {lock} < {now} THEN 1 END), \
             count(CASE WHEN {lock} >= {now} THEN 1 END) \
             FROM {table}",
            table = self.table_name(meta),
        )
    }
}

fn reserve_sql(dialect: &dyn Dialect, meta: &TableMeta, skip_locked: bool) -> String {
    let lock = quote(&meta.lock_field);
    let run_if = match &meta.run_if {
        Some(predicate) => format!(" AND ({predicate})"),
        None => String::new(),
    };
    format!(
        "UPDATE {table} SET {lock} = {now} + $1 \
         WHERE ({pks}) IN (\
         SELECT {pks} FROM {table} \
         WHERE {lock} BETWEEN 0 AND {ready}{run_if} \
         ORDER BY {lock}, {pks} LIMIT 1{locking}) \
         RETURNING {pks}, {private}",
        table = dialect.table_name(meta),
        now = dialect.now_expr(),
        pks = pk_list(meta, None),
        ready = dialect.ready_expr(),
        locking = if skip_locked {
            " FOR UPDATE SKIP LOCKED"
        } else {
            ""
        },
        private = quote(&meta.private_field),
    )
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn pk_list(meta: &TableMeta, alias: Option<&str>) -> String {
    meta.primary_key
        .iter()
        .map(|f| match alias {
            Some(a) => format!("{a}.{}", quote(f)),
            None => quote(f),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn pk_where(meta: &TableMeta, first_param: usize, alias: Option<&str>) -> String {
    meta.primary_key
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let column = match alias {
                Some(a) => format!("{a}.{}", quote(f)),
                None => quote(f),
            };
            format!("{column} = ${}", first_param + i)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn pk_join(meta: &TableMeta, left: &str, right: &str) -> String {
    meta.primary_key
        .iter()
        .map(|f| format!("{left}.{q} = {right}.{q}", q = quote(f)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn meta() -> TableMeta {
        TableMeta {
            table: "photos".into(),
            schema_prefix: None,
            primary_key: vec!["id".into()],
            lock_field: "honeydew_photos_lock".into(),
            private_field: "honeydew_photos_private".into(),
            run_if: None,
        }
    }

    fn compound_meta() -> TableMeta {
        TableMeta {
            primary_key: vec!["tenant".into(), "id".into()],
            ..meta()
        }
    }

    #[test]
    fn reserve_is_one_atomic_update() {
        let sql = Postgres.reserve_sql(&meta());
        assert!(sql.starts_with("UPDATE \"photos\" SET \"honeydew_photos_lock\""));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("LIMIT 1"));
        assert!(sql.contains("RETURNING \"id\", \"honeydew_photos_private\""));
        // One statement, no transaction plumbing.
        assert!(!sql.contains(';'));
        assert_eq!(sql.matches("UPDATE \"photos\" SET").count(), 1);
    }

    #[test]
    fn reserve_orders_by_lock_then_primary_key() {
        let sql = Postgres.reserve_sql(&compound_meta());
        assert!(sql.contains("ORDER BY \"honeydew_photos_lock\", \"tenant\", \"id\" LIMIT 1"));
    }

    #[test]
    fn cockroach_reserve_has_no_row_locking_clause() {
        let sql = CockroachDb.reserve_sql(&meta());
        assert!(!sql.contains("FOR UPDATE"));
        assert!(sql.starts_with("UPDATE"));
        assert!(sql.contains("LIMIT 1"));
    }

    #[test]
    fn reserve_folds_in_the_run_if_predicate() {
        let with_run_if = TableMeta {
            run_if: Some("\"should_run\" = true".into()),
            ..meta()
        };
        let sql = Postgres.reserve_sql(&with_run_if);
        assert!(sql.contains("AND (\"should_run\" = true)"));
    }

    #[test]
    fn delay_ready_parameter_order_is_delay_blob_then_keys() {
        let sql = Postgres.delay_ready_sql(&compound_meta());
        assert!(sql.contains("($1 * 1000)"));
        assert!(sql.contains("\"honeydew_photos_private\" = $2"));
        assert!(sql.contains("\"tenant\" = $3 AND \"id\" = $4"));
    }

    #[test]
    fn cancel_returns_the_previous_lock_value() {
        let sql = Postgres.cancel_sql(&meta());
        assert!(sql.contains("FROM \"photos\" AS prev"));
        assert!(sql.contains("prev.\"id\" = t.\"id\""));
        assert!(sql.ends_with("RETURNING prev.\"honeydew_photos_lock\""));
        // In-progress and terminal rows must be left untouched.
        assert!(sql.contains("CASE WHEN t.\"honeydew_photos_lock\" >= 0"));
    }

    #[rstest]
    #[case::finish(Postgres.finish_sql(&meta()), "NULL")]
    #[case::abandon(Postgres.abandon_sql(&meta()), "-1")]
    fn finalize_clears_the_private_column(#[case] sql: String, #[case] lock_value: &str) {
        assert!(sql.contains(&format!("\"honeydew_photos_lock\" = {lock_value}")));
        assert!(sql.contains("\"honeydew_photos_private\" = NULL"));
        assert!(sql.contains("\"id\" = $1"));
    }

    #[test]
    fn status_counts_every_range() {
        let sql = Postgres.status_sql(&meta());
        assert_eq!(sql.matches("FILTER").count(), 5);
        assert!(sql.starts_with("SELECT count(*)"));

        let crdb = CockroachDb.status_sql(&meta());
        assert!(!crdb.contains("FILTER"));
        assert_eq!(crdb.matches("CASE WHEN").count(), 5);
    }

    #[test]
    fn reset_stale_targets_only_the_stale_range() {
        let sql = Postgres.reset_stale_sql(&meta());
        assert!(sql.contains(&format!("- {STALE_WINDOW_MS}")));
        assert!(sql.contains("\"honeydew_photos_private\" = NULL"));
        assert!(!sql.contains('$'), "reset_stale takes no parameters");
    }

    #[test]
    fn filter_selects_abandoned_primary_keys() {
        let sql = Postgres.filter_sql(&compound_meta(), FilterSelector::Abandoned);
        assert_eq!(
            sql,
            "SELECT \"tenant\", \"id\" FROM \"photos\" WHERE \"honeydew_photos_lock\" < 0 \
             ORDER BY \"tenant\", \"id\""
        );
    }

    #[test]
    fn table_name_honors_the_schema_prefix() {
        let prefixed = TableMeta {
            schema_prefix: Some("tenant_a".into()),
            ..meta()
        };
        assert_eq!(Postgres.table_name(&prefixed), "\"tenant_a\".\"photos\"");
        assert_eq!(Postgres.table_name(&meta()), "\"photos\"");
    }

    #[test]
    fn lock_column_type_is_a_signed_bigint() {
        assert_eq!(Postgres.integer_type(), "bigint");
        assert_eq!(CockroachDb.integer_type(), "bigint");
    }
}
