//! Embedded-file dialects: SQLite and DuckDB.
//!
//! Neither engine ships a built-in MD5, so `md5_u64_expr` stays `None` and
//! the driver computes segment checksums client-side from the canonical
//! projection — same hash, same representations, one round trip.

use super::{ansi_columns_with_pk_sql, ansi_list_tables_sql, Dialect};
use crate::descriptor::DialectKind;
use crate::types::Canonical;

pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn text_type(&self) -> &'static str {
        "TEXT"
    }

    /// SQLite has no schema namespace.
    fn qualified_name(&self, _namespace: Option<&str>, table: &str) -> String {
        self.quote_ident(table)
    }

    fn canonical_expr(&self, canon: &Canonical, col: &str, case_insensitive: bool) -> String {
        match canon {
            // Type affinity: DECIMAL(38,s) casts are ignored, so render the
            // bare text; value semantics rescale client-side.
            Canonical::Decimal { .. } => self.cast_to_text(col),
            Canonical::Boolean => {
                format!("(CASE WHEN {col} = 0 THEN '0' WHEN {col} <> 0 THEN '1' END)")
            }
            _ => default_canonical_expr(self, canon, col, case_insensitive),
        }
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let pad = 10_i64.pow(6 - p);
        // julianday handles both ISO text and numeric epoch storage.
        format!(
            "(CAST(ROUND((julianday({col}) - 2440587.5) * 86400000000.0 / {pad}) AS INTEGER) * {pad})"
        )
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        format!("({a} IS {b})")
    }

    fn supports_full_join(&self) -> bool {
        false
    }

    fn introspect_columns_sql(&self, _namespace: Option<&str>, table: &str) -> String {
        format!(
            "SELECT name, type, \
               CASE \"notnull\" WHEN 0 THEN 'YES' ELSE 'NO' END AS is_nullable, \
               CASE WHEN pk > 0 THEN 1 ELSE 0 END AS is_key \
             FROM pragma_table_info({}) ORDER BY cid",
            self.string_literal(table)
        )
    }

    fn list_tables_sql(&self, _namespace: Option<&str>) -> String {
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name"
            .to_string()
    }
}

/// DuckDB renders like PostgreSQL but, like SQLite, checksums client-side.
pub struct DuckdbDialect;

impl Dialect for DuckdbDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Duckdb
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("main".to_string())
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        ansi_columns_with_pk_sql(self, namespace.unwrap_or("main"), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("main"))
    }
}

/// Re-dispatch to the trait's default `canonical_expr` body. Rust default
/// methods cannot be called once overridden, so the shared arm lives here.
fn default_canonical_expr(
    d: &dyn Dialect,
    canon: &Canonical,
    col: &str,
    case_insensitive: bool,
) -> String {
    match canon {
        Canonical::Integer { .. } => d.cast_to_text(col),
        Canonical::Float { .. } => d.float_text_expr(col),
        Canonical::Timestamp { precision, .. } => {
            d.cast_to_text(&d.timestamp_micros_expr(col, *precision))
        }
        Canonical::Date => d.cast_to_text(col),
        Canonical::Uuid => format!("LOWER({})", d.cast_to_text(col)),
        Canonical::Text { .. } if case_insensitive => format!("LOWER({})", d.cast_to_text(col)),
        _ => d.cast_to_text(col),
    }
}
