//! SQL dialect rendering.
//!
//! A [`Dialect`] turns the engine-neutral comparison plan into the SQL text
//! of one concrete engine: identifier quoting, literal rendering, canonical
//! value expressions, the checksum hash, introspection queries. The
//! interface is pure string manipulation with no transport dependency, so
//! both the sqlx-backed and the HTTP-backed drivers share it.
//!
//! The default methods implement the ANSI-leaning common case; each
//! concrete dialect overrides only what its engine spells differently.
//! User text never reaches an identifier position unquoted and never
//! reaches a value position outside a `string_literal` escape.

mod enterprise;
mod mysql;
mod postgres;
mod sqlite;
mod warehouse;

use serde_json::Value;

use crate::descriptor::DialectKind;
use crate::types::{self, Canonical, NULL_MARKER};

pub use enterprise::{MssqlDialect, OracleDialect, VerticaDialect};
pub use mysql::{MariadbDialect, MysqlDialect};
pub use postgres::{PostgresDialect, RedshiftDialect};
pub use sqlite::{DuckdbDialect, SqliteDialect};
pub use warehouse::{
    BigqueryDialect, ClickhouseDialect, ClickzettaDialect, DatabricksDialect, PrestoDialect,
    SnowflakeDialect, TrinoDialect,
};

/// Rendering surface each engine implements.
pub trait Dialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    /// SQL type name text casts target.
    fn text_type(&self) -> &'static str {
        "VARCHAR"
    }

    /// Quote an identifier (table, column, schema).
    fn quote_ident(&self, s: &str) -> String {
        format!("\"{}\"", s.replace('"', "\"\""))
    }

    /// Render a string literal with dialect-appropriate escaping.
    fn string_literal(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    /// Schema-qualified table reference.
    fn qualified_name(&self, namespace: Option<&str>, table: &str) -> String {
        match namespace {
            Some(ns) => format!("{}.{}", self.quote_ident(ns), self.quote_ident(table)),
            None => self.quote_ident(table),
        }
    }

    /// Map this engine's type text onto the canonical lattice.
    fn normalise_type(&self, raw: &str) -> Canonical {
        types::normalise(raw)
    }

    /// The namespace introspection falls back to when neither the request
    /// nor the descriptor names one. MySQL-family engines treat the
    /// database itself as the namespace; PostgreSQL defaults to `public`.
    fn default_namespace(&self, database: Option<&str>) -> Option<String> {
        let _ = database;
        None
    }

    // ── Expression primitives ────────────────────────────────────────────

    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS {})", self.text_type())
    }

    /// Date literal usable in a comparison against a date column.
    fn date_literal(&self, iso: &str) -> String {
        self.string_literal(iso)
    }

    /// Expression producing epoch microseconds (bigint) at the given
    /// fractional-second precision for a timestamp column.
    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let unit = 10_i64.pow(p);
        let pad = 10_i64.pow(6 - p);
        format!("(CAST(FLOOR(EXTRACT(EPOCH FROM {col}) * {unit}) AS BIGINT) * {pad})")
    }

    /// Canonical float text. Engines differ in native float formatting;
    /// cross-family checksum mismatches on float columns cost extra
    /// bisection round trips, never correctness (leaves compare values).
    fn float_text_expr(&self, col: &str) -> String {
        self.cast_to_text(col)
    }

    /// Canonical boolean text: `'1'` / `'0'`, NULL passed through.
    fn bool_text_expr(&self, col: &str) -> String {
        format!("(CASE WHEN {col} THEN '1' WHEN NOT {col} THEN '0' END)")
    }

    /// Canonical-repr text expression for one column. Must agree
    /// byte-for-byte with `types::canonical_repr` on the same value.
    fn canonical_expr(&self, canon: &Canonical, col: &str, case_insensitive: bool) -> String {
        match canon {
            Canonical::Integer { .. } => self.cast_to_text(col),
            Canonical::Decimal { scale, .. } => {
                self.cast_to_text(&format!("CAST({col} AS DECIMAL(38,{scale}))"))
            }
            Canonical::Float { .. } => self.float_text_expr(col),
            Canonical::Boolean => self.bool_text_expr(col),
            Canonical::Timestamp { precision, .. } => {
                self.cast_to_text(&self.timestamp_micros_expr(col, *precision))
            }
            Canonical::Date => self.cast_to_text(col),
            Canonical::Uuid => format!("LOWER({})", self.cast_to_text(col)),
            Canonical::Text { .. } if case_insensitive => {
                format!("LOWER({})", self.cast_to_text(col))
            }
            Canonical::Text { .. } => self.cast_to_text(col),
            // Opaque types are excluded from comparison; text cast keeps
            // extra-column reporting working.
            _ => self.cast_to_text(col),
        }
    }

    /// Expression in an engine-orderable type, used for segment bounds and
    /// pivot sampling. Must order the same way `types::compare_values`
    /// orders the decoded values.
    fn order_expr(&self, canon: &Canonical, col: &str) -> String {
        match canon {
            Canonical::Timestamp { precision, .. } => {
                self.timestamp_micros_expr(col, *precision)
            }
            _ => col.to_string(),
        }
    }

    /// Literal for a decoded key value, typed for comparison against
    /// `order_expr` of the same canonical type.
    fn literal(&self, canon: &Canonical, value: &Value) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        match canon {
            Canonical::Integer { .. } | Canonical::Float { .. } | Canonical::Timestamp { .. } => {
                numeric_literal(value)
                    .unwrap_or_else(|| self.string_literal(&json_text(value)))
            }
            Canonical::Decimal { .. } => numeric_literal(value)
                .unwrap_or_else(|| self.string_literal(&json_text(value))),
            Canonical::Boolean => match value {
                Value::Bool(true) => "TRUE".to_string(),
                Value::Bool(false) => "FALSE".to_string(),
                other => numeric_literal(other)
                    .unwrap_or_else(|| self.string_literal(&json_text(other))),
            },
            Canonical::Date => self.date_literal(&json_text(value)),
            _ => self.string_literal(&json_text(value)),
        }
    }

    // ── Checksum rendering ───────────────────────────────────────────────

    /// Lower-64-bit MD5 expression over a text argument, or `None` when
    /// the engine has no server-side MD5 (the driver then computes segment
    /// checksums client-side).
    fn md5_u64_expr(&self, _expr: &str) -> Option<String> {
        None
    }

    /// Bitwise XOR of two 64-bit integer expressions.
    fn xor_expr(&self, a: &str, b: &str) -> String {
        format!("({a} ^ {b})")
    }

    // ── Join / predicate helpers ─────────────────────────────────────────

    /// NULL-safe equality between two expressions.
    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        format!("({a} IS NOT DISTINCT FROM {b})")
    }

    fn supports_full_join(&self) -> bool {
        true
    }

    fn mod_expr(&self, a: &str, b: &str) -> String {
        format!("({a} % {b})")
    }

    fn limit_clause(&self, n: u64) -> String {
        format!("LIMIT {n}")
    }

    // ── Catalog queries ──────────────────────────────────────────────────

    /// Columns of one table: `(column_name, type_text, is_nullable
    /// 'YES'/'NO', is_key 0/1)` in ordinal order.
    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String;

    /// Sorted table names of one namespace.
    fn list_tables_sql(&self, namespace: Option<&str>) -> String;

    /// Cheap whole-table cardinality estimate, when the engine keeps one.
    fn table_estimate_sql(&self, _namespace: Option<&str>, _table: &str) -> Option<String> {
        None
    }
}

/// Resolve a dialect implementation from its kind.
pub fn from_kind(kind: DialectKind) -> Box<dyn Dialect> {
    match kind {
        DialectKind::Postgres => Box::new(PostgresDialect),
        DialectKind::Redshift => Box::new(RedshiftDialect),
        DialectKind::Mysql => Box::new(MysqlDialect),
        DialectKind::Mariadb => Box::new(MariadbDialect),
        DialectKind::Sqlite => Box::new(SqliteDialect),
        DialectKind::Duckdb => Box::new(DuckdbDialect),
        DialectKind::Trino => Box::new(TrinoDialect),
        DialectKind::Presto => Box::new(PrestoDialect),
        DialectKind::Clickhouse => Box::new(ClickhouseDialect),
        DialectKind::Snowflake => Box::new(SnowflakeDialect),
        DialectKind::Bigquery => Box::new(BigqueryDialect),
        DialectKind::Databricks => Box::new(DatabricksDialect),
        DialectKind::Mssql => Box::new(MssqlDialect),
        DialectKind::Oracle => Box::new(OracleDialect),
        DialectKind::Vertica => Box::new(VerticaDialect),
        DialectKind::Clickzetta => Box::new(ClickzettaDialect),
    }
}

/// Compose the per-row checksum expression: XOR over
/// `H(COALESCE(canonical_expr(col), '<null>'))` for each compared column.
///
/// `None` when the engine cannot hash server-side.
pub fn checksum_row_expr(
    dialect: &dyn Dialect,
    columns: &[(String, Canonical)],
    case_insensitive: bool,
) -> Option<String> {
    let mut hashed = Vec::with_capacity(columns.len());
    for (quoted, canon) in columns {
        let canon_expr = dialect.canonical_expr(canon, quoted, case_insensitive);
        let guarded = format!(
            "COALESCE({canon_expr}, {})",
            dialect.string_literal(NULL_MARKER)
        );
        hashed.push(dialect.md5_u64_expr(&guarded)?);
    }
    hashed.into_iter().reduce(|a, b| dialect.xor_expr(&a, &b))
}

/// Comma-separated list of quoted column references.
pub fn col_list(dialect: &dyn Dialect, cols: &[String]) -> String {
    cols.iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// ANSI `information_schema.columns` introspection with a primary-key
/// left join, for engines that expose `table_constraints` (the PostgreSQL
/// and MySQL families). Type text is assembled with `||` concatenation;
/// MySQL overrides with `CONCAT`.
pub(crate) fn ansi_columns_with_pk_sql(d: &dyn Dialect, ns: &str, table: &str) -> String {
    let ns_lit = d.string_literal(ns);
    let table_lit = d.string_literal(table);
    format!(
        "SELECT c.column_name, \
           CASE \
             WHEN c.data_type IN ('numeric', 'decimal') AND c.numeric_precision IS NOT NULL \
               THEN c.data_type || '(' || c.numeric_precision || ',' || COALESCE(c.numeric_scale, 0) || ')' \
             WHEN c.character_maximum_length IS NOT NULL \
               THEN c.data_type || '(' || c.character_maximum_length || ')' \
             WHEN c.datetime_precision IS NOT NULL AND c.data_type LIKE 'timestamp%' \
               THEN c.data_type || '(' || c.datetime_precision || ')' \
             ELSE c.data_type \
           END AS type_text, \
           c.is_nullable, \
           CASE WHEN k.column_name IS NOT NULL THEN 1 ELSE 0 END AS is_key \
         FROM information_schema.columns c \
         LEFT JOIN ( \
           SELECT kcu.column_name \
           FROM information_schema.table_constraints tc \
           JOIN information_schema.key_column_usage kcu \
             ON kcu.constraint_name = tc.constraint_name \
            AND kcu.table_schema = tc.table_schema \
            AND kcu.table_name = tc.table_name \
           WHERE tc.constraint_type = 'PRIMARY KEY' \
             AND tc.table_schema = {ns_lit} AND tc.table_name = {table_lit} \
         ) k ON k.column_name = c.column_name \
         WHERE c.table_schema = {ns_lit} AND c.table_name = {table_lit} \
         ORDER BY c.ordinal_position"
    )
}

/// Plain `information_schema.columns` introspection for engines without
/// `table_constraints` (warehouse engines). No key hint.
pub(crate) fn ansi_columns_sql(d: &dyn Dialect, ns: &str, table: &str) -> String {
    let ns_lit = d.string_literal(ns);
    let table_lit = d.string_literal(table);
    format!(
        "SELECT column_name, data_type, is_nullable, 0 AS is_key \
         FROM information_schema.columns \
         WHERE table_schema = {ns_lit} AND table_name = {table_lit} \
         ORDER BY ordinal_position"
    )
}

/// ANSI table listing for one namespace.
pub(crate) fn ansi_list_tables_sql(d: &dyn Dialect, ns: &str) -> String {
    format!(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = {} ORDER BY table_name",
        d.string_literal(ns)
    )
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a JSON number (or numeric string) as a bare SQL numeric literal,
/// refusing anything that is not plainly numeric.
fn numeric_literal(value: &Value) -> Option<String> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    let ok = !text.is_empty()
        && text.bytes().all(|b| {
            b.is_ascii_digit() || b == b'.' || b == b'-' || b == b'+' || b == b'e' || b == b'E'
        });
    if ok { Some(text) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DialectKind;
    use serde_json::json;

    #[test]
    fn test_factory_covers_every_dialect() {
        for kind in DialectKind::all() {
            assert_eq!(from_kind(*kind).kind(), *kind);
        }
    }

    #[test]
    fn test_default_quote_ident() {
        let d = PostgresDialect;
        assert_eq!(d.quote_ident("name"), "\"name\"");
        assert_eq!(d.quote_ident("col\"name"), "\"col\"\"name\"");
    }

    #[test]
    fn test_string_literal_escaping() {
        let d = PostgresDialect;
        assert_eq!(d.string_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_qualified_name() {
        let d = PostgresDialect;
        assert_eq!(d.qualified_name(Some("public"), "users"), "\"public\".\"users\"");
        assert_eq!(d.qualified_name(None, "users"), "\"users\"");
    }

    #[test]
    fn test_checksum_row_expr_xors_all_columns() {
        let d = PostgresDialect;
        let cols = vec![
            ("\"id\"".to_string(), types::normalise("bigint")),
            ("\"name\"".to_string(), types::normalise("text")),
        ];
        let expr = checksum_row_expr(&d, &cols, false).unwrap();
        assert!(expr.contains("md5"), "{expr}");
        assert!(expr.contains('#'), "{expr}");
        assert!(expr.contains("'<null>'"), "{expr}");
    }

    #[test]
    fn test_checksum_row_expr_none_without_server_md5() {
        let d = SqliteDialect;
        let cols = vec![("\"id\"".to_string(), types::normalise("integer"))];
        assert!(checksum_row_expr(&d, &cols, false).is_none());
    }

    #[test]
    fn test_numeric_literal_guards_injection() {
        assert_eq!(numeric_literal(&json!(42)), Some("42".to_string()));
        assert_eq!(numeric_literal(&json!("1.5")), Some("1.5".to_string()));
        assert_eq!(numeric_literal(&json!("1; DROP TABLE x")), None);
    }

    #[test]
    fn test_literal_rejects_non_numeric_for_numeric_types() {
        let d = PostgresDialect;
        let c = types::normalise("bigint");
        // Falls back to a quoted literal rather than splicing raw text.
        assert_eq!(d.literal(&c, &json!("1; DROP")), "'1; DROP'");
        assert_eq!(d.literal(&c, &json!(7)), "7");
        assert_eq!(d.literal(&c, &Value::Null), "NULL");
    }

    #[test]
    fn test_col_list() {
        let d = PostgresDialect;
        let cols = vec!["id".to_string(), "name".to_string()];
        assert_eq!(col_list(&d, &cols), "\"id\", \"name\"");
    }
}
