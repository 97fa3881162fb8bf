//! Warehouse and lakehouse dialects: Trino, Presto, ClickHouse, Snowflake,
//! BigQuery, Databricks, ClickZetta.
//!
//! Trino, Presto, and ClickHouse are reachable over their plain HTTP SQL
//! protocols when the `http-engines` feature is on; the rest render SQL
//! and normalise types but carry no bundled transport.

use super::{ansi_columns_sql, ansi_list_tables_sql, Dialect};
use crate::descriptor::DialectKind;
use crate::types::{self, Canonical};

// ── Trino / Presto ─────────────────────────────────────────────────────────

pub struct TrinoDialect;

impl Dialect for TrinoDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Trino
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let unit = 10_i64.pow(p);
        let pad = 10_i64.pow(6 - p);
        format!("(CAST(FLOOR(to_unixtime({col}) * {unit}) AS BIGINT) * {pad})")
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "from_big_endian_64(substr(md5(to_utf8({expr})), 1, 8))"
        ))
    }

    fn xor_expr(&self, a: &str, b: &str) -> String {
        format!("bitwise_xor({a}, {b})")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        ansi_columns_sql(self, namespace.unwrap_or("default"), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("default"))
    }
}

pub struct PrestoDialect;

impl Dialect for PrestoDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Presto
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        TrinoDialect.timestamp_micros_expr(col, precision)
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        TrinoDialect.md5_u64_expr(expr)
    }

    fn xor_expr(&self, a: &str, b: &str) -> String {
        TrinoDialect.xor_expr(a, b)
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        TrinoDialect.introspect_columns_sql(namespace, table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        TrinoDialect.list_tables_sql(namespace)
    }
}

// ── ClickHouse ─────────────────────────────────────────────────────────────

pub struct ClickhouseDialect;

impl Dialect for ClickhouseDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Clickhouse
    }

    fn text_type(&self) -> &'static str {
        "String"
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("`{}`", s.replace('`', "``"))
    }

    fn default_namespace(&self, database: Option<&str>) -> Option<String> {
        database.map(str::to_string)
    }

    /// Strip `Nullable(…)` / `LowCardinality(…)` wrappers and map the
    /// width-suffixed type names (`Int8` here means eight bits, unlike
    /// PostgreSQL's `int8`).
    fn normalise_type(&self, raw: &str) -> Canonical {
        let mut t = raw.trim();
        for wrapper in ["Nullable(", "LowCardinality("] {
            if let Some(inner) = t.strip_prefix(wrapper) {
                t = inner.trim_end_matches(')');
            }
        }
        let lowered = t.to_ascii_lowercase();
        let (base, args) = match lowered.split_once('(') {
            Some((b, rest)) => (b.trim().to_string(), Some(rest.trim_end_matches(')'))),
            None => (lowered.clone(), None),
        };
        match base.as_str() {
            "int8" => Canonical::Integer { bits: 8, signed: true },
            "int16" => Canonical::Integer { bits: 16, signed: true },
            "int32" => Canonical::Integer { bits: 32, signed: true },
            "int64" => Canonical::Integer { bits: 64, signed: true },
            "uint8" => Canonical::Integer { bits: 8, signed: false },
            "uint16" => Canonical::Integer { bits: 16, signed: false },
            "uint32" => Canonical::Integer { bits: 32, signed: false },
            "uint64" => Canonical::Integer { bits: 64, signed: false },
            "float32" => Canonical::Float { bits: 32 },
            "float64" => Canonical::Float { bits: 64 },
            "string" | "fixedstring" => Canonical::Text { max_len: None },
            "datetime" => Canonical::Timestamp { precision: 0, tz_aware: false },
            "datetime64" => Canonical::Timestamp {
                precision: args
                    .and_then(|a| a.split(',').next())
                    .and_then(|p| p.trim().parse().ok())
                    .unwrap_or(3),
                tz_aware: args.is_some_and(|a| a.contains('\'')),
            },
            _ => types::normalise(t),
        }
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let unit = 10_i64.pow(p);
        let pad = 10_i64.pow(6 - p);
        format!("(toInt64(floor(toUnixTimestamp({col}) * {unit})) * {pad})")
    }

    /// `halfMD5` is exactly the contract hash: first eight bytes of the
    /// MD5 digest, big-endian.
    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!("halfMD5({expr})"))
    }

    fn xor_expr(&self, a: &str, b: &str) -> String {
        format!("bitXor({a}, {b})")
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        format!("(({a} = {b}) OR ({a} IS NULL AND {b} IS NULL))")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        format!(
            "SELECT name, type, \
               CASE WHEN type LIKE 'Nullable(%' THEN 'YES' ELSE 'NO' END AS is_nullable, \
               CASE WHEN is_in_primary_key THEN 1 ELSE 0 END AS is_key \
             FROM system.columns \
             WHERE database = {} AND table = {} ORDER BY position",
            self.string_literal(namespace.unwrap_or("default")),
            self.string_literal(table)
        )
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        format!(
            "SELECT name FROM system.tables WHERE database = {} ORDER BY name",
            self.string_literal(namespace.unwrap_or("default"))
        )
    }

    fn table_estimate_sql(&self, namespace: Option<&str>, table: &str) -> Option<String> {
        Some(format!(
            "SELECT CAST(total_rows AS String) FROM system.tables \
             WHERE database = {} AND name = {}",
            self.string_literal(namespace.unwrap_or("default")),
            self.string_literal(table)
        ))
    }
}

// ── Snowflake ──────────────────────────────────────────────────────────────

pub struct SnowflakeDialect;

impl Dialect for SnowflakeDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Snowflake
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("PUBLIC".to_string())
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let pad = 10_i64.pow(6 - p);
        format!("(FLOOR(DATE_PART(EPOCH_MICROSECOND, {col}) / {pad}) * {pad})")
    }

    /// Upper 64 bits of the MD5 digest = first eight bytes, big-endian.
    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!("MD5_NUMBER_UPPER64({expr})"))
    }

    fn xor_expr(&self, a: &str, b: &str) -> String {
        format!("BITXOR({a}, {b})")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        ansi_columns_sql(self, namespace.unwrap_or("PUBLIC"), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("PUBLIC"))
    }
}

// ── BigQuery ───────────────────────────────────────────────────────────────

pub struct BigqueryDialect;

impl Dialect for BigqueryDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Bigquery
    }

    fn text_type(&self) -> &'static str {
        "STRING"
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("`{}`", s.replace('`', "``"))
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let pad = 10_i64.pow(6 - p);
        format!("(DIV(UNIX_MICROS({col}), {pad}) * {pad})")
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "CAST(CONCAT('0x', SUBSTR(TO_HEX(MD5({expr})), 1, 16)) AS INT64)"
        ))
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        format!("(({a} = {b}) OR ({a} IS NULL AND {b} IS NULL))")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        // BigQuery types arrive fully spelled ("NUMERIC(18, 4)"); no
        // assembly needed.
        format!(
            "SELECT column_name, data_type, is_nullable, 0 AS is_key \
             FROM {}.INFORMATION_SCHEMA.COLUMNS \
             WHERE table_name = {} ORDER BY ordinal_position",
            self.quote_ident(namespace.unwrap_or("")),
            self.string_literal(table)
        )
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        format!(
            "SELECT table_name FROM {}.INFORMATION_SCHEMA.TABLES ORDER BY table_name",
            self.quote_ident(namespace.unwrap_or(""))
        )
    }
}

// ── Databricks / ClickZetta ────────────────────────────────────────────────

pub struct DatabricksDialect;

impl Dialect for DatabricksDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Databricks
    }

    fn text_type(&self) -> &'static str {
        "STRING"
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("`{}`", s.replace('`', "``"))
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("default".to_string())
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let pad = 10_i64.pow(6 - p);
        format!("(CAST(FLOOR(unix_micros({col}) / {pad}) AS BIGINT) * {pad})")
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "CAST(CONV(SUBSTRING(MD5({expr}), 1, 16), 16, 10) AS BIGINT)"
        ))
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        format!("({a} <=> {b})")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        ansi_columns_sql(self, namespace.unwrap_or("default"), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("default"))
    }
}

pub struct ClickzettaDialect;

impl Dialect for ClickzettaDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Clickzetta
    }

    fn text_type(&self) -> &'static str {
        "STRING"
    }

    fn quote_ident(&self, s: &str) -> String {
        DatabricksDialect.quote_ident(s)
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("public".to_string())
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        DatabricksDialect.timestamp_micros_expr(col, precision)
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        DatabricksDialect.md5_u64_expr(expr)
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        DatabricksDialect.null_safe_eq(a, b)
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        ansi_columns_sql(self, namespace.unwrap_or("public"), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("public"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trino_hash_from_big_endian() {
        let e = TrinoDialect.md5_u64_expr("\"c\"").unwrap();
        assert_eq!(e, "from_big_endian_64(substr(md5(to_utf8(\"c\")), 1, 8))");
    }

    #[test]
    fn test_clickhouse_half_md5() {
        assert_eq!(ClickhouseDialect.md5_u64_expr("x").unwrap(), "halfMD5(x)");
    }

    #[test]
    fn test_clickhouse_type_widths() {
        let d = ClickhouseDialect;
        assert_eq!(
            d.normalise_type("Int8"),
            Canonical::Integer { bits: 8, signed: true }
        );
        assert_eq!(
            d.normalise_type("UInt64"),
            Canonical::Integer { bits: 64, signed: false }
        );
        assert_eq!(
            d.normalise_type("Nullable(Int32)"),
            Canonical::Integer { bits: 32, signed: true }
        );
        assert_eq!(
            d.normalise_type("LowCardinality(String)"),
            Canonical::Text { max_len: None }
        );
        assert_eq!(
            d.normalise_type("DateTime64(3)"),
            Canonical::Timestamp { precision: 3, tz_aware: false }
        );
        assert_eq!(d.normalise_type("Float64"), Canonical::Float { bits: 64 });
    }

    #[test]
    fn test_snowflake_upper64() {
        assert_eq!(
            SnowflakeDialect.md5_u64_expr("x").unwrap(),
            "MD5_NUMBER_UPPER64(x)"
        );
    }

    #[test]
    fn test_bigquery_hex_cast() {
        let e = BigqueryDialect.md5_u64_expr("x").unwrap();
        assert!(e.contains("TO_HEX(MD5(x))"), "{e}");
        assert!(e.contains("AS INT64"), "{e}");
    }

    #[test]
    fn test_bigquery_dataset_scoped_introspection() {
        let sql = BigqueryDialect.introspect_columns_sql(Some("analytics"), "events");
        assert!(sql.contains("`analytics`.INFORMATION_SCHEMA.COLUMNS"), "{sql}");
    }

    #[test]
    fn test_databricks_spaceship_eq() {
        assert_eq!(DatabricksDialect.null_safe_eq("a", "b"), "(a <=> b)");
    }

    #[test]
    fn test_presto_mirrors_trino() {
        assert_eq!(
            PrestoDialect.md5_u64_expr("x"),
            TrinoDialect.md5_u64_expr("x")
        );
    }
}
