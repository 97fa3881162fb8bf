//! MySQL-family dialects: MySQL and MariaDB.
//!
//! Backtick identifiers, backslash-significant string literals, `CONCAT`
//! instead of `||`, `<=>` null-safe equality, and no FULL OUTER JOIN.

use super::Dialect;
use crate::descriptor::DialectKind;

pub struct MysqlDialect;

impl MysqlDialect {
    fn columns_sql(d: &dyn Dialect, ns: &str, table: &str) -> String {
        let ns_lit = d.string_literal(ns);
        let table_lit = d.string_literal(table);
        format!(
            "SELECT c.column_name, \
               CASE \
                 WHEN c.data_type IN ('decimal', 'numeric') \
                   THEN CONCAT(c.data_type, '(', c.numeric_precision, ',', COALESCE(c.numeric_scale, 0), ')') \
                 WHEN c.character_maximum_length IS NOT NULL \
                   THEN CONCAT(c.data_type, '(', c.character_maximum_length, ')') \
                 WHEN c.datetime_precision IS NOT NULL AND c.data_type IN ('datetime', 'timestamp') \
                   THEN CONCAT(c.data_type, '(', c.datetime_precision, ')') \
                 ELSE c.data_type \
               END AS type_text, \
               c.is_nullable, \
               CASE WHEN c.column_key = 'PRI' THEN 1 ELSE 0 END AS is_key \
             FROM information_schema.columns c \
             WHERE c.table_schema = {ns_lit} AND c.table_name = {table_lit} \
             ORDER BY c.ordinal_position"
        )
    }
}

impl Dialect for MysqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Mysql
    }

    fn text_type(&self) -> &'static str {
        "CHAR"
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("`{}`", s.replace('`', "``"))
    }

    fn string_literal(&self, s: &str) -> String {
        // Backslash is an escape character unless NO_BACKSLASH_ESCAPES is
        // set; double it so literals survive either mode's reader.
        format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    }

    /// The database doubles as the namespace.
    fn default_namespace(&self, database: Option<&str>) -> Option<String> {
        database.map(str::to_string)
    }

    fn bool_text_expr(&self, col: &str) -> String {
        // Booleans are tinyint(1); any non-zero value is true.
        format!("(CASE WHEN {col} = 0 THEN '0' WHEN {col} <> 0 THEN '1' END)")
    }

    /// Relies on the driver pinning the session to UTC
    /// (`SET time_zone = '+00:00'`) so `UNIX_TIMESTAMP` is absolute.
    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let unit = 10_i64.pow(p);
        let pad = 10_i64.pow(6 - p);
        format!("(CAST(FLOOR(UNIX_TIMESTAMP({col}) * {unit}) AS SIGNED) * {pad})")
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "CAST(CONV(SUBSTRING(MD5({expr}), 1, 16), 16, 10) AS SIGNED)"
        ))
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        format!("({a} <=> {b})")
    }

    fn supports_full_join(&self) -> bool {
        false
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        Self::columns_sql(self, namespace.unwrap_or(""), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = {} ORDER BY table_name",
            self.string_literal(namespace.unwrap_or(""))
        )
    }

    fn table_estimate_sql(&self, namespace: Option<&str>, table: &str) -> Option<String> {
        Some(format!(
            "SELECT CAST(table_rows AS CHAR) FROM information_schema.tables \
             WHERE table_schema = {} AND table_name = {}",
            self.string_literal(namespace.unwrap_or("")),
            self.string_literal(table)
        ))
    }
}

// MariaDB shares MySQL's wire protocol and rendering.
pub struct MariadbDialect;

impl Dialect for MariadbDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Mariadb
    }

    fn text_type(&self) -> &'static str {
        MysqlDialect.text_type()
    }

    fn quote_ident(&self, s: &str) -> String {
        MysqlDialect.quote_ident(s)
    }

    fn string_literal(&self, s: &str) -> String {
        MysqlDialect.string_literal(s)
    }

    fn default_namespace(&self, database: Option<&str>) -> Option<String> {
        MysqlDialect.default_namespace(database)
    }

    fn bool_text_expr(&self, col: &str) -> String {
        MysqlDialect.bool_text_expr(col)
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        MysqlDialect.timestamp_micros_expr(col, precision)
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        MysqlDialect.md5_u64_expr(expr)
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        MysqlDialect.null_safe_eq(a, b)
    }

    fn supports_full_join(&self) -> bool {
        false
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        MysqlDialect.introspect_columns_sql(namespace, table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        MysqlDialect.list_tables_sql(namespace)
    }

    fn table_estimate_sql(&self, namespace: Option<&str>, table: &str) -> Option<String> {
        MysqlDialect.table_estimate_sql(namespace, table)
    }
}
