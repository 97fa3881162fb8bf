//! Commercial-engine dialects: SQL Server, Oracle, Vertica.
//!
//! Rendering and type normalisation only; none of these carry a bundled
//! transport.

use super::{ansi_list_tables_sql, Dialect};
use crate::descriptor::DialectKind;

pub struct MssqlDialect;

impl Dialect for MssqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Mssql
    }

    fn text_type(&self) -> &'static str {
        "NVARCHAR(MAX)"
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("[{}]", s.replace(']', "]]"))
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("dbo".to_string())
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let pad = 10_i64.pow(6 - p);
        format!(
            "((DATEDIFF_BIG(microsecond, '1970-01-01', {col}) / {pad}) * {pad})"
        )
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "CONVERT(BIGINT, SUBSTRING(HASHBYTES('MD5', {expr}), 1, 8))"
        ))
    }

    fn limit_clause(&self, n: u64) -> String {
        format!("OFFSET 0 ROWS FETCH NEXT {n} ROWS ONLY")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        let ns_lit = self.string_literal(namespace.unwrap_or("dbo"));
        let table_lit = self.string_literal(table);
        format!(
            "SELECT c.column_name, \
               CASE \
                 WHEN c.data_type IN ('numeric', 'decimal') AND c.numeric_precision IS NOT NULL \
                   THEN c.data_type + '(' + CAST(c.numeric_precision AS VARCHAR) + ',' + CAST(COALESCE(c.numeric_scale, 0) AS VARCHAR) + ')' \
                 WHEN c.character_maximum_length IS NOT NULL AND c.character_maximum_length > 0 \
                   THEN c.data_type + '(' + CAST(c.character_maximum_length AS VARCHAR) + ')' \
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

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("dbo"))
    }
}

pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Oracle
    }

    fn text_type(&self) -> &'static str {
        "VARCHAR2(4000)"
    }

    fn timestamp_micros_expr(&self, col: &str, precision: u32) -> String {
        let p = precision.min(6);
        let pad = 10_i64.pow(6 - p);
        format!(
            "(TRUNC((CAST({col} AS DATE) - DATE '1970-01-01') * 86400000000 / {pad}) * {pad})"
        )
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "TO_NUMBER(SUBSTR(STANDARD_HASH({expr}, 'MD5'), 1, 16), 'xxxxxxxxxxxxxxxx')"
        ))
    }

    /// Oracle has BITAND only; a + b − 2·(a AND b) is XOR.
    fn xor_expr(&self, a: &str, b: &str) -> String {
        format!("({a} + {b} - 2 * BITAND({a}, {b}))")
    }

    fn null_safe_eq(&self, a: &str, b: &str) -> String {
        format!("(({a} = {b}) OR ({a} IS NULL AND {b} IS NULL))")
    }

    fn mod_expr(&self, a: &str, b: &str) -> String {
        format!("MOD({a}, {b})")
    }

    fn limit_clause(&self, n: u64) -> String {
        format!("FETCH FIRST {n} ROWS ONLY")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        let owner = self.string_literal(&namespace.unwrap_or("").to_uppercase());
        let table_lit = self.string_literal(table);
        format!(
            "SELECT column_name, \
               CASE \
                 WHEN data_type = 'NUMBER' AND data_precision IS NOT NULL \
                   THEN data_type || '(' || data_precision || ',' || COALESCE(data_scale, 0) || ')' \
                 WHEN char_length > 0 AND data_type LIKE '%CHAR%' \
                   THEN data_type || '(' || char_length || ')' \
                 ELSE data_type \
               END AS type_text, \
               CASE nullable WHEN 'Y' THEN 'YES' ELSE 'NO' END AS is_nullable, \
               0 AS is_key \
             FROM all_tab_columns \
             WHERE owner = {owner} AND table_name = {table_lit} \
             ORDER BY column_id"
        )
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        format!(
            "SELECT table_name FROM all_tables WHERE owner = {} ORDER BY table_name",
            self.string_literal(&namespace.unwrap_or("").to_uppercase())
        )
    }
}

pub struct VerticaDialect;

impl Dialect for VerticaDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Vertica
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("public".to_string())
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "TO_NUMBER(SUBSTR(MD5({expr}), 1, 16), 'xxxxxxxxxxxxxxxx')"
        ))
    }

    fn xor_expr(&self, a: &str, b: &str) -> String {
        format!("({a} # {b})")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        format!(
            "SELECT column_name, data_type, \
               CASE WHEN is_nullable THEN 'YES' ELSE 'NO' END AS is_nullable, \
               0 AS is_key \
             FROM v_catalog.columns \
             WHERE table_schema = {} AND table_name = {} \
             ORDER BY ordinal_position",
            self.string_literal(namespace.unwrap_or("public")),
            self.string_literal(table)
        )
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        format!(
            "SELECT table_name FROM v_catalog.tables \
             WHERE table_schema = {} ORDER BY table_name",
            self.string_literal(namespace.unwrap_or("public"))
        )
    }
}
