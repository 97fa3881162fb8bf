//! PostgreSQL-family dialects: PostgreSQL and Redshift.

use super::{ansi_columns_with_pk_sql, ansi_list_tables_sql, Dialect};
use crate::descriptor::DialectKind;

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("public".to_string())
    }

    fn float_text_expr(&self, col: &str) -> String {
        // Matches the client-side canonical float form: 9 significant
        // digits, trailing zeros stripped, two-digit exponent. Zero and
        // NaN get their fixed spellings up front; FM mode leaves a bare
        // decimal point on whole mantissas ("1.e+00") that REPLACE folds
        // away.
        format!(
            "(CASE WHEN {col} = 0 THEN '0' \
                   WHEN {col} <> {col} THEN 'nan' \
                   ELSE REPLACE(to_char({col}::float8, 'FM9.99999999EEEE'), '.e', 'e') END)"
        )
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        Some(format!(
            "(('x' || substring(md5({expr}) from 1 for 16))::bit(64)::bigint)"
        ))
    }

    fn xor_expr(&self, a: &str, b: &str) -> String {
        format!("({a} # {b})")
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        ansi_columns_with_pk_sql(self, namespace.unwrap_or("public"), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("public"))
    }

    fn table_estimate_sql(&self, namespace: Option<&str>, table: &str) -> Option<String> {
        let ns = self.string_literal(namespace.unwrap_or("public"));
        let t = self.string_literal(table);
        Some(format!(
            "SELECT CAST(CAST(c.reltuples AS BIGINT) AS VARCHAR) \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = {ns} AND c.relname = {t} AND c.reltuples >= 0"
        ))
    }
}

/// Redshift speaks the PostgreSQL wire protocol and inherits most of its
/// rendering; the cheap-estimate catalog differs.
pub struct RedshiftDialect;

impl Dialect for RedshiftDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Redshift
    }

    fn default_namespace(&self, _database: Option<&str>) -> Option<String> {
        Some("public".to_string())
    }

    fn float_text_expr(&self, col: &str) -> String {
        PostgresDialect.float_text_expr(col)
    }

    fn md5_u64_expr(&self, expr: &str) -> Option<String> {
        PostgresDialect.md5_u64_expr(expr)
    }

    fn xor_expr(&self, a: &str, b: &str) -> String {
        PostgresDialect.xor_expr(a, b)
    }

    fn introspect_columns_sql(&self, namespace: Option<&str>, table: &str) -> String {
        ansi_columns_with_pk_sql(self, namespace.unwrap_or("public"), table)
    }

    fn list_tables_sql(&self, namespace: Option<&str>) -> String {
        ansi_list_tables_sql(self, namespace.unwrap_or("public"))
    }
}
