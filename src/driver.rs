//! Database drivers.
//!
//! [`Driver`] is the uniform capability surface over every dialect:
//! catalog introspection, typed query execution, segment checksums, key
//! sampling, and row fetch. The trait's provided methods assemble SQL from
//! the dialect layer and parse results; concrete drivers implement only
//! the transport (`query`) and lifecycle.
//!
//! Two transports are bundled:
//! - [`SqlxDriver`] — wire-protocol engines through one sqlx `Any` pool
//!   per descriptor (postgres/redshift, mysql/mariadb, sqlite).
//! - [`HttpDriver`] — Trino/Presto's `/v1/statement` paging protocol and
//!   ClickHouse's HTTP interface, behind the `http-engines` feature.
//!
//! Pools are per-descriptor with a configurable ceiling; acquisition is
//! bounded and surfaces `PoolExhausted`. Transient SQL failures retry with
//! the driver-level [`RetryPolicy`]; everything else bubbles up.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Settings;
use crate::descriptor::{ConnDescriptor, DialectKind};
use crate::dialect::{self, Dialect};
use crate::error::{DiffError, RetryPolicy};
use crate::hash::{self, SegmentChecksum};
use crate::segment::{compare_key_tuples, KeyTuple, SegmentColumn, TableRef, TableSegment};
use crate::types::{self, Canonical};

/// One introspected column.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub raw_type: String,
    pub canon: Canonical,
    pub nullable: bool,
    pub is_key_hint: bool,
}

/// Result of one SQL round trip, decoded to JSON values.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// The driver capability set.
#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> &dyn Dialect;

    fn descriptor(&self) -> &ConnDescriptor;

    /// One SQL round trip.
    async fn query(&self, sql: &str) -> Result<QueryOutput, DiffError>;

    /// Release the underlying pool. Infallible.
    async fn close(&self);

    /// Round trip with the driver retry policy applied to transient
    /// failures (QueryFailure ×3 with backoff, PoolExhausted ×1).
    async fn query_with_retry(&self, sql: &str) -> Result<QueryOutput, DiffError> {
        let policy = RetryPolicy::default();
        let mut attempt: u32 = 0;
        loop {
            match self.query(sql).await {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < e.max_attempts() => {
                    let delay = policy.backoff_ms(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay,
                        "transient query failure, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cheap liveness probe used by the connection-test endpoint.
    async fn ping(&self) -> Result<(), DiffError> {
        self.query("SELECT 1").await.map(|_| ())
    }

    /// The namespace to introspect when the caller names none.
    fn effective_namespace(&self, requested: Option<&str>) -> Option<String> {
        let desc = self.descriptor();
        requested
            .map(str::to_string)
            .or_else(|| desc.namespace.clone())
            .or_else(|| self.dialect().default_namespace(desc.database.as_deref()))
    }

    /// Ordered columns of one table.
    async fn introspect_table(&self, table: &TableRef) -> Result<Vec<ColumnInfo>, DiffError> {
        let ns = self.effective_namespace(table.namespace.as_deref());
        let sql = self
            .dialect()
            .introspect_columns_sql(ns.as_deref(), &table.name);
        let out = self.query_with_retry(&sql).await?;
        if out.rows.is_empty() {
            return Err(DiffError::NoSuchObject(format!(
                "table {} not found{}",
                table.name,
                ns.map_or(String::new(), |n| format!(" in namespace {n}"))
            )));
        }
        let mut cols = Vec::with_capacity(out.rows.len());
        for row in &out.rows {
            let name = value_text(row.first()).ok_or_else(|| {
                DiffError::QueryFailure("introspection returned a NULL column name".into())
            })?;
            let raw_type = value_text(row.get(1)).unwrap_or_default();
            let nullable = value_text(row.get(2)).is_none_or(|v| v.eq_ignore_ascii_case("yes"));
            let is_key_hint = row.get(3).is_some_and(truthy);
            cols.push(ColumnInfo {
                canon: self.dialect().normalise_type(&raw_type),
                name,
                raw_type,
                nullable,
                is_key_hint,
            });
        }
        Ok(cols)
    }

    /// Sorted table names of one namespace.
    async fn list_tables(&self, namespace: Option<&str>) -> Result<Vec<String>, DiffError> {
        let ns = self.effective_namespace(namespace);
        let sql = self.dialect().list_tables_sql(ns.as_deref());
        let out = self.query_with_retry(&sql).await?;
        let mut names: Vec<String> = out
            .rows
            .iter()
            .filter_map(|r| value_text(r.first()))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Approximate cardinality. Best-effort: `None` means unknown, never
    /// an error.
    async fn estimate_row_count(&self, segment: &TableSegment) -> Result<Option<u64>, DiffError> {
        let unconstrained =
            segment.predicate.is_none() && segment.min_key.is_none() && segment.max_key.is_none();
        if unconstrained {
            let ns = self.effective_namespace(segment.table.namespace.as_deref());
            if let Some(sql) = self
                .dialect()
                .table_estimate_sql(ns.as_deref(), &segment.table.name)
            {
                if let Ok(out) = self.query(&sql).await {
                    if let Some(est) = out
                        .rows
                        .first()
                        .and_then(|r| value_text(r.first()))
                        .and_then(|t| t.trim().parse::<f64>().ok())
                    {
                        if est >= 0.0 {
                            return Ok(Some(est.round() as u64));
                        }
                    }
                }
            }
        }
        match self.query(&segment.count_sql()).await {
            Ok(out) => Ok(out
                .rows
                .first()
                .and_then(|r| value_text(r.first()))
                .and_then(|t| t.trim().parse::<u64>().ok())),
            Err(_) => Ok(None),
        }
    }

    /// `(row_count, aggregate_checksum)` in one round trip. Engines
    /// without a server-side hash fall back to hashing the canonical
    /// projection client-side — same H, same representations.
    async fn checksum(&self, segment: &TableSegment) -> Result<SegmentChecksum, DiffError> {
        if let Some(sql) = segment.checksum_sql() {
            let out = self.query_with_retry(&sql).await?;
            let row = out.rows.first().ok_or_else(|| {
                DiffError::QueryFailure("checksum query returned no row".into())
            })?;
            let count = value_text(row.first())
                .and_then(|t| t.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    DiffError::QueryFailure("checksum row count is not an integer".into())
                })?;
            let sum = hash::parse_sum_mod_2_64(&value_text(row.get(1)).unwrap_or_default())?;
            return Ok(SegmentChecksum { count, sum });
        }

        let cols = segment.compared_columns();
        let out = self
            .query_with_retry(&segment.projection_sql(&cols))
            .await?;
        let mut acc = SegmentChecksum::default();
        for row in &out.rows {
            let reprs: Vec<Option<String>> = cols
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    types::canonical_repr(&c.canon, row.get(i).unwrap_or(&Value::Null))
                })
                .collect();
            acc.push(hash::row_hash(reprs.iter().map(Option::as_deref)));
        }
        Ok(acc)
    }

    /// Ordered sample of key tuples used as bisection pivots.
    async fn fetch_keys(
        &self,
        segment: &TableSegment,
        n_pivots: u64,
        total_count: u64,
    ) -> Result<Vec<KeyTuple>, DiffError> {
        let sql = segment.sample_keys_sql(n_pivots, total_count);
        let out = self.query_with_retry(&sql).await?;
        let mut keys: Vec<KeyTuple> = out
            .rows
            .iter()
            .map(|row| {
                segment
                    .key_columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        types::decode_text(&c.canon, value_text(row.get(i)))
                    })
                    .collect()
            })
            .collect();
        keys.sort_by(|a, b| compare_key_tuples(&segment.key_columns, a, b));
        keys.dedup();
        Ok(keys)
    }

    /// Materialise the projection of one segment, decoded per canonical
    /// type. Leaf comparison buffers and sorts client-side, so no ORDER BY
    /// is pushed down.
    async fn fetch_rows(
        &self,
        segment: &TableSegment,
        columns: &[SegmentColumn],
    ) -> Result<Vec<Vec<Value>>, DiffError> {
        let out = self
            .query_with_retry(&segment.projection_sql(columns))
            .await?;
        Ok(out
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| types::decode_text(&c.canon, value_text(row.get(i))))
                    .collect()
            })
            .collect())
    }
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("dialect", &self.dialect().kind())
            .field("descriptor", self.descriptor())
            .finish()
    }
}

/// Text view of one decoded cell; `None` for SQL NULL.
fn value_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true") || s == "t",
        _ => false,
    }
}

// ── sqlx transport ─────────────────────────────────────────────────────────

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row, TypeInfo};

/// Wire-protocol driver over one sqlx `Any` pool.
pub struct SqlxDriver {
    pool: AnyPool,
    dialect: Box<dyn Dialect>,
    desc: ConnDescriptor,
    query_timeout: std::time::Duration,
}

impl SqlxDriver {
    /// Open a pool for a wire-protocol descriptor.
    pub async fn open(desc: &ConnDescriptor, settings: &Settings) -> Result<Self, DiffError> {
        static INSTALL: OnceLock<()> = OnceLock::new();
        INSTALL.get_or_init(sqlx::any::install_default_drivers);

        let url = sqlx_url(desc)?;
        // Every pooled connection to an in-memory sqlite file would be its
        // own empty database; pin those pools to one connection.
        let max_connections = if desc.dialect == DialectKind::Sqlite
            && desc.database.as_deref().is_some_and(|d| d.contains(":memory:"))
        {
            1
        } else {
            settings.pool_max_connections
        };
        let mut opts = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(settings.pool_acquire_timeout());
        if matches!(desc.dialect, DialectKind::Mysql | DialectKind::Mariadb) {
            // UNIX_TIMESTAMP in the canonical projections is only absolute
            // with the session pinned to UTC.
            opts = opts.after_connect(|conn, _meta| {
                Box::pin(async move {
                    use sqlx::Executor;
                    conn.execute("SET time_zone = '+00:00'").await?;
                    Ok(())
                })
            });
        }
        let pool = opts.connect(&url).await.map_err(classify_sqlx_error)?;
        Ok(Self {
            pool,
            dialect: dialect::from_kind(desc.dialect),
            desc: desc.clone(),
            query_timeout: settings.query_timeout(),
        })
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    fn descriptor(&self) -> &ConnDescriptor {
        &self.desc
    }

    async fn query(&self, sql: &str) -> Result<QueryOutput, DiffError> {
        let fetched = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(sql).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| {
            DiffError::QueryFailure(format!(
                "query exceeded the {}s timeout",
                self.query_timeout.as_secs()
            ))
        })?
        .map_err(classify_sqlx_error)?;

        let columns = fetched
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let rows = fetched
            .iter()
            .map(|row| {
                (0..row.columns().len())
                    .map(|i| decode_any_cell(row, i))
                    .collect()
            })
            .collect();
        Ok(QueryOutput { columns, rows })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Decode one `AnyRow` cell to a JSON value, keyed on the reported column
/// type and falling back through progressively looser reads.
fn decode_any_cell(row: &AnyRow, idx: usize) -> Value {
    let type_name = row.column(idx).type_info().name().to_uppercase();
    match type_name.as_str() {
        "BOOL" | "BOOLEAN" => {
            if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
                return v.map_or(Value::Null, Value::Bool);
            }
        }
        "INT2" | "SMALLINT" | "INT4" | "INT" | "INTEGER" | "MEDIUMINT" | "SERIAL" | "INT8"
        | "BIGINT" | "BIGSERIAL" | "TINYINT" => {
            if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                return v.map_or(Value::Null, Value::from);
            }
            if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
                return v.map_or(Value::Null, Value::from);
            }
            if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
                return v.map_or(Value::Null, Value::from);
            }
        }
        "REAL" | "FLOAT4" | "FLOAT" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => {
            if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                return v
                    .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                    .unwrap_or(Value::Null);
            }
            if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
                return v
                    .and_then(|f| serde_json::Number::from_f64(f as f64).map(Value::Number))
                    .unwrap_or(Value::Null);
            }
        }
        // MySQL hands non-native casts back as BLOB; read raw bytes.
        "BLOB" | "BYTEA" | "VARBINARY" | "BINARY" | "MEDIUMBLOB" | "LONGBLOB" => {
            if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
                return v.map_or(Value::Null, |b| {
                    Value::String(String::from_utf8_lossy(&b).into_owned())
                });
            }
        }
        _ => {}
    }
    match row.try_get::<Option<String>, _>(idx) {
        Ok(v) => v.map_or(Value::Null, Value::String),
        Err(_) => Value::Null,
    }
}

/// Map a sqlx error onto the service taxonomy.
fn classify_sqlx_error(e: sqlx::Error) -> DiffError {
    match e {
        sqlx::Error::PoolTimedOut => {
            DiffError::PoolExhausted("no connection within the acquire timeout".into())
        }
        sqlx::Error::Io(io) => DiffError::Unreachable(io.to_string()),
        sqlx::Error::Tls(tls) => DiffError::Unreachable(tls.to_string()),
        sqlx::Error::Configuration(c) => DiffError::InvalidConfig(c.to_string()),
        sqlx::Error::Database(db) => {
            let msg = db.message().to_string();
            match db.code().as_deref() {
                // 28xxx: postgres auth; 1045: mysql access denied
                Some("28P01") | Some("28000") | Some("1045") => DiffError::AuthFailure(msg),
                // undefined table / unknown relation
                Some("42P01") | Some("1146") => DiffError::NoSuchObject(msg),
                // insufficient privilege
                Some("42501") | Some("1142") | Some("1044") => DiffError::PermissionDenied(msg),
                _ => DiffError::QueryFailure(msg),
            }
        }
        other => DiffError::QueryFailure(other.to_string()),
    }
}

/// Render the sqlx connection URL for a wire-protocol descriptor.
fn sqlx_url(desc: &ConnDescriptor) -> Result<String, DiffError> {
    let scheme = match desc.dialect {
        DialectKind::Postgres | DialectKind::Redshift => "postgres",
        DialectKind::Mysql | DialectKind::Mariadb => "mysql",
        DialectKind::Sqlite => {
            let path = desc.database.as_deref().unwrap_or(":memory:");
            return Ok(if path.contains(":memory:") {
                "sqlite::memory:".to_string()
            } else if path.contains('?') {
                format!("sqlite://{path}")
            } else {
                // Create the file on first open, like the result store.
                format!("sqlite://{path}?mode=rwc")
            });
        }
        other => {
            return Err(DiffError::Unsupported {
                dialect: other.to_string(),
                detail: "no wire-protocol transport".into(),
            });
        }
    };
    let mut url = format!("{scheme}://");
    if let Some(user) = &desc.user {
        url.push_str(&pct_encode(user));
        if let Some(pass) = &desc.password {
            url.push(':');
            url.push_str(&pct_encode(pass));
        }
        url.push('@');
    }
    url.push_str(desc.host.as_deref().unwrap_or("localhost"));
    if let Some(port) = desc.port {
        url.push_str(&format!(":{port}"));
    }
    if let Some(db) = &desc.database {
        url.push('/');
        url.push_str(&pct_encode(db));
    }
    if !desc.options.is_empty() {
        let opts: Vec<String> = desc
            .options
            .iter()
            .map(|(k, v)| format!("{}={}", pct_encode(k), pct_encode(v)))
            .collect();
        url.push('?');
        url.push_str(&opts.join("&"));
    }
    Ok(url)
}

fn pct_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ── HTTP transport (Trino / Presto / ClickHouse) ───────────────────────────

#[cfg(feature = "http-engines")]
pub use self::http::HttpDriver;

#[cfg(feature = "http-engines")]
mod http {
    use super::*;
    use serde::Deserialize;

    /// Driver for engines speaking plain HTTP SQL protocols.
    pub struct HttpDriver {
        client: reqwest::Client,
        dialect: Box<dyn Dialect>,
        desc: ConnDescriptor,
    }

    #[derive(Debug, Deserialize)]
    struct TrinoResponse {
        #[serde(default)]
        columns: Option<Vec<TrinoColumn>>,
        #[serde(default)]
        data: Option<Vec<Vec<Value>>>,
        #[serde(rename = "nextUri")]
        next_uri: Option<String>,
        #[serde(default)]
        error: Option<TrinoError>,
    }

    #[derive(Debug, Deserialize)]
    struct TrinoColumn {
        name: String,
    }

    #[derive(Debug, Deserialize)]
    struct TrinoError {
        message: String,
        #[serde(rename = "errorName", default)]
        error_name: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct ClickhouseResponse {
        meta: Vec<ClickhouseColumn>,
        data: Vec<Vec<Value>>,
    }

    #[derive(Debug, Deserialize)]
    struct ClickhouseColumn {
        name: String,
    }

    impl HttpDriver {
        pub fn open(desc: &ConnDescriptor, settings: &Settings) -> Result<Self, DiffError> {
            if !matches!(
                desc.dialect,
                DialectKind::Trino | DialectKind::Presto | DialectKind::Clickhouse
            ) {
                return Err(DiffError::Unsupported {
                    dialect: desc.dialect.to_string(),
                    detail: "no HTTP transport".into(),
                });
            }
            let client = reqwest::Client::builder()
                .timeout(settings.query_timeout())
                .build()
                .map_err(|e| DiffError::Internal(format!("http client build failed: {e}")))?;
            Ok(Self {
                client,
                dialect: dialect::from_kind(desc.dialect),
                desc: desc.clone(),
            })
        }

        fn base_url(&self) -> String {
            let scheme = if self.desc.options.get("ssl").map(String::as_str) == Some("true") {
                "https"
            } else {
                "http"
            };
            let host = self.desc.host.as_deref().unwrap_or("localhost");
            match self.desc.port {
                Some(p) => format!("{scheme}://{host}:{p}"),
                None => format!("{scheme}://{host}"),
            }
        }

        async fn query_trino(&self, sql: &str) -> Result<QueryOutput, DiffError> {
            let user_header = if self.desc.dialect == DialectKind::Presto {
                "X-Presto-User"
            } else {
                "X-Trino-User"
            };
            let catalog_header = if self.desc.dialect == DialectKind::Presto {
                "X-Presto-Catalog"
            } else {
                "X-Trino-Catalog"
            };
            let schema_header = if self.desc.dialect == DialectKind::Presto {
                "X-Presto-Schema"
            } else {
                "X-Trino-Schema"
            };

            let mut req = self
                .client
                .post(format!("{}/v1/statement", self.base_url()))
                .header(user_header, self.desc.user.as_deref().unwrap_or("crossdiff"))
                .body(sql.to_string());
            if let Some(catalog) = &self.desc.database {
                req = req.header(catalog_header, catalog);
            }
            if let Some(schema) = &self.desc.namespace {
                req = req.header(schema_header, schema);
            }

            let mut out = QueryOutput::default();
            let mut page: TrinoResponse = send_json(req).await?;
            loop {
                if let Some(err) = page.error {
                    return Err(DiffError::QueryFailure(format!(
                        "{}: {}",
                        err.error_name.unwrap_or_else(|| "QUERY_ERROR".into()),
                        err.message
                    )));
                }
                if out.columns.is_empty() {
                    if let Some(cols) = &page.columns {
                        out.columns = cols.iter().map(|c| c.name.clone()).collect();
                    }
                }
                if let Some(data) = page.data {
                    out.rows.extend(data);
                }
                match page.next_uri {
                    Some(uri) => page = send_json(self.client.get(uri)).await?,
                    None => break,
                }
            }
            Ok(out)
        }

        async fn query_clickhouse(&self, sql: &str) -> Result<QueryOutput, DiffError> {
            let mut req = self
                .client
                .post(format!(
                    "{}/?default_format=JSONCompact&database={}",
                    self.base_url(),
                    self.desc.database.as_deref().unwrap_or("default")
                ))
                .body(sql.to_string());
            if let Some(user) = &self.desc.user {
                req = req.basic_auth(user, self.desc.password.as_deref());
            }
            let body: ClickhouseResponse = send_json(req).await?;
            Ok(QueryOutput {
                columns: body.meta.into_iter().map(|c| c.name).collect(),
                rows: body.data,
            })
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        req: reqwest::RequestBuilder,
    ) -> Result<T, DiffError> {
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                DiffError::Unreachable(e.to_string())
            } else {
                DiffError::QueryFailure(e.to_string())
            }
        })?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DiffError::AuthFailure(format!("HTTP {status}")));
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(DiffError::PermissionDenied(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DiffError::QueryFailure(format!("HTTP {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| DiffError::QueryFailure(format!("malformed engine response: {e}")))
    }

    #[async_trait]
    impl Driver for HttpDriver {
        fn dialect(&self) -> &dyn Dialect {
            self.dialect.as_ref()
        }

        fn descriptor(&self) -> &ConnDescriptor {
            &self.desc
        }

        async fn query(&self, sql: &str) -> Result<QueryOutput, DiffError> {
            match self.desc.dialect {
                DialectKind::Clickhouse => self.query_clickhouse(sql).await,
                _ => self.query_trino(sql).await,
            }
        }

        async fn close(&self) {}
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

use std::sync::Arc;

fn registry() -> &'static Mutex<HashMap<String, Arc<dyn Driver>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn Driver>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Open (or reuse) the driver for a descriptor. Pools are shared per
/// descriptor fingerprint; this and the metrics registry are the only
/// process-wide state.
pub async fn open(desc: &ConnDescriptor, settings: &Settings) -> Result<Arc<dyn Driver>, DiffError> {
    let key = desc.fingerprint();
    if let Some(existing) = registry()
        .lock()
        .map_err(|_| DiffError::Internal("driver registry poisoned".into()))?
        .get(&key)
    {
        return Ok(Arc::clone(existing));
    }

    let driver: Arc<dyn Driver> = open_transport(desc, settings).await?;

    let mut guard = registry()
        .lock()
        .map_err(|_| DiffError::Internal("driver registry poisoned".into()))?;
    // A concurrent open for the same descriptor may have won the race;
    // keep the first and let the duplicate pool drop.
    let entry = guard.entry(key).or_insert_with(|| Arc::clone(&driver));
    Ok(Arc::clone(entry))
}

/// Construct the transport for a dialect, honouring the compiled feature
/// set. Dialects without a bundled transport fail here with `Unsupported`.
async fn open_transport(
    desc: &ConnDescriptor,
    settings: &Settings,
) -> Result<Arc<dyn Driver>, DiffError> {
    match desc.dialect {
        DialectKind::Postgres | DialectKind::Redshift => {
            #[cfg(feature = "postgres")]
            return Ok(Arc::new(SqlxDriver::open(desc, settings).await?));
            #[cfg(not(feature = "postgres"))]
            Err(unsupported(desc.dialect, "postgres feature disabled"))
        }
        DialectKind::Mysql | DialectKind::Mariadb => {
            #[cfg(feature = "mysql")]
            return Ok(Arc::new(SqlxDriver::open(desc, settings).await?));
            #[cfg(not(feature = "mysql"))]
            Err(unsupported(desc.dialect, "mysql feature disabled"))
        }
        DialectKind::Sqlite => {
            #[cfg(feature = "sqlite")]
            return Ok(Arc::new(SqlxDriver::open(desc, settings).await?));
            #[cfg(not(feature = "sqlite"))]
            Err(unsupported(desc.dialect, "sqlite feature disabled"))
        }
        DialectKind::Trino | DialectKind::Presto | DialectKind::Clickhouse => {
            #[cfg(feature = "http-engines")]
            return Ok(Arc::new(HttpDriver::open(desc, settings)?));
            #[cfg(not(feature = "http-engines"))]
            Err(unsupported(desc.dialect, "http-engines feature disabled"))
        }
        other => Err(unsupported(other, "no bundled transport")),
    }
}

fn unsupported(dialect: DialectKind, detail: &str) -> DiffError {
    DiffError::Unsupported {
        dialect: dialect.to_string(),
        detail: detail.to_string(),
    }
}

/// Close every pooled driver. Documented teardown for the registry.
pub async fn close_all() {
    let drained: Vec<Arc<dyn Driver>> = match registry().lock() {
        Ok(mut guard) => guard.drain().map(|(_, d)| d).collect(),
        Err(_) => return,
    };
    for driver in drained {
        driver.close().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Transportless driver for SQL-rendering tests.
    pub(crate) struct StubDriver {
        dialect: Box<dyn Dialect>,
        desc: ConnDescriptor,
    }

    impl StubDriver {
        pub(crate) fn new(desc: ConnDescriptor) -> Self {
            Self {
                dialect: dialect::from_kind(desc.dialect),
                desc,
            }
        }
    }

    #[async_trait]
    impl Driver for StubDriver {
        fn dialect(&self) -> &dyn Dialect {
            self.dialect.as_ref()
        }

        fn descriptor(&self) -> &ConnDescriptor {
            &self.desc
        }

        async fn query(&self, _sql: &str) -> Result<QueryOutput, DiffError> {
            Err(DiffError::Unsupported {
                dialect: self.desc.dialect.to_string(),
                detail: "stub driver".into(),
            })
        }

        async fn close(&self) {}
    }

    #[test]
    fn test_sqlx_url_postgres() {
        let d = ConnDescriptor::from_url("postgres://u:p@h:5432/db?sslmode=disable").unwrap();
        assert_eq!(
            sqlx_url(&d).unwrap(),
            "postgres://u:p@h:5432/db?sslmode=disable"
        );
    }

    #[test]
    fn test_sqlx_url_redshift_uses_postgres_scheme() {
        let d = ConnDescriptor::from_url("redshift://u:p@h:5439/db").unwrap();
        assert!(sqlx_url(&d).unwrap().starts_with("postgres://"));
    }

    #[test]
    fn test_sqlx_url_sqlite() {
        let d = ConnDescriptor::from_url("sqlite:///tmp/x.db").unwrap();
        assert_eq!(sqlx_url(&d).unwrap(), "sqlite:///tmp/x.db?mode=rwc");
        let m = ConnDescriptor::from_url("sqlite://:memory:").unwrap();
        assert_eq!(sqlx_url(&m).unwrap(), "sqlite::memory:");
    }

    #[test]
    fn test_sqlx_url_escapes_credentials() {
        let mut d = ConnDescriptor::new(DialectKind::Postgres);
        d.user = Some("u@corp".into());
        d.password = Some("p:ss".into());
        d.host = Some("h".into());
        d.database = Some("db".into());
        let url = sqlx_url(&d).unwrap();
        assert!(url.contains("u%40corp:p%3Ass@h"), "{url}");
    }

    #[test]
    fn test_sqlx_url_rejects_transportless_dialects() {
        let d = ConnDescriptor::new(DialectKind::Snowflake);
        assert!(matches!(
            sqlx_url(&d),
            Err(DiffError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_value_text_variants() {
        use serde_json::json;
        assert_eq!(value_text(Some(&json!("a"))), Some("a".to_string()));
        assert_eq!(value_text(Some(&json!(5))), Some("5".to_string()));
        assert_eq!(value_text(Some(&json!(true))), Some("1".to_string()));
        assert_eq!(value_text(Some(&Value::Null)), None);
        assert_eq!(value_text(None), None);
    }

    #[test]
    fn test_truthy() {
        use serde_json::json;
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("1")));
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("0")));
        assert!(!truthy(&Value::Null));
    }

    #[tokio::test]
    async fn test_open_unsupported_dialect_fails_cleanly() {
        let desc = ConnDescriptor::new(DialectKind::Oracle);
        let settings = Settings::default();
        let err = open(&desc, &settings).await.unwrap_err();
        assert!(matches!(err, DiffError::Unsupported { .. }), "{err}");
    }
}
