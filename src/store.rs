//! Result store.
//!
//! Persists jobs, summaries, diff rows, and column statistics behind one
//! sqlx `Any` pool (sqlite file by default, postgres for shared
//! deployments). The scheduler is the single writer per job id; status
//! polls and metric aggregation only read.
//!
//! Visibility contract: diff rows stream in while the job is `Running`;
//! the summary write and the transition to `Completed` happen in one
//! transaction, so any reader observing `Completed` sees the full row
//! set. SQL here is rendered with inlined escaped literals because the
//! `Any` driver does not translate placeholder styles across backends.

use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::diff::{ColumnStats, DiffKind, DiffRow};
use crate::error::{DiffError, ErrorKind};
use crate::job::{Job, JobKind, JobState, Summary};

/// SQL string literal with doubled quotes.
fn lit(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn opt_lit(s: Option<&str>) -> String {
    s.map_or("NULL".to_string(), lit)
}

fn ts_lit(ts: DateTime<Utc>) -> String {
    lit(&ts.to_rfc3339())
}

fn opt_ts_lit(ts: Option<DateTime<Utc>>) -> String {
    ts.map_or("NULL".to_string(), ts_lit)
}

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs ( \
       id TEXT PRIMARY KEY, \
       kind TEXT NOT NULL, \
       state TEXT NOT NULL, \
       config TEXT NOT NULL, \
       warnings TEXT NOT NULL DEFAULT '[]', \
       error_kind TEXT, \
       error TEXT, \
       created_ts TEXT NOT NULL, \
       started_ts TEXT, \
       finished_ts TEXT \
     )",
    "CREATE TABLE IF NOT EXISTS job_summary ( \
       job_id TEXT PRIMARY KEY, \
       rows_compared BIGINT NOT NULL, \
       rows_matched BIGINT NOT NULL, \
       rows_different BIGINT NOT NULL, \
       match_rate DOUBLE PRECISION NOT NULL, \
       extras TEXT NOT NULL DEFAULT '{}' \
     )",
    "CREATE TABLE IF NOT EXISTS diff_rows ( \
       job_id TEXT NOT NULL, \
       kind TEXT NOT NULL, \
       key_tuple TEXT NOT NULL, \
       key_repr TEXT NOT NULL, \
       column_name TEXT, \
       source_value TEXT, \
       target_value TEXT \
     )",
    "CREATE INDEX IF NOT EXISTS idx_diff_rows_job_key ON diff_rows (job_id, key_repr)",
    "CREATE TABLE IF NOT EXISTS column_stats ( \
       job_id TEXT NOT NULL, \
       side TEXT NOT NULL, \
       column_name TEXT NOT NULL, \
       null_count BIGINT NOT NULL, \
       null_rate DOUBLE PRECISION NOT NULL, \
       distinct_est BIGINT NOT NULL \
     )",
];

/// The persistence layer for comparison results.
#[derive(Clone)]
pub struct ResultStore {
    pool: AnyPool,
}

impl ResultStore {
    /// Connect and run the idempotent migration.
    pub async fn connect(url: &str) -> Result<Self, DiffError> {
        static INSTALL: std::sync::OnceLock<()> = std::sync::OnceLock::new();
        INSTALL.get_or_init(sqlx::any::install_default_drivers);

        let url = normalize_store_url(url);
        // Each pooled connection to an in-memory sqlite database would be
        // its own empty database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .map_err(|e| DiffError::InvalidConfig(format!("cannot open result store: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), DiffError> {
        for ddl in DDL {
            self.execute(ddl).await?;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<(), DiffError> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| DiffError::QueryFailure(format!("result store: {e}")))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Writes ───────────────────────────────────────────────────────────

    pub async fn insert_job(&self, job: &Job) -> Result<(), DiffError> {
        let config = serde_json::to_string(&job.config)
            .map_err(|e| DiffError::Internal(format!("config serialisation: {e}")))?;
        let warnings = serde_json::to_string(&job.warnings)
            .map_err(|e| DiffError::Internal(format!("warning serialisation: {e}")))?;
        self.execute(&format!(
            "INSERT INTO jobs (id, kind, state, config, warnings, created_ts) \
             VALUES ({}, {}, {}, {}, {}, {})",
            lit(&job.id.to_string()),
            lit(job.kind.as_str()),
            lit(job.state.as_str()),
            lit(&config),
            lit(&warnings),
            ts_lit(job.created_ts),
        ))
        .await
    }

    /// `Pending → Running`. The state guard in the WHERE clause keeps the
    /// lifecycle monotone even if a duplicate worker picks the job up.
    pub async fn mark_running(&self, id: Uuid) -> Result<(), DiffError> {
        self.execute(&format!(
            "UPDATE jobs SET state = 'running', started_ts = {} \
             WHERE id = {} AND state = 'pending'",
            ts_lit(Utc::now()),
            lit(&id.to_string()),
        ))
        .await
    }

    /// Append one batch of diff rows for a running job.
    pub async fn append_diff_rows(&self, id: Uuid, rows: &[DiffRow]) -> Result<(), DiffError> {
        if rows.is_empty() {
            return Ok(());
        }
        let id_lit = lit(&id.to_string());
        let values: Vec<String> = rows
            .iter()
            .map(|r| {
                let key_json =
                    serde_json::to_string(&r.key).unwrap_or_else(|_| "[]".to_string());
                format!(
                    "({id_lit}, {}, {}, {}, {}, {}, {})",
                    lit(r.kind.as_str()),
                    lit(&key_json),
                    lit(&crate::diff::key_repr(&r.key)),
                    opt_lit(r.column.as_deref()),
                    opt_lit(r.source_value.as_ref().map(value_text).as_deref()),
                    opt_lit(r.target_value.as_ref().map(value_text).as_deref()),
                )
            })
            .collect();
        self.execute(&format!(
            "INSERT INTO diff_rows \
             (job_id, kind, key_tuple, key_repr, column_name, source_value, target_value) \
             VALUES {}",
            values.join(", ")
        ))
        .await
    }

    pub async fn insert_column_stats(
        &self,
        id: Uuid,
        side: &str,
        stats: &[ColumnStats],
    ) -> Result<(), DiffError> {
        if stats.is_empty() {
            return Ok(());
        }
        let id_lit = lit(&id.to_string());
        let values: Vec<String> = stats
            .iter()
            .map(|s| {
                format!(
                    "({id_lit}, {}, {}, {}, {}, {})",
                    lit(side),
                    lit(&s.column),
                    s.null_count,
                    s.null_rate,
                    s.distinct_est,
                )
            })
            .collect();
        self.execute(&format!(
            "INSERT INTO column_stats \
             (job_id, side, column_name, null_count, null_rate, distinct_est) \
             VALUES {}",
            values.join(", ")
        ))
        .await
    }

    /// Terminal success: summary and `Running → Completed` in one
    /// transaction.
    pub async fn complete_job(
        &self,
        id: Uuid,
        summary: &Summary,
        warnings: &[String],
    ) -> Result<(), DiffError> {
        let extras = serde_json::to_string(summary)
            .map_err(|e| DiffError::Internal(format!("summary serialisation: {e}")))?;
        let warnings_json = serde_json::to_string(warnings)
            .map_err(|e| DiffError::Internal(format!("warning serialisation: {e}")))?;
        let id_lit = lit(&id.to_string());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DiffError::QueryFailure(format!("result store: {e}")))?;
        sqlx::query(&format!(
            "INSERT INTO job_summary \
             (job_id, rows_compared, rows_matched, rows_different, match_rate, extras) \
             VALUES ({id_lit}, {}, {}, {}, {}, {})",
            summary.rows_compared,
            summary.rows_matched,
            summary.rows_different,
            summary.match_rate,
            lit(&extras),
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| DiffError::QueryFailure(format!("result store: {e}")))?;
        sqlx::query(&format!(
            "UPDATE jobs SET state = 'completed', finished_ts = {}, warnings = {} \
             WHERE id = {id_lit} AND state = 'running'",
            ts_lit(Utc::now()),
            lit(&warnings_json),
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| DiffError::QueryFailure(format!("result store: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DiffError::QueryFailure(format!("result store: {e}")))
    }

    /// Terminal failure. Never retried; partial diff rows stay queryable
    /// and the absent summary marks them partial.
    pub async fn fail_job(
        &self,
        id: Uuid,
        kind: ErrorKind,
        message: &str,
        warnings: &[String],
    ) -> Result<(), DiffError> {
        let warnings_json =
            serde_json::to_string(warnings).unwrap_or_else(|_| "[]".to_string());
        self.execute(&format!(
            "UPDATE jobs SET state = 'failed', finished_ts = {}, \
             error_kind = {}, error = {}, warnings = {} \
             WHERE id = {} AND state IN ('pending', 'running')",
            ts_lit(Utc::now()),
            lit(kind.as_str()),
            lit(message),
            lit(&warnings_json),
            lit(&id.to_string()),
        ))
        .await
    }

    /// Startup crash recovery: any job still `Pending` or `Running` was
    /// interrupted; mark it failed so no reader waits on it forever.
    pub async fn recover_interrupted(&self) -> Result<(), DiffError> {
        self.execute(&format!(
            "UPDATE jobs SET state = 'failed', finished_ts = {}, \
             error_kind = 'Internal', \
             error = 'interrupted by service restart' \
             WHERE state IN ('pending', 'running')",
            ts_lit(Utc::now()),
        ))
        .await
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DiffError> {
        let rows = self
            .fetch(&format!(
                "SELECT j.id, j.kind, j.state, j.config, j.warnings, j.error_kind, j.error, \
                        j.created_ts, j.started_ts, j.finished_ts, s.extras \
                 FROM jobs j LEFT JOIN job_summary s ON s.job_id = j.id \
                 WHERE j.id = {}",
                lit(&id.to_string()),
            ))
            .await?;
        rows.first().map(row_to_job).transpose()
    }

    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: u64,
    ) -> Result<Vec<Job>, DiffError> {
        let filter = match state {
            Some(s) => format!("WHERE j.state = {}", lit(s.as_str())),
            None => String::new(),
        };
        let rows = self
            .fetch(&format!(
                "SELECT j.id, j.kind, j.state, j.config, j.warnings, j.error_kind, j.error, \
                        j.created_ts, j.started_ts, j.finished_ts, s.extras \
                 FROM jobs j LEFT JOIN job_summary s ON s.job_id = j.id \
                 {filter} ORDER BY j.created_ts DESC LIMIT {limit}",
            ))
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// One page of a job's diff rows, sorted by key tuple.
    pub async fn diff_rows(
        &self,
        id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DiffRow>, DiffError> {
        let rows = self
            .fetch(&format!(
                "SELECT kind, key_tuple, column_name, source_value, target_value \
                 FROM diff_rows WHERE job_id = {} \
                 ORDER BY key_repr, kind, column_name LIMIT {limit} OFFSET {offset}",
                lit(&id.to_string()),
            ))
            .await?;
        rows.iter()
            .map(|r| {
                let kind = match r.first().and_then(|c| c.clone()) {
                    Some(k) if k == "exclusive-source" => DiffKind::ExclusiveSource,
                    Some(k) if k == "exclusive-target" => DiffKind::ExclusiveTarget,
                    Some(k) if k == "value-mismatch" => DiffKind::ValueMismatch,
                    other => {
                        return Err(DiffError::Internal(format!(
                            "unknown diff kind in store: {other:?}"
                        )));
                    }
                };
                let key = r
                    .get(1)
                    .and_then(|c| c.as_deref().map(serde_json::from_str))
                    .transpose()
                    .map_err(|e| DiffError::Internal(format!("bad key tuple in store: {e}")))?
                    .unwrap_or_default();
                Ok(DiffRow {
                    kind,
                    key,
                    column: r.get(2).and_then(Clone::clone),
                    source_value: r
                        .get(3)
                        .and_then(|c| c.clone().map(serde_json::Value::String)),
                    target_value: r
                        .get(4)
                        .and_then(|c| c.clone().map(serde_json::Value::String)),
                })
            })
            .collect()
    }

    pub async fn count_diff_rows(&self, id: Uuid) -> Result<u64, DiffError> {
        let rows = self
            .fetch(&format!(
                "SELECT CAST(COUNT(*) AS VARCHAR) FROM diff_rows WHERE job_id = {}",
                lit(&id.to_string()),
            ))
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(|c| c.as_deref())
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or(0))
    }

    /// Text-only fetch: every cell read as an optional string.
    async fn fetch(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, DiffError> {
        let fetched = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DiffError::QueryFailure(format!("result store: {e}")))?;
        Ok(fetched
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<Option<String>, _>(i).ok().flatten())
                    .collect()
            })
            .collect())
    }
}

fn value_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn row_to_job(row: &Vec<Option<String>>) -> Result<Job, DiffError> {
    let text = |i: usize| row.get(i).and_then(Clone::clone);
    let required = |i: usize, what: &str| {
        text(i).ok_or_else(|| DiffError::Internal(format!("job row missing {what}")))
    };
    let parse_ts = |t: String| {
        DateTime::parse_from_rfc3339(&t)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| DiffError::Internal(format!("bad timestamp in store: {e}")))
    };

    let id = Uuid::parse_str(&required(0, "id")?)
        .map_err(|e| DiffError::Internal(format!("bad job id in store: {e}")))?;
    let kind = JobKind::parse(&required(1, "kind")?)
        .ok_or_else(|| DiffError::Internal("bad job kind in store".into()))?;
    let state = JobState::parse(&required(2, "state")?)
        .ok_or_else(|| DiffError::Internal("bad job state in store".into()))?;
    let config = serde_json::from_str(&required(3, "config")?)
        .map_err(|e| DiffError::Internal(format!("bad job config in store: {e}")))?;
    let warnings = text(4)
        .and_then(|w| serde_json::from_str(&w).ok())
        .unwrap_or_default();
    let summary = text(10).and_then(|extras| serde_json::from_str::<Summary>(&extras).ok());

    Ok(Job {
        id,
        kind,
        state,
        config,
        warnings,
        error_kind: text(5),
        error: text(6),
        created_ts: parse_ts(required(7, "created_ts")?)?,
        started_ts: text(8).map(parse_ts).transpose()?,
        finished_ts: text(9).map(parse_ts).transpose()?,
        summary,
    })
}

/// Accept both `sqlite://relative.db` and bare paths; make sure sqlite
/// files are created on first use.
fn normalize_store_url(url: &str) -> String {
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.contains(":memory:") {
            return "sqlite::memory:".to_string();
        }
        if url.contains('?') {
            return url.to_string();
        }
        return format!("sqlite://{path}?mode=rwc");
    }
    url.to_string()
}
