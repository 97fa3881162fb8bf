//! Job orchestrator.
//!
//! Owns the comparison job lifecycle: `submit` validates and persists a
//! `Pending` record, a dispatcher feeds a bounded worker pool (FIFO,
//! system-wide ceiling), and the owning worker drives the comparison,
//! streams diff rows through a single persistence writer, and writes the
//! terminal state exactly once.
//!
//! # Resilience
//! - **Crash recovery**: on startup, interrupted `Pending`/`Running`
//!   records are marked `Failed`.
//! - **Cancellation**: cooperative, checked at every recursion boundary;
//!   a cancelled job fails with `kind=Cancelled`, partial rows stay
//!   queryable, and the absent summary marks them partial.
//! - **Error classification**: transient SQL errors retry inside the
//!   driver; everything else fails the job with its kind recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::config::Settings;
use crate::diff::{CancelFlag, ColumnStats, DiffCounters, DiffRow};
use crate::driver::{self, ColumnInfo, Driver};
use crate::error::{DiffError, ErrorKind};
use crate::hashdiff::{self, HashDiffOptions};
use crate::job::{
    Algorithm, CompareRequest, ComparisonConfig, Job, JobKind, JobState, SchemaCompareRequest,
    Summary,
};
use crate::joindiff::{self, JoinDiffOptions};
use crate::monitor;
use crate::schemadiff::{self, SchemaDiff};
use crate::segment::{SegmentColumn, TableRef, TableSegment};
use crate::store::ResultStore;
use crate::types::{self, TypeCompat, ValueCompareOptions};

/// The job orchestrator handle.
pub struct Scheduler {
    settings: Settings,
    store: ResultStore,
    queue: mpsc::Sender<Uuid>,
    active: Mutex<HashMap<Uuid, CancelFlag>>,
}

impl Scheduler {
    /// Recover interrupted jobs, then start the dispatcher.
    pub async fn start(settings: Settings, store: ResultStore) -> Result<Arc<Self>, DiffError> {
        store.recover_interrupted().await?;

        let (queue, mut rx) = mpsc::channel::<Uuid>(1024);
        let scheduler = Arc::new(Self {
            settings,
            store,
            queue,
            active: Mutex::new(HashMap::new()),
        });

        let permits = Arc::new(Semaphore::new(scheduler.settings.max_concurrent_jobs));
        let dispatcher = Arc::clone(&scheduler);
        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let scheduler = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    scheduler.run_job(id).await;
                    drop(permit);
                });
            }
        });
        Ok(scheduler)
    }

    // ── Public surface ───────────────────────────────────────────────────

    /// Validate, persist a `Pending` record, enqueue, return immediately.
    pub async fn submit_table(&self, request: CompareRequest) -> Result<Uuid, DiffError> {
        validate_request(&request)?;
        let config = serde_json::to_value(&request)
            .map_err(|e| DiffError::Internal(format!("request serialisation: {e}")))?;
        let job = Job::new(JobKind::Table, config);
        let id = job.id;
        self.store.insert_job(&job).await?;
        self.track(id);
        self.queue
            .send(id)
            .await
            .map_err(|_| DiffError::Internal("job queue closed".into()))?;
        tracing::info!(job_id = %id, "comparison job submitted");
        Ok(id)
    }

    /// Schema comparison: cheap, synchronous, no job record.
    pub async fn run_schema(
        &self,
        request: SchemaCompareRequest,
    ) -> Result<SchemaDiff, DiffError> {
        let started = Instant::now();
        let source = driver::open(&request.source_config, &self.settings).await?;
        let target = driver::open(&request.target_config, &self.settings).await?;
        let (source_snap, target_snap) = tokio::try_join!(
            schemadiff::snapshot(source.as_ref(), request.source_namespaces.as_deref()),
            schemadiff::snapshot(target.as_ref(), request.target_namespaces.as_deref()),
        )?;
        let diff = schemadiff::diff(&source_snap, &target_snap);
        monitor::metrics()
            .comparison_duration_seconds
            .with_label_values(&["schema", "snapshot"])
            .observe(started.elapsed().as_secs_f64());
        Ok(diff)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, DiffError> {
        self.store.get_job(id).await
    }

    pub async fn list(
        &self,
        state: Option<JobState>,
        limit: u64,
    ) -> Result<Vec<Job>, DiffError> {
        self.store.list_jobs(state, limit).await
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Cooperative cancel. Idempotent; `false` only for unknown ids.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, DiffError> {
        let flagged = {
            let active = self
                .active
                .lock()
                .map_err(|_| DiffError::Internal("scheduler state poisoned".into()))?;
            active.get(&id).map(|flag| flag.cancel()).is_some()
        };
        if flagged {
            return Ok(true);
        }
        // Not in-flight here: fail a stored non-terminal record directly.
        match self.store.get_job(id).await? {
            Some(job) if !job.state.is_terminal() => {
                self.store
                    .fail_job(id, ErrorKind::Cancelled, "comparison cancelled", &[])
                    .await?;
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    // ── Worker ───────────────────────────────────────────────────────────

    fn track(&self, id: Uuid) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, CancelFlag::new());
        }
    }

    fn cancel_flag(&self, id: Uuid) -> CancelFlag {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.get(&id).cloned())
            .unwrap_or_default()
    }

    fn untrack(&self, id: Uuid) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&id);
        }
    }

    async fn run_job(&self, id: Uuid) {
        let cancel = self.cancel_flag(id);
        let outcome = self.execute_table_job(id, &cancel).await;
        match outcome {
            Ok(()) => {}
            Err(e) => {
                let kind = e.kind();
                tracing::warn!(job_id = %id, error = %e, kind = %kind, "comparison job failed");
                if let Err(store_err) = self
                    .store
                    .fail_job(id, kind, &e.to_string(), &[])
                    .await
                {
                    tracing::error!(job_id = %id, error = %store_err, "terminal state write failed");
                }
            }
        }
        self.untrack(id);
    }

    async fn execute_table_job(&self, id: Uuid, cancel: &CancelFlag) -> Result<(), DiffError> {
        let Some(job) = self.store.get_job(id).await? else {
            return Err(DiffError::Internal(format!("queued job {id} not found")));
        };
        if job.state != JobState::Pending {
            // Cancelled (or recovered) before a worker picked it up.
            return Ok(());
        }
        cancel.check()?;
        self.store.mark_running(id).await?;

        let request: CompareRequest = serde_json::from_value(job.config.clone())
            .map_err(|e| DiffError::InvalidConfig(format!("stored config: {e}")))?;
        let started = Instant::now();

        let plan = self.build_plan(&request, cancel).await?;
        let cfg = &request.comparison_config;
        let algorithm = cfg.algorithm;
        let materialize = cfg.materialize();

        let estimate = plan
            .source
            .driver
            .estimate_row_count(&plan.source)
            .await
            .unwrap_or(None);
        tracing::debug!(
            job_id = %id,
            source = %plan.source_label,
            target = %plan.target_label,
            algorithm = algorithm.as_str(),
            estimated_rows = estimate,
            "comparison plan ready"
        );

        // Single persistence writer: workers push batches through a
        // bounded channel, back-pressure included.
        let (sink, mut rx) = mpsc::channel::<Vec<DiffRow>>(64);
        let store = self.store.clone();
        let persist_timeout = self.settings.persist_timeout();
        let writer: tokio::task::JoinHandle<Result<u64, DiffError>> =
            tokio::spawn(async move {
                let mut written: u64 = 0;
                while let Some(batch) = rx.recv().await {
                    written += batch.len() as u64;
                    if materialize {
                        tokio::time::timeout(persist_timeout, store.append_diff_rows(id, &batch))
                            .await
                            .map_err(|_| {
                                DiffError::QueryFailure("diff row persist timed out".into())
                            })??;
                    }
                }
                Ok(written)
            });

        let counters = Arc::new(DiffCounters::default());
        let run_result = match algorithm {
            Algorithm::Hash => {
                let opts = HashDiffOptions {
                    bisection_threshold: cfg
                        .bisection_threshold
                        .unwrap_or(self.settings.bisection_threshold),
                    bisection_factor: cfg
                        .bisection_factor
                        .unwrap_or(self.settings.bisection_factor)
                        .max(2),
                    threads: self.settings.resolve_threads(cfg.threads),
                    compare: plan.compare_opts,
                    batch_size: self.settings.diff_batch_size,
                };
                hashdiff::hash_diff(
                    plan.source.clone(),
                    plan.target.clone(),
                    opts,
                    cancel.clone(),
                    sink,
                    Arc::clone(&counters),
                )
                .await
            }
            Algorithm::Join => {
                let opts = JoinDiffOptions {
                    compare: plan.compare_opts,
                    batch_size: self.settings.diff_batch_size,
                };
                joindiff::join_diff(
                    plan.source.clone(),
                    plan.target.clone(),
                    opts,
                    cancel.clone(),
                    sink,
                    Arc::clone(&counters),
                )
                .await
            }
        };
        let written = writer
            .await
            .map_err(|e| DiffError::Internal(format!("persistence writer panicked: {e}")))?;
        run_result?;
        let _ = written?;

        // Optional per-column statistics, one extra round trip per side.
        let mut null_rates = std::collections::BTreeMap::new();
        if cfg.enable_column_statistics.unwrap_or(false) {
            for (side, segment) in [("source", &plan.source), ("target", &plan.target)] {
                cancel.check()?;
                let stats = column_stats(segment).await?;
                if side == "source" {
                    for s in stats.values() {
                        null_rates.insert(s.column.clone(), s.null_rate);
                        monitor::metrics()
                            .column_null_rate
                            .with_label_values(&[&plan.source_label, &s.column])
                            .set(s.null_rate);
                    }
                }
                let flat: Vec<ColumnStats> = stats.into_values().collect();
                self.store.insert_column_stats(id, side, &flat).await?;
            }
        }

        let totals = counters.snapshot();
        let summary = Summary {
            rows_compared: totals.rows_compared,
            rows_matched: totals.rows_matched,
            rows_different: totals.rows_different(),
            match_rate: totals.match_rate(),
            exclusive_source: totals.exclusive_source,
            exclusive_target: totals.exclusive_target,
            mismatched_rows: totals.mismatched_rows,
            per_column_null_rates: null_rates,
            duration_ms: started.elapsed().as_millis() as u64,
            sql_round_trips: totals.round_trips,
        };
        self.store
            .complete_job(id, &summary, &plan.warnings)
            .await?;

        monitor::metrics().observe_comparison(
            "table",
            algorithm.as_str(),
            &plan.source_label,
            &plan.target_label,
            started.elapsed().as_secs_f64(),
            summary.rows_compared,
            summary.rows_different,
        );
        tracing::info!(
            job_id = %id,
            rows_compared = summary.rows_compared,
            rows_different = summary.rows_different,
            duration_ms = summary.duration_ms,
            "comparison job completed"
        );
        Ok(())
    }

    /// Open both drivers, introspect both tables, and unify the column
    /// plan the algorithms run against.
    async fn build_plan(
        &self,
        request: &CompareRequest,
        cancel: &CancelFlag,
    ) -> Result<ComparisonPlan, DiffError> {
        cancel.check()?;
        let cfg = &request.comparison_config;
        let source_driver = driver::open(&request.source_config, &self.settings).await?;
        let target_driver = driver::open(&request.target_config, &self.settings).await?;

        let source_table = parse_table(&cfg.source_table);
        let target_table = parse_table(cfg.target_table());
        let (source_cols, target_cols) = tokio::try_join!(
            source_driver.introspect_table(&source_table),
            target_driver.introspect_table(&target_table),
        )?;

        let plan = unify_columns(cfg, &source_cols, &target_cols)?;

        let mut source = TableSegment::new(
            Arc::clone(&source_driver),
            source_table,
            plan.keys.clone(),
            plan.values.clone(),
        );
        let mut target = TableSegment::new(
            target_driver,
            target_table,
            plan.keys,
            plan.values,
        );
        source.extra_columns = plan.extra.clone();
        target.extra_columns = plan.extra;
        source.case_insensitive = cfg.case_insensitive.unwrap_or(false);
        target.case_insensitive = source.case_insensitive;
        if let Some(pred) = &cfg.where_condition {
            source = source.with_predicate(pred);
            target = target.with_predicate(pred);
        }

        let mut warnings = plan.warnings;
        if cfg.algorithm == Algorithm::Hash {
            for segment in [&source, &target] {
                if segment.checksum_sql().is_none() {
                    warnings.push(format!(
                        "client-side-checksum: {} has no server-side hash",
                        segment.driver.dialect().kind()
                    ));
                }
            }
        }

        Ok(ComparisonPlan {
            source_label: source.table.to_string(),
            target_label: target.table.to_string(),
            source,
            target,
            compare_opts: ValueCompareOptions {
                tolerance: cfg.tolerance.unwrap_or(0.0),
                case_insensitive: cfg.case_insensitive.unwrap_or(false),
            },
            warnings,
        })
    }
}

struct ComparisonPlan {
    source: TableSegment,
    target: TableSegment,
    source_label: String,
    target_label: String,
    compare_opts: ValueCompareOptions,
    warnings: Vec<String>,
}

struct ColumnPlan {
    keys: Vec<SegmentColumn>,
    values: Vec<SegmentColumn>,
    extra: Vec<String>,
    warnings: Vec<String>,
}

fn validate_request(request: &CompareRequest) -> Result<(), DiffError> {
    let cfg = &request.comparison_config;
    if cfg.source_table.trim().is_empty() {
        return Err(DiffError::InvalidConfig("source_table must not be empty".into()));
    }
    if cfg.key_columns.is_empty() {
        return Err(DiffError::InvalidConfig(
            "at least one key column is required".into(),
        ));
    }
    if cfg.algorithm == Algorithm::Join
        && request.source_config.fingerprint() != request.target_config.fingerprint()
    {
        return Err(DiffError::InvalidConfig(
            "join algorithm requires both tables in the same store".into(),
        ));
    }
    if let Some(t) = cfg.tolerance {
        if !(t >= 0.0) {
            return Err(DiffError::InvalidConfig("tolerance must be >= 0".into()));
        }
    }
    Ok(())
}

/// Split `"ns.table"` into a table reference.
fn parse_table(name: &str) -> TableRef {
    match name.split_once('.') {
        Some((ns, table)) => TableRef::new(Some(ns.to_string()), table),
        None => TableRef::new(None, name),
    }
}

/// Resolve key and value columns across both sides, with the unified
/// canonical type per pair. Missing requested columns fail; incompatible
/// columns are excluded with a warning (explicitly requested ones flag
/// the job rather than failing it); lossy pairs warn and compare at the
/// coarser precision.
fn unify_columns(
    cfg: &ComparisonConfig,
    source: &[ColumnInfo],
    target: &[ColumnInfo],
) -> Result<ColumnPlan, DiffError> {
    let source_by_name: HashMap<&str, &ColumnInfo> =
        source.iter().map(|c| (c.name.as_str(), c)).collect();
    let target_by_name: HashMap<&str, &ColumnInfo> =
        target.iter().map(|c| (c.name.as_str(), c)).collect();
    let mut warnings = Vec::new();

    // Keys: must exist on both sides, be totally orderable, and unify.
    let mut keys = Vec::new();
    for name in &cfg.key_columns {
        let s = source_by_name.get(name.as_str()).ok_or_else(|| {
            DiffError::NoSuchObject(format!("key column {name} missing on the source side"))
        })?;
        let t = target_by_name.get(name.as_str()).ok_or_else(|| {
            DiffError::NoSuchObject(format!("key column {name} missing on the target side"))
        })?;
        let unified = types::unify(&s.canon, &t.canon).ok_or_else(|| {
            DiffError::TypeIncompatible {
                column: name.clone(),
                source_type: s.raw_type.clone(),
                target_type: t.raw_type.clone(),
            }
        })?;
        if !unified.is_orderable() {
            return Err(DiffError::InvalidConfig(format!(
                "key column {name} has no total order ({})",
                unified
            )));
        }
        keys.push(SegmentColumn::new(name.clone(), unified));
    }

    // Value columns: the explicit compare set, or every common column
    // minus keys and exclusions.
    let excluded: Vec<&str> = cfg
        .exclude_columns
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();
    let requested: Option<Vec<&str>> = cfg
        .compare_columns
        .as_ref()
        .map(|cols| cols.iter().map(String::as_str).collect());
    let candidates: Vec<&str> = match &requested {
        Some(cols) => cols.clone(),
        None => source
            .iter()
            .map(|c| c.name.as_str())
            .filter(|n| target_by_name.contains_key(n))
            .collect(),
    };

    let mut values = Vec::new();
    let mut extra = Vec::new();
    for name in candidates {
        if cfg.key_columns.iter().any(|k| k == name) || excluded.contains(&name) {
            continue;
        }
        let explicitly_requested = requested.as_ref().is_some_and(|r| r.contains(&name));
        let (Some(s), Some(t)) = (source_by_name.get(name), target_by_name.get(name)) else {
            if explicitly_requested {
                return Err(DiffError::NoSuchObject(format!(
                    "compare column {name} missing on one side"
                )));
            }
            continue;
        };
        match types::compare(&s.canon, &t.canon) {
            TypeCompat::Incompatible => {
                if explicitly_requested {
                    warnings.push(format!("excluded-columns-requested: {name}"));
                }
                extra.push(name.to_string());
            }
            compat => {
                if compat == TypeCompat::Lossy {
                    warnings.push(format!(
                        "lossy-comparison: {name} ({} vs {})",
                        s.raw_type, t.raw_type
                    ));
                }
                let unified = types::unify(&s.canon, &t.canon).ok_or_else(|| {
                    DiffError::Internal(format!("comparable column {name} failed to unify"))
                })?;
                values.push(SegmentColumn::new(name.to_string(), unified));
            }
        }
    }

    Ok(ColumnPlan {
        keys,
        values,
        extra,
        warnings,
    })
}

async fn column_stats(
    segment: &TableSegment,
) -> Result<HashMap<String, ColumnStats>, DiffError> {
    let columns = segment.compared_columns();
    let sql = segment.column_stats_sql(&columns);
    let out = segment.driver.query_with_retry(&sql).await?;
    let row = out
        .rows
        .first()
        .ok_or_else(|| DiffError::QueryFailure("column stats query returned no row".into()))?;
    Ok(crate::diff::parse_column_stats(&columns, row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ConnDescriptor, DialectKind};
    use crate::types::normalise;

    fn info(name: &str, raw: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            raw_type: raw.to_string(),
            canon: normalise(raw),
            nullable: true,
            is_key_hint: false,
        }
    }

    fn base_config() -> ComparisonConfig {
        serde_json::from_value(serde_json::json!({
            "source_table": "orders",
            "key_columns": ["id"],
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_table_with_namespace() {
        let t = parse_table("public.orders");
        assert_eq!(t.namespace.as_deref(), Some("public"));
        assert_eq!(t.name, "orders");
        let bare = parse_table("orders");
        assert!(bare.namespace.is_none());
    }

    #[test]
    fn test_validate_rejects_empty_keys() {
        let mut cfg = base_config();
        cfg.key_columns.clear();
        let req = CompareRequest {
            source_config: ConnDescriptor::new(DialectKind::Sqlite),
            target_config: ConnDescriptor::new(DialectKind::Sqlite),
            comparison_config: cfg,
        };
        assert!(matches!(
            validate_request(&req),
            Err(DiffError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_join_requires_same_store() {
        let mut cfg = base_config();
        cfg.algorithm = Algorithm::Join;
        let mut other = ConnDescriptor::new(DialectKind::Sqlite);
        other.database = Some("elsewhere.db".into());
        let req = CompareRequest {
            source_config: ConnDescriptor::new(DialectKind::Sqlite),
            target_config: other,
            comparison_config: cfg,
        };
        assert!(matches!(
            validate_request(&req),
            Err(DiffError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unify_columns_defaults_to_common_columns() {
        let cfg = base_config();
        let source = vec![info("id", "bigint"), info("name", "text"), info("only_src", "text")];
        let target = vec![info("id", "bigint"), info("name", "varchar(20)")];
        let plan = unify_columns(&cfg, &source, &target).unwrap();
        assert_eq!(plan.keys.len(), 1);
        assert_eq!(plan.values.len(), 1);
        assert_eq!(plan.values[0].name, "name");
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_unify_columns_missing_key_fails() {
        let cfg = base_config();
        let source = vec![info("id", "bigint")];
        let target = vec![info("other", "bigint")];
        assert!(matches!(
            unify_columns(&cfg, &source, &target),
            Err(DiffError::NoSuchObject(_))
        ));
    }

    #[test]
    fn test_unify_columns_lossy_warns() {
        let cfg = base_config();
        let source = vec![info("id", "bigint"), info("amount", "numeric(18,4)")];
        let target = vec![info("id", "bigint"), info("amount", "double precision")];
        let plan = unify_columns(&cfg, &source, &target).unwrap();
        assert_eq!(plan.values.len(), 1);
        assert!(plan.warnings.iter().any(|w| w.starts_with("lossy-comparison: amount")));
    }

    #[test]
    fn test_unify_columns_opaque_excluded_silently() {
        let cfg = base_config();
        let source = vec![info("id", "bigint"), info("payload", "jsonb")];
        let target = vec![info("id", "bigint"), info("payload", "jsonb")];
        let plan = unify_columns(&cfg, &source, &target).unwrap();
        assert!(plan.values.is_empty());
        assert_eq!(plan.extra, vec!["payload"]);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_unify_columns_requested_opaque_warns() {
        let mut cfg = base_config();
        cfg.compare_columns = Some(vec!["payload".to_string()]);
        let source = vec![info("id", "bigint"), info("payload", "jsonb")];
        let target = vec![info("id", "bigint"), info("payload", "jsonb")];
        let plan = unify_columns(&cfg, &source, &target).unwrap();
        assert!(plan.values.is_empty());
        assert!(plan
            .warnings
            .iter()
            .any(|w| w.starts_with("excluded-columns-requested: payload")));
    }

    #[test]
    fn test_unify_columns_requested_missing_fails() {
        let mut cfg = base_config();
        cfg.compare_columns = Some(vec!["ghost".to_string()]);
        let source = vec![info("id", "bigint")];
        let target = vec![info("id", "bigint")];
        assert!(matches!(
            unify_columns(&cfg, &source, &target),
            Err(DiffError::NoSuchObject(_))
        ));
    }

    #[test]
    fn test_unify_columns_exclusions_apply() {
        let mut cfg = base_config();
        cfg.exclude_columns = Some(vec!["updated_at".to_string()]);
        let source = vec![
            info("id", "bigint"),
            info("name", "text"),
            info("updated_at", "timestamptz"),
        ];
        let target = source.clone();
        let plan = unify_columns(&cfg, &source, &target).unwrap();
        assert_eq!(plan.values.len(), 1);
        assert_eq!(plan.values[0].name, "name");
    }

    #[test]
    fn test_unify_columns_incompatible_key_fails() {
        let cfg = base_config();
        let source = vec![info("id", "bigint")];
        let target = vec![info("id", "text")];
        assert!(matches!(
            unify_columns(&cfg, &source, &target),
            Err(DiffError::TypeIncompatible { .. })
        ));
    }
}
