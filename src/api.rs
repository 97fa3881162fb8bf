//! HTTP control plane.
//!
//! Deserialisation, validation, and dispatch to the scheduler — no
//! business logic. All bodies are JSON; every request is measured into
//! the metrics registry via middleware.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::descriptor::ConnDescriptor;
use crate::driver;
use crate::error::{DiffError, ErrorKind};
use crate::job::{CompareRequest, JobState, SchemaCompareRequest};
use crate::monitor;
use crate::scheduler::Scheduler;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Build the router with every control-plane route mounted.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/connections/test", post(connections_test))
        .route("/api/v1/tables/list", post(tables_list))
        .route("/api/v1/query/execute", post(query_execute))
        .route("/api/v1/compare/tables/nested", post(compare_tables))
        .route("/api/v1/compare/results/{id}", get(compare_results))
        .route("/api/v1/compare/cancel/{id}", post(compare_cancel))
        .route("/api/v1/compare/schemas/nested", post(compare_schemas))
        .route("/api/v1/compare/history", get(compare_history))
        .layer(middleware::from_fn(track_request))
        .with_state(state)
}

/// Serve until shutdown.
pub async fn serve(state: AppState, listen: &str) -> Result<(), DiffError> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| DiffError::InvalidConfig(format!("cannot bind {listen}: {e}")))?;
    tracing::info!(listen, "control plane listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| DiffError::Internal(format!("http server: {e}")))
}

/// Request metrics middleware: method, matched route pattern, status.
async fn track_request(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();
    let response = next.run(req).await;
    monitor::metrics().observe_request(
        &method,
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

// ── Error mapping ──────────────────────────────────────────────────────────

/// Wrapper turning `DiffError` into an HTTP response.
struct ApiError(DiffError);

impl From<DiffError> for ApiError {
    fn from(e: DiffError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::InvalidConfig
            | ErrorKind::Unsupported
            | ErrorKind::TypeIncompatible => StatusCode::BAD_REQUEST,
            ErrorKind::NoSuchObject => StatusCode::NOT_FOUND,
            ErrorKind::Unreachable
            | ErrorKind::AuthFailure
            | ErrorKind::PermissionDenied
            | ErrorKind::QueryFailure
            | ErrorKind::PoolExhausted => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = %kind, "request failed");
        }
        (
            status,
            Json(json!({
                "error": self.0.to_string(),
                "kind": kind.as_str(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics_endpoint() -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; version=0.0.4")],
        monitor::metrics().render(),
    )
}

/// `POST /api/v1/connections/test` — 200 with `success: false` on a
/// failing endpoint, 4xx only for malformed descriptors.
async fn connections_test(
    State(state): State<AppState>,
    Json(descriptor): Json<ConnDescriptor>,
) -> ApiResult<Json<Value>> {
    let opened = driver::open(&descriptor, state.scheduler.settings()).await;
    let probed = match opened {
        Ok(d) => d.ping().await,
        Err(e) => Err(e),
    };
    Ok(Json(match probed {
        Ok(()) => json!({"success": true}),
        Err(e @ DiffError::InvalidConfig(_)) => return Err(e.into()),
        Err(e) => json!({
            "success": false,
            "error": e.kind().as_str(),
            "detail": e.to_string(),
        }),
    }))
}

#[derive(Deserialize)]
struct TablesListRequest {
    #[serde(flatten)]
    connection: ConnDescriptor,
    #[serde(default)]
    namespace: Option<String>,
}

async fn tables_list(
    State(state): State<AppState>,
    Json(req): Json<TablesListRequest>,
) -> ApiResult<Json<Value>> {
    let driver = driver::open(&req.connection, state.scheduler.settings()).await?;
    let tables = driver.list_tables(req.namespace.as_deref()).await?;
    Ok(Json(json!({ "tables": tables })))
}

#[derive(Deserialize)]
struct QueryExecuteRequest {
    connection: ConnDescriptor,
    query: String,
}

/// `POST /api/v1/query/execute`. Included for parity; outside the
/// correctness guarantees. With `read_only_queries` set, statements that
/// do not read are refused.
async fn query_execute(
    State(state): State<AppState>,
    Json(req): Json<QueryExecuteRequest>,
) -> ApiResult<Json<Value>> {
    if state.scheduler.settings().read_only_queries && !is_read_statement(&req.query) {
        return Err(DiffError::InvalidConfig(
            "only read statements are allowed on this endpoint".into(),
        )
        .into());
    }
    let driver = driver::open(&req.connection, state.scheduler.settings()).await?;
    match driver.query(&req.query).await {
        Ok(out) => {
            let rows: Vec<Value> = out
                .rows
                .iter()
                .map(|row| {
                    let obj: serde_json::Map<String, Value> = out
                        .columns
                        .iter()
                        .cloned()
                        .zip(row.iter().cloned())
                        .collect();
                    Value::Object(obj)
                })
                .collect();
            Ok(Json(json!({"success": true, "result": rows})))
        }
        Err(e) => Ok(Json(json!({
            "success": false,
            "result": [],
            "error": e.to_string(),
        }))),
    }
}

fn is_read_statement(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "WITH" | "PRAGMA" | "VALUES"
    )
}

/// `POST /api/v1/compare/tables/nested` — 202 Accepted with the job id.
async fn compare_tables(
    State(state): State<AppState>,
    Json(req): Json<CompareRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = state.scheduler.submit_table(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"comparison_id": id, "status": "pending"})),
    ))
}

#[derive(Deserialize)]
struct ResultsQuery {
    #[serde(default)]
    page: Option<u64>,
    #[serde(default)]
    page_size: Option<u64>,
}

/// `GET /api/v1/compare/results/{id}` — the full job record with its
/// summary, warnings, and one page of diff rows sorted by key.
async fn compare_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Json<Value>> {
    let job = state
        .scheduler
        .get(id)
        .await?
        .ok_or_else(|| DiffError::NoSuchObject(format!("comparison {id} not found")))?;

    let page = query.page.unwrap_or(0);
    let page_size = query.page_size.unwrap_or(100).clamp(1, 10_000);
    let store = state.scheduler.store();
    let rows = store.diff_rows(id, page * page_size, page_size).await?;
    let total = store.count_diff_rows(id).await?;

    let mut body = serde_json::to_value(&job)
        .map_err(|e| DiffError::Internal(format!("job serialisation: {e}")))?;
    if let Value::Object(map) = &mut body {
        map.insert(
            "diff_rows".to_string(),
            json!({
                "page": page,
                "page_size": page_size,
                "total": total,
                "rows": rows,
            }),
        );
        // summary = None on a terminal record means any persisted rows
        // are partial.
        map.insert(
            "partial".to_string(),
            json!(job.state == JobState::Failed && job.summary.is_none() && total > 0),
        );
    }
    Ok(Json(body))
}

/// `POST /api/v1/compare/cancel/{id}` — idempotent cooperative cancel.
async fn compare_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let known = state.scheduler.cancel(id).await?;
    if !known {
        return Err(DiffError::NoSuchObject(format!("comparison {id} not found")).into());
    }
    Ok(Json(json!({"cancelled": true})))
}

/// `POST /api/v1/compare/schemas/nested` — synchronous; schema jobs are
/// cheap.
async fn compare_schemas(
    State(state): State<AppState>,
    Json(req): Json<SchemaCompareRequest>,
) -> ApiResult<Json<Value>> {
    let diff = state.scheduler.run_schema(req).await?;
    Ok(Json(serde_json::to_value(diff).map_err(|e| {
        DiffError::Internal(format!("schema diff serialisation: {e}"))
    })?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    limit: Option<u64>,
}

async fn compare_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let filter = match query.state.as_deref() {
        None => None,
        Some(s) => Some(JobState::parse(s).ok_or_else(|| {
            DiffError::InvalidConfig(format!("unknown state filter {s:?}"))
        })?),
    };
    let jobs = state
        .scheduler
        .list(filter, query.limit.unwrap_or(50).clamp(1, 1_000))
        .await?;
    Ok(Json(json!({ "jobs": jobs })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_statement_guard() {
        assert!(is_read_statement("SELECT 1"));
        assert!(is_read_statement("  with x as (select 1) select * from x"));
        assert!(is_read_statement("EXPLAIN SELECT 1"));
        assert!(!is_read_statement("DELETE FROM t"));
        assert!(!is_read_statement("DROP TABLE t"));
        assert!(!is_read_statement("update t set x = 1"));
        assert!(!is_read_statement(""));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (DiffError::InvalidConfig("x".into()), StatusCode::BAD_REQUEST),
            (DiffError::NoSuchObject("x".into()), StatusCode::NOT_FOUND),
            (DiffError::Unreachable("x".into()), StatusCode::BAD_GATEWAY),
            (DiffError::AuthFailure("x".into()), StatusCode::BAD_GATEWAY),
            (DiffError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let resp = ApiError(err).into_response();
            assert_eq!(resp.status(), expected);
        }
    }
}
