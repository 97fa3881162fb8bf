//! Control-plane smoke tests over a real listener.
#![cfg(feature = "http-engines")] // reqwest doubles as the test client

mod common;

use std::time::Duration;

use crossdiff::api::{router, AppState};
use crossdiff::config::Settings;
use crossdiff::scheduler::Scheduler;
use crossdiff::store::ResultStore;
use serde_json::{json, Value};
use tempfile::TempDir;

use common::*;

async fn spawn_server() -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("store.db");
    let store = ResultStore::connect(&format!("sqlite://{}", store_path.display()))
        .await
        .unwrap();
    let scheduler = Scheduler::start(Settings::default(), store).await.unwrap();
    let app = router(AppState { scheduler });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (dir, format!("http://{addr}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_compare_flow_over_http() {
    let fx = sqlite_fixture("api_flow").await;
    seed_id_name(
        &fx.driver,
        "api_src",
        &[(1, Some("A")), (2, Some("B")), (3, Some("C"))],
    )
    .await;
    seed_id_name(
        &fx.driver,
        "api_tgt",
        &[(1, Some("A")), (2, Some("X")), (4, Some("D"))],
    )
    .await;

    let (_dir, base) = spawn_server().await;
    let client = reqwest::Client::new();

    // Submit: 202 with a pending id.
    let resp = client
        .post(format!("{base}/api/v1/compare/tables/nested"))
        .json(&json!({
            "source_config": fx.descriptor,
            "target_config": fx.descriptor,
            "comparison_config": {
                "source_table": "api_src",
                "target_table": "api_tgt",
                "key_columns": ["id"],
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    let id = body["comparison_id"].as_str().unwrap().to_string();

    // Poll until terminal.
    let mut result = Value::Null;
    for _ in 0..600 {
        let resp = client
            .get(format!("{base}/api/v1/compare/results/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        result = resp.json().await.unwrap();
        if result["state"] == "completed" || result["state"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(result["state"], "completed", "{result}");
    assert_eq!(result["summary"]["rows_compared"], 4);
    assert_eq!(result["summary"]["rows_different"], 3);
    assert_eq!(result["diff_rows"]["total"], 3);
    assert_eq!(result["diff_rows"]["rows"].as_array().unwrap().len(), 3);

    // History includes the finished job.
    let history: Value = client
        .get(format!("{base}/api/v1/compare/history?state=completed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .any(|j| j["id"] == id.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_test_and_tables_list() {
    let fx = sqlite_fixture("api_conn").await;
    seed_id_name(&fx.driver, "listed", &[(1, Some("a"))]).await;

    let (_dir, base) = spawn_server().await;
    let client = reqwest::Client::new();

    let ok: Value = client
        .post(format!("{base}/api/v1/connections/test"))
        .json(&fx.descriptor)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["success"], true);

    // A reachable endpoint failing auth/transport still returns 200 with
    // success=false.
    let bad: Value = client
        .post(format!("{base}/api/v1/connections/test"))
        .json(&json!({"dialect": "oracle"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bad["success"], false);

    let tables: Value = client
        .post(format!("{base}/api/v1/tables/list"))
        .json(&fx.descriptor)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tables["tables"], json!(["listed"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_execute_respects_read_only_guard() {
    let fx = sqlite_fixture("api_query").await;
    seed_id_name(&fx.driver, "q", &[(1, Some("a"))]).await;

    let (_dir, base) = spawn_server().await;
    let client = reqwest::Client::new();

    let ok: Value = client
        .post(format!("{base}/api/v1/query/execute"))
        .json(&json!({"connection": fx.descriptor, "query": "SELECT id FROM q"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["success"], true);
    assert_eq!(ok["result"].as_array().unwrap().len(), 1);

    let refused = client
        .post(format!("{base}/api/v1/query/execute"))
        .json(&json!({"connection": fx.descriptor, "query": "DELETE FROM q"}))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn schema_compare_is_synchronous() {
    let src_fx = sqlite_fixture("api_schema_src").await;
    let tgt_fx = sqlite_fixture("api_schema_tgt").await;
    exec(&src_fx.driver, "CREATE TABLE only_src (id INTEGER)").await;
    exec(&tgt_fx.driver, "CREATE TABLE only_tgt (id INTEGER)").await;

    let (_dir, base) = spawn_server().await;
    let client = reqwest::Client::new();
    let diff: Value = client
        .post(format!("{base}/api/v1/compare/schemas/nested"))
        .json(&json!({
            "source_config": src_fx.descriptor,
            "target_config": tgt_fx.descriptor,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(diff["tables_only_in_source"], json!(["only_src"]));
    assert_eq!(diff["tables_only_in_target"], json!(["only_tgt"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metrics_and_health_endpoints() {
    let (_dir, base) = spawn_server().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("api_request_total"), "{metrics}");
    assert!(metrics.contains("memory_usage_bytes"), "{metrics}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_result_id_is_404() {
    let (_dir, base) = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!(
            "{base}/api/v1/compare/results/{}",
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
