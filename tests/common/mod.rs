//! Shared fixtures: sqlite-backed tables driven through the real driver
//! stack, so the integration tests exercise introspection, canonical
//! projections, and both diff algorithms end to end.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use crossdiff::config::Settings;
use crossdiff::descriptor::{ConnDescriptor, DialectKind};
use crossdiff::diff::{DiffKind, DiffRow};
use crossdiff::driver::{self, Driver};
use crossdiff::segment::{SegmentColumn, TableRef, TableSegment};
use crossdiff::types;

/// A sqlite database in a fresh temp directory.
pub struct Fixture {
    pub dir: TempDir,
    pub descriptor: ConnDescriptor,
    pub driver: Arc<dyn Driver>,
}

pub async fn sqlite_fixture(name: &str) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(format!("{name}.db"));
    let mut descriptor = ConnDescriptor::new(DialectKind::Sqlite);
    descriptor.database = Some(path.display().to_string());
    let driver = driver::open(&descriptor, &Settings::default())
        .await
        .expect("open sqlite fixture");
    Fixture {
        dir,
        descriptor,
        driver,
    }
}

pub async fn exec(driver: &Arc<dyn Driver>, sql: &str) {
    driver.query(sql).await.expect(sql);
}

/// `CREATE TABLE {name} (id INTEGER PRIMARY KEY, name TEXT)` plus rows.
pub async fn seed_id_name(driver: &Arc<dyn Driver>, table: &str, rows: &[(i64, Option<&str>)]) {
    exec(
        driver,
        &format!("CREATE TABLE \"{table}\" (id INTEGER PRIMARY KEY, name TEXT)"),
    )
    .await;
    for (id, name) in rows {
        let name_lit = match name {
            Some(n) => format!("'{}'", n.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        exec(
            driver,
            &format!("INSERT INTO \"{table}\" (id, name) VALUES ({id}, {name_lit})"),
        )
        .await;
    }
}

/// Segment over an `(id, name)` table.
pub fn id_name_segment(driver: Arc<dyn Driver>, table: &str) -> TableSegment {
    TableSegment::new(
        driver,
        TableRef::new(None, table),
        vec![SegmentColumn::new("id", types::normalise("bigint"))],
        vec![SegmentColumn::new("name", types::normalise("text"))],
    )
}

/// Drain a diff receiver into a flat row list.
pub async fn drain(
    mut rx: tokio::sync::mpsc::Receiver<Vec<DiffRow>>,
) -> Vec<DiffRow> {
    let mut out = Vec::new();
    while let Some(batch) = rx.recv().await {
        out.extend(batch);
    }
    out
}

/// Order-insensitive multiset comparison key.
pub fn multiset_key(rows: &[DiffRow]) -> Vec<String> {
    let mut keys: Vec<String> = rows
        .iter()
        .map(|r| {
            format!(
                "{:?}|{}|{}|{}|{}",
                r.kind,
                serde_json::to_string(&r.key).unwrap(),
                r.column.as_deref().unwrap_or(""),
                r.source_value
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                r.target_value
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            )
        })
        .collect();
    keys.sort();
    keys
}

pub fn count_kind(rows: &[DiffRow], kind: DiffKind) -> usize {
    rows.iter().filter(|r| r.kind == kind).count()
}
