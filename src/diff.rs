//! Shared comparison machinery: diff rows, counters, cooperative
//! cancellation, and the leaf merge-join both algorithms bottom out in.
//!
//! Diff rows flow through a bounded channel to a single persistence
//! writer; the recursion itself shares nothing mutable beyond the atomic
//! counters.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::DiffError;
use crate::segment::{compare_key_tuples, KeyTuple, SegmentColumn};
use crate::types::{self, ValueCompareOptions};

/// Classification of one reported divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffKind {
    ExclusiveSource,
    ExclusiveTarget,
    ValueMismatch,
}

impl DiffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffKind::ExclusiveSource => "exclusive-source",
            DiffKind::ExclusiveTarget => "exclusive-target",
            DiffKind::ValueMismatch => "value-mismatch",
        }
    }
}

/// A single reported divergence: an exclusive row on one side, or one
/// column's value mismatch on a common row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRow {
    pub kind: DiffKind,
    pub key: KeyTuple,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_value: Option<Value>,
}

/// Cooperative cancellation flag, checked at every recursion boundary and
/// before every SQL round trip. In-flight statements are never aborted;
/// the worker exits after the current query returns.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }

    pub fn check(&self) -> Result<(), DiffError> {
        if self.is_cancelled() {
            Err(DiffError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Shared, lock-free comparison counters.
#[derive(Debug, Default)]
pub struct DiffCounters {
    pub rows_compared: AtomicU64,
    pub rows_matched: AtomicU64,
    pub exclusive_source: AtomicU64,
    pub exclusive_target: AtomicU64,
    pub mismatched_rows: AtomicU64,
    pub round_trips: AtomicU64,
}

impl DiffCounters {
    pub fn record_matched(&self, rows: u64) {
        self.rows_compared.fetch_add(rows, AtomicOrdering::Relaxed);
        self.rows_matched.fetch_add(rows, AtomicOrdering::Relaxed);
    }

    pub fn record_round_trip(&self) {
        self.round_trips.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> DiffTotals {
        DiffTotals {
            rows_compared: self.rows_compared.load(AtomicOrdering::Relaxed),
            rows_matched: self.rows_matched.load(AtomicOrdering::Relaxed),
            exclusive_source: self.exclusive_source.load(AtomicOrdering::Relaxed),
            exclusive_target: self.exclusive_target.load(AtomicOrdering::Relaxed),
            mismatched_rows: self.mismatched_rows.load(AtomicOrdering::Relaxed),
            round_trips: self.round_trips.load(AtomicOrdering::Relaxed),
        }
    }
}

/// A point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffTotals {
    pub rows_compared: u64,
    pub rows_matched: u64,
    pub exclusive_source: u64,
    pub exclusive_target: u64,
    pub mismatched_rows: u64,
    pub round_trips: u64,
}

impl DiffTotals {
    /// `rows_different = |exclusive-source| + |exclusive-target| +
    /// |value-mismatched rows|`, always.
    pub fn rows_different(&self) -> u64 {
        self.exclusive_source + self.exclusive_target + self.mismatched_rows
    }

    pub fn match_rate(&self) -> f64 {
        if self.rows_compared == 0 {
            1.0
        } else {
            self.rows_matched as f64 / self.rows_compared as f64
        }
    }
}

/// Batch sink from the comparison workers to the persistence writer.
pub type DiffSink = mpsc::Sender<Vec<DiffRow>>;

/// Compare two materialised row sets on their key tuples and emit diff
/// rows. Both algorithms bottom out here; rows arrive unordered and are
/// sorted client-side under the canonical key order.
///
/// A duplicate key tuple on either side fails the comparison with
/// `InvalidConfig`: the configured key does not uniquely identify rows.
pub async fn merge_compare(
    key_columns: &[SegmentColumn],
    value_columns: &[SegmentColumn],
    mut source_rows: Vec<Vec<Value>>,
    mut target_rows: Vec<Vec<Value>>,
    opts: ValueCompareOptions,
    counters: &DiffCounters,
    sink: &DiffSink,
    batch_size: usize,
) -> Result<(), DiffError> {
    let k = key_columns.len();
    let key_of = |row: &Vec<Value>| -> KeyTuple { row[..k.min(row.len())].to_vec() };
    let cmp = |a: &Vec<Value>, b: &Vec<Value>| -> Ordering {
        compare_key_tuples(key_columns, &key_of(a), &key_of(b))
    };
    source_rows.sort_by(cmp);
    target_rows.sort_by(cmp);
    reject_duplicate_keys(key_columns, &source_rows, "source")?;
    reject_duplicate_keys(key_columns, &target_rows, "target")?;

    let mut batch: Vec<DiffRow> = Vec::new();
    let mut si = 0;
    let mut ti = 0;
    let mut compared: u64 = 0;
    let mut matched: u64 = 0;
    let mut exclusive_source: u64 = 0;
    let mut exclusive_target: u64 = 0;
    let mut mismatched: u64 = 0;

    while si < source_rows.len() || ti < target_rows.len() {
        let order = match (source_rows.get(si), target_rows.get(ti)) {
            (Some(s), Some(t)) => cmp(s, t),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        compared += 1;
        match order {
            Ordering::Less => {
                batch.push(DiffRow {
                    kind: DiffKind::ExclusiveSource,
                    key: key_of(&source_rows[si]),
                    column: None,
                    source_value: None,
                    target_value: None,
                });
                exclusive_source += 1;
                si += 1;
            }
            Ordering::Greater => {
                batch.push(DiffRow {
                    kind: DiffKind::ExclusiveTarget,
                    key: key_of(&target_rows[ti]),
                    column: None,
                    source_value: None,
                    target_value: None,
                });
                exclusive_target += 1;
                ti += 1;
            }
            Ordering::Equal => {
                let srow = &source_rows[si];
                let trow = &target_rows[ti];
                let key = key_of(srow);
                let mut row_differs = false;
                for (vi, col) in value_columns.iter().enumerate() {
                    let sv = srow.get(k + vi).unwrap_or(&Value::Null);
                    let tv = trow.get(k + vi).unwrap_or(&Value::Null);
                    if !types::value_equal(&col.canon, sv, tv, opts) {
                        row_differs = true;
                        batch.push(DiffRow {
                            kind: DiffKind::ValueMismatch,
                            key: key.clone(),
                            column: Some(col.name.clone()),
                            source_value: Some(sv.clone()),
                            target_value: Some(tv.clone()),
                        });
                    }
                }
                if row_differs {
                    mismatched += 1;
                } else {
                    matched += 1;
                }
                si += 1;
                ti += 1;
            }
        }
        if batch.len() >= batch_size {
            send_batch(sink, std::mem::take(&mut batch)).await?;
        }
    }
    if !batch.is_empty() {
        send_batch(sink, batch).await?;
    }

    counters
        .rows_compared
        .fetch_add(compared, AtomicOrdering::Relaxed);
    counters
        .rows_matched
        .fetch_add(matched, AtomicOrdering::Relaxed);
    counters
        .exclusive_source
        .fetch_add(exclusive_source, AtomicOrdering::Relaxed);
    counters
        .exclusive_target
        .fetch_add(exclusive_target, AtomicOrdering::Relaxed);
    counters
        .mismatched_rows
        .fetch_add(mismatched, AtomicOrdering::Relaxed);
    Ok(())
}

pub(crate) async fn send_batch(sink: &DiffSink, batch: Vec<DiffRow>) -> Result<(), DiffError> {
    sink.send(batch)
        .await
        .map_err(|_| DiffError::Internal("diff sink closed before the comparison finished".into()))
}

fn reject_duplicate_keys(
    key_columns: &[SegmentColumn],
    sorted_rows: &[Vec<Value>],
    side: &str,
) -> Result<(), DiffError> {
    let k = key_columns.len();
    for pair in sorted_rows.windows(2) {
        let a: KeyTuple = pair[0][..k.min(pair[0].len())].to_vec();
        let b: KeyTuple = pair[1][..k.min(pair[1].len())].to_vec();
        if compare_key_tuples(key_columns, &a, &b) == Ordering::Equal {
            return Err(DiffError::InvalidConfig(format!(
                "key columns do not uniquely identify rows: duplicate key {} on the {side} side",
                serde_json::to_string(&a).unwrap_or_else(|_| "<key>".into())
            )));
        }
    }
    Ok(())
}

/// Render a key tuple as a stable sortable text form for persistence
/// ordering and indexing.
pub fn key_repr(key: &KeyTuple) -> String {
    key.iter()
        .map(|v| match v {
            Value::Null => "\u{0}".to_string(),
            Value::String(s) => s.clone(),
            // Bias into unsigned space and zero-pad so text ordering
            // tracks numeric ordering, negatives included.
            Value::Number(n) => match n.as_i64() {
                Some(v) => format!("{:020}", (v as i128 - i64::MIN as i128) as u128),
                None => format!("{:0>20}", n.to_string()),
            },
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\u{1e}")
}

/// Column null-rate statistics for one side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub null_count: u64,
    pub null_rate: f64,
    pub distinct_est: u64,
}

/// Accumulate per-column stats rows into a `{column -> stats}` map,
/// given the output of a stats round trip (total, then per column:
/// non-null count, distinct count).
pub fn parse_column_stats(
    columns: &[SegmentColumn],
    row: &[Value],
) -> HashMap<String, ColumnStats> {
    let total = row
        .first()
        .and_then(cell_u64)
        .unwrap_or(0);
    let mut out = HashMap::new();
    for (i, col) in columns.iter().enumerate() {
        let non_null = row.get(1 + 2 * i).and_then(cell_u64).unwrap_or(0);
        let distinct = row.get(2 + 2 * i).and_then(cell_u64).unwrap_or(0);
        let null_count = total.saturating_sub(non_null);
        out.insert(
            col.name.clone(),
            ColumnStats {
                column: col.name.clone(),
                null_count,
                null_rate: if total == 0 {
                    0.0
                } else {
                    null_count as f64 / total as f64
                },
                distinct_est: distinct,
            },
        );
    }
    out
}

fn cell_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
