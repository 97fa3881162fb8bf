//! Exact outer-join diff.
//!
//! When both tables live in the same store, a single full outer join on
//! the key tuple yields the exact row-level diff in one query: each side
//! is projected to `(presence marker, canonical keys, canonical values)`,
//! joined null-safely, and filtered to rows where either marker is absent
//! or any canonical value pair differs.
//!
//! FULL OUTER JOIN is composed as LEFT JOIN ∪ right anti-join on engines
//! without native support. Result semantics are identical to the hash
//! diff; only the failure mode differs (one long query instead of many
//! short ones).

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use serde_json::Value;

use crate::diff::{self, CancelFlag, DiffCounters, DiffKind, DiffRow, DiffSink};
use crate::error::DiffError;
use crate::segment::TableSegment;
use crate::types::{self, ValueCompareOptions};

/// Tunables for one join-diff run.
#[derive(Debug, Clone, Default)]
pub struct JoinDiffOptions {
    pub compare: ValueCompareOptions,
    pub batch_size: usize,
}

/// Run the outer-join diff over one segment pair.
pub async fn join_diff(
    source: TableSegment,
    target: TableSegment,
    opts: JoinDiffOptions,
    cancel: CancelFlag,
    sink: DiffSink,
    counters: Arc<DiffCounters>,
) -> Result<(), DiffError> {
    if source.driver.descriptor().fingerprint() != target.driver.descriptor().fingerprint() {
        return Err(DiffError::InvalidConfig(
            "join algorithm requires both tables in the same store; use hash instead".into(),
        ));
    }
    if source.key_columns.len() != target.key_columns.len()
        || source.value_columns.len() != target.value_columns.len()
    {
        return Err(DiffError::Internal(
            "join diff called with misaligned column plans".into(),
        ));
    }

    cancel.check()?;
    counters.record_round_trip();
    let count_out = source.driver.query_with_retry(&source.count_sql()).await?;
    let source_count: u64 = count_out
        .rows
        .first()
        .and_then(|r| r.first())
        .and_then(|v| match v {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_u64(),
            _ => None,
        })
        .ok_or_else(|| DiffError::QueryFailure("count query returned no usable row".into()))?;

    cancel.check()?;
    counters.record_round_trip();
    let sql = join_sql(&source, &target);
    let out = source.driver.query_with_retry(&sql).await?;

    let k = source.key_columns.len();
    let v = source.value_columns.len();
    let mut exclusive_source: u64 = 0;
    let mut exclusive_target: u64 = 0;
    let mut mismatched: u64 = 0;
    let mut batch: Vec<DiffRow> = Vec::new();
    let batch_size = opts.batch_size.max(1);

    for row in &out.rows {
        let source_present = !cell(row, 0).is_null();
        let target_present = !cell(row, 1).is_null();

        let key_cells = if source_present { 2..2 + k } else { 2 + k..2 + 2 * k };
        let key: Vec<Value> = key_cells
            .clone()
            .zip(&source.key_columns)
            .map(|(i, col)| decode_cell(&col.canon, cell(row, i)))
            .collect();

        match (source_present, target_present) {
            (true, false) => {
                exclusive_source += 1;
                batch.push(DiffRow {
                    kind: DiffKind::ExclusiveSource,
                    key,
                    column: None,
                    source_value: None,
                    target_value: None,
                });
            }
            (false, true) => {
                exclusive_target += 1;
                batch.push(DiffRow {
                    kind: DiffKind::ExclusiveTarget,
                    key,
                    column: None,
                    source_value: None,
                    target_value: None,
                });
            }
            (true, true) => {
                let mut row_differs = false;
                for (vi, col) in source.value_columns.iter().enumerate() {
                    let sv = decode_cell(&col.canon, cell(row, 2 + 2 * k + vi));
                    let tv = decode_cell(&col.canon, cell(row, 2 + 2 * k + v + vi));
                    if !types::value_equal(&col.canon, &sv, &tv, opts.compare) {
                        row_differs = true;
                        batch.push(DiffRow {
                            kind: DiffKind::ValueMismatch,
                            key: key.clone(),
                            column: Some(col.name.clone()),
                            source_value: Some(sv),
                            target_value: Some(tv),
                        });
                    }
                }
                // The SQL filter compares exactly; a tolerance may absorb
                // the difference client-side, leaving the row matched.
                if row_differs {
                    mismatched += 1;
                }
            }
            (false, false) => {
                return Err(DiffError::Internal(
                    "outer join returned a row absent from both sides".into(),
                ));
            }
        }

        if batch.len() >= batch_size {
            diff::send_batch(&sink, std::mem::take(&mut batch)).await?;
        }
    }
    if !batch.is_empty() {
        diff::send_batch(&sink, batch).await?;
    }

    let compared = source_count + exclusive_target;
    // Saturating: a concurrent writer can skew the count round trip
    // relative to the join snapshot.
    let matched = compared.saturating_sub(exclusive_source + exclusive_target + mismatched);
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

fn cell<'a>(row: &'a [Value], idx: usize) -> &'a Value {
    row.get(idx).unwrap_or(&Value::Null)
}

fn decode_cell(canon: &types::Canonical, v: &Value) -> Value {
    let text = match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    };
    types::decode_text(canon, text)
}

/// One side's projection: presence marker, canonical keys, canonical
/// values.
fn side_subquery(segment: &TableSegment) -> String {
    let d = segment.driver.dialect();
    let mut proj = vec!["1 AS __cd_p".to_string()];
    for (i, col) in segment.key_columns.iter().enumerate() {
        let quoted = d.quote_ident(&col.name);
        proj.push(format!(
            "{} AS __cd_k{i}",
            d.canonical_expr(&col.canon, &quoted, segment.case_insensitive)
        ));
    }
    for (i, col) in segment.value_columns.iter().enumerate() {
        let quoted = d.quote_ident(&col.name);
        proj.push(format!(
            "{} AS __cd_v{i}",
            d.canonical_expr(&col.canon, &quoted, segment.case_insensitive)
        ));
    }
    format!(
        "SELECT {} FROM {} WHERE {}",
        proj.join(", "),
        segment.qualified_name(),
        segment.where_clause()
    )
}

/// The full diff query, FULL OUTER JOIN where the engine has it, the
/// LEFT JOIN ∪ right-anti-join composition otherwise.
fn join_sql(source: &TableSegment, target: &TableSegment) -> String {
    let d = source.driver.dialect();
    let k = source.key_columns.len();
    let v = source.value_columns.len();
    let sub_s = side_subquery(source);
    let sub_t = side_subquery(target);

    let join_cond = (0..k)
        .map(|i| d.null_safe_eq(&format!("__cd_s.__cd_k{i}"), &format!("__cd_t.__cd_k{i}")))
        .collect::<Vec<_>>()
        .join(" AND ");

    let values_equal = (0..v)
        .map(|i| d.null_safe_eq(&format!("__cd_s.__cd_v{i}"), &format!("__cd_t.__cd_v{i}")))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut proj = vec![
        "__cd_s.__cd_p AS __cd_sp".to_string(),
        "__cd_t.__cd_p AS __cd_tp".to_string(),
    ];
    for i in 0..k {
        proj.push(format!("__cd_s.__cd_k{i} AS __cd_sk{i}"));
    }
    for i in 0..k {
        proj.push(format!("__cd_t.__cd_k{i} AS __cd_tk{i}"));
    }
    for i in 0..v {
        proj.push(format!("__cd_s.__cd_v{i} AS __cd_sv{i}"));
    }
    for i in 0..v {
        proj.push(format!("__cd_t.__cd_v{i} AS __cd_tv{i}"));
    }
    let proj = proj.join(", ");

    if d.supports_full_join() {
        let filter = if v == 0 {
            "__cd_s.__cd_p IS NULL OR __cd_t.__cd_p IS NULL".to_string()
        } else {
            format!(
                "__cd_s.__cd_p IS NULL OR __cd_t.__cd_p IS NULL OR NOT ({values_equal})"
            )
        };
        return format!(
            "SELECT {proj} FROM ({sub_s}) __cd_s \
             FULL OUTER JOIN ({sub_t}) __cd_t ON {join_cond} \
             WHERE {filter}"
        );
    }

    // FULL OUTER JOIN = LEFT JOIN (matched + exclusive-source) ∪ right
    // anti-join (exclusive-target).
    let left_filter = if v == 0 {
        "__cd_t.__cd_p IS NULL".to_string()
    } else {
        format!("__cd_t.__cd_p IS NULL OR NOT ({values_equal})")
    };
    let mut anti_proj = vec![
        "NULL AS __cd_sp".to_string(),
        "__cd_t.__cd_p AS __cd_tp".to_string(),
    ];
    for i in 0..k {
        anti_proj.push(format!("NULL AS __cd_sk{i}"));
    }
    for i in 0..k {
        anti_proj.push(format!("__cd_t.__cd_k{i} AS __cd_tk{i}"));
    }
    for i in 0..v {
        anti_proj.push(format!("NULL AS __cd_sv{i}"));
    }
    for i in 0..v {
        anti_proj.push(format!("__cd_t.__cd_v{i} AS __cd_tv{i}"));
    }
    format!(
        "SELECT {proj} FROM ({sub_s}) __cd_s \
         LEFT JOIN ({sub_t}) __cd_t ON {join_cond} \
         WHERE {left_filter} \
         UNION ALL \
         SELECT {} FROM ({sub_t}) __cd_t \
         LEFT JOIN ({sub_s}) __cd_s ON {join_cond} \
         WHERE __cd_s.__cd_p IS NULL",
        anti_proj.join(", ")
    )
}
