//! Table segments.
//!
//! A [`TableSegment`] is an addressable rectangular slice of one table: a
//! qualified name, ordered key columns, value columns, an optional caller
//! predicate, and half-open key bounds (`min_key` inclusive, `max_key`
//! exclusive). Segments are values — cloning is cheap and splitting yields
//! disjoint children whose union is the parent.
//!
//! All SQL the comparison algorithms run is assembled here from the
//! segment's dialect primitives: the bound predicates must order exactly
//! like `types::compare_values` orders decoded keys (NULLs first), or
//! bisection would drop rows at child boundaries.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::dialect::{self, Dialect};
use crate::driver::Driver;
use crate::types::{self, Canonical};

/// A namespace-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self { namespace, name: name.into() }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One column participating in a comparison, carrying the unified
/// canonical type both sides agree to compare under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentColumn {
    pub name: String,
    pub canon: Canonical,
}

impl SegmentColumn {
    pub fn new(name: impl Into<String>, canon: Canonical) -> Self {
        Self { name: name.into(), canon }
    }
}

/// An ordered tuple of decoded key values.
pub type KeyTuple = Vec<Value>;

/// Compare two key tuples under the key columns' canonical types.
pub fn compare_key_tuples(keys: &[SegmentColumn], a: &KeyTuple, b: &KeyTuple) -> Ordering {
    for (i, col) in keys.iter().enumerate() {
        let av = a.get(i).unwrap_or(&Value::Null);
        let bv = b.get(i).unwrap_or(&Value::Null);
        match types::compare_values(&col.canon, av, bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// A key-bounded, predicate-filtered view of one table.
#[derive(Clone)]
pub struct TableSegment {
    pub driver: Arc<dyn Driver>,
    pub table: TableRef,
    /// Ordered, at least one; canonical types must be totally orderable.
    pub key_columns: Vec<SegmentColumn>,
    pub value_columns: Vec<SegmentColumn>,
    /// Reported in results but not diffed.
    pub extra_columns: Vec<String>,
    /// Caller-supplied WHERE fragment, passed through verbatim.
    pub predicate: Option<String>,
    /// Inclusive lower key bound.
    pub min_key: Option<KeyTuple>,
    /// Exclusive upper key bound.
    pub max_key: Option<KeyTuple>,
    pub case_insensitive: bool,
}

impl fmt::Debug for TableSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSegment")
            .field("table", &self.table)
            .field("keys", &self.key_columns.iter().map(|c| &c.name).collect::<Vec<_>>())
            .field("min_key", &self.min_key)
            .field("max_key", &self.max_key)
            .finish_non_exhaustive()
    }
}

impl TableSegment {
    pub fn new(
        driver: Arc<dyn Driver>,
        table: TableRef,
        key_columns: Vec<SegmentColumn>,
        value_columns: Vec<SegmentColumn>,
    ) -> Self {
        Self {
            driver,
            table,
            key_columns,
            value_columns,
            extra_columns: Vec::new(),
            predicate: None,
            min_key: None,
            max_key: None,
            case_insensitive: false,
        }
    }

    /// The segment's key bounds: `(min inclusive, max exclusive)`.
    pub fn bounds(&self) -> (Option<&KeyTuple>, Option<&KeyTuple>) {
        (self.min_key.as_ref(), self.max_key.as_ref())
    }

    /// A copy with an additional predicate ANDed in.
    pub fn with_predicate(&self, predicate: &str) -> Self {
        let mut out = self.clone();
        out.predicate = Some(match &self.predicate {
            Some(existing) => format!("({existing}) AND ({predicate})"),
            None => predicate.to_string(),
        });
        out
    }

    fn dialect(&self) -> &dyn Dialect {
        self.driver.dialect()
    }

    /// Key + value columns, in checksum/projection order.
    pub fn compared_columns(&self) -> Vec<SegmentColumn> {
        let mut cols = self.key_columns.clone();
        cols.extend(self.value_columns.iter().cloned());
        cols
    }

    // ── Splitting ────────────────────────────────────────────────────────

    /// Split at the given pivot keys into disjoint, ordered, covering
    /// children. Pivots outside `(min_key, max_key)`, duplicates, and
    /// pivots with NULL components are dropped; rows with NULL keys stay
    /// in the first child. Returns a single clone when no usable pivot
    /// remains.
    pub fn split_at(&self, pivots: &[KeyTuple]) -> Vec<TableSegment> {
        let mut usable: Vec<KeyTuple> = pivots
            .iter()
            .filter(|p| p.len() == self.key_columns.len())
            .filter(|p| !p.iter().any(Value::is_null))
            .filter(|p| self.contains_strictly(p))
            .cloned()
            .collect();
        usable.sort_by(|a, b| compare_key_tuples(&self.key_columns, a, b));
        usable.dedup();

        if usable.is_empty() {
            return vec![self.clone()];
        }

        let mut children = Vec::with_capacity(usable.len() + 1);
        let mut lower = self.min_key.clone();
        for pivot in usable {
            let mut child = self.clone();
            child.min_key = lower;
            child.max_key = Some(pivot.clone());
            children.push(child);
            lower = Some(pivot);
        }
        let mut last = self.clone();
        last.min_key = lower;
        last.max_key = self.max_key.clone();
        children.push(last);
        children
    }

    /// Whether a pivot lies strictly inside the current bounds.
    fn contains_strictly(&self, pivot: &KeyTuple) -> bool {
        if let Some(min) = &self.min_key {
            if compare_key_tuples(&self.key_columns, pivot, min) != Ordering::Greater {
                return false;
            }
        }
        if let Some(max) = &self.max_key {
            if compare_key_tuples(&self.key_columns, pivot, max) != Ordering::Less {
                return false;
            }
        }
        true
    }

    // ── SQL assembly ─────────────────────────────────────────────────────

    pub fn qualified_name(&self) -> String {
        self.dialect()
            .qualified_name(self.table.namespace.as_deref(), &self.table.name)
    }

    /// The full WHERE clause: caller predicate AND key bounds. Always
    /// non-empty (`1 = 1` when unconstrained) so builders can splice it.
    pub fn where_clause(&self) -> String {
        let d = self.dialect();
        let mut parts = Vec::new();
        if let Some(p) = &self.predicate {
            parts.push(format!("({p})"));
        }
        if let Some(min) = &self.min_key {
            parts.push(self.lex_bound(d, min, BoundSide::GreaterEq));
        }
        if let Some(max) = &self.max_key {
            parts.push(self.lex_bound(d, max, BoundSide::Less));
        }
        if parts.is_empty() {
            "1 = 1".to_string()
        } else {
            parts.join(" AND ")
        }
    }

    /// Lexicographic key-bound predicate with NULLS-FIRST semantics,
    /// mirroring `types::compare_values`.
    fn lex_bound(&self, d: &dyn Dialect, bound: &KeyTuple, side: BoundSide) -> String {
        let n = self.key_columns.len();
        let exprs: Vec<(String, &Canonical)> = self
            .key_columns
            .iter()
            .map(|c| {
                let quoted = d.quote_ident(&c.name);
                (d.order_expr(&c.canon, &quoted), &c.canon)
            })
            .collect();

        // Build from the last key column inward.
        let (last_expr, last_canon) = &exprs[n - 1];
        let last_val = bound.get(n - 1).unwrap_or(&Value::Null);
        let mut acc = match side {
            BoundSide::GreaterEq => or(
                gt(d, last_expr, last_canon, last_val),
                eq(d, last_expr, last_canon, last_val),
            ),
            BoundSide::Less => lt(d, last_expr, last_canon, last_val),
        };
        for i in (0..n - 1).rev() {
            let (expr, canon) = &exprs[i];
            let val = bound.get(i).unwrap_or(&Value::Null);
            let strict = match side {
                BoundSide::GreaterEq => gt(d, expr, canon, val),
                BoundSide::Less => lt(d, expr, canon, val),
            };
            acc = or(strict, format!("({} AND {acc})", eq(d, expr, canon, val)));
        }
        acc
    }

    /// Server-side `(count, sum)` checksum query, or `None` when the
    /// dialect has no SQL hash (driver then falls back to the canonical
    /// projection).
    pub fn checksum_sql(&self) -> Option<String> {
        let d = self.dialect();
        let cols: Vec<(String, Canonical)> = self
            .compared_columns()
            .iter()
            .map(|c| (d.quote_ident(&c.name), c.canon.clone()))
            .collect();
        let row = dialect::checksum_row_expr(d, &cols, self.case_insensitive)?;
        let t = d.text_type();
        Some(format!(
            "SELECT CAST(COUNT(*) AS {t}) AS __cd_count, \
             COALESCE(CAST(SUM(CAST({row} AS DECIMAL(38,0))) AS {t}), '0') AS __cd_sum \
             FROM {} WHERE {}",
            self.qualified_name(),
            self.where_clause()
        ))
    }

    /// Canonical-text projection of the given columns over this segment.
    pub fn projection_sql(&self, columns: &[SegmentColumn]) -> String {
        let d = self.dialect();
        let proj: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let quoted = d.quote_ident(&c.name);
                format!(
                    "{} AS __cd_c{i}",
                    d.canonical_expr(&c.canon, &quoted, self.case_insensitive)
                )
            })
            .collect();
        format!(
            "SELECT {} FROM {} WHERE {}",
            proj.join(", "),
            self.qualified_name(),
            self.where_clause()
        )
    }

    /// Systematic key sampling: every `stride`-th key in native key order,
    /// up to `n_pivots` rows. `total_count` comes from the checksum round
    /// trip that preceded the split.
    pub fn sample_keys_sql(&self, n_pivots: u64, total_count: u64) -> String {
        let d = self.dialect();
        let stride = (total_count / (n_pivots + 1)).max(1);
        let key_idents: Vec<String> = self
            .key_columns
            .iter()
            .map(|c| d.quote_ident(&c.name))
            .collect();
        let order: Vec<String> = self
            .key_columns
            .iter()
            .zip(&key_idents)
            .map(|(c, quoted)| d.order_expr(&c.canon, quoted))
            .collect();
        let proj: Vec<String> = self
            .key_columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let quoted = d.quote_ident(&format!("__cd_k{i}"));
                format!(
                    "{} AS __cd_c{i}",
                    d.canonical_expr(&c.canon, &quoted, self.case_insensitive)
                )
            })
            .collect();
        let inner_proj: Vec<String> = key_idents
            .iter()
            .enumerate()
            .map(|(i, quoted)| format!("{quoted} AS {}", d.quote_ident(&format!("__cd_k{i}"))))
            .collect();
        format!(
            "SELECT {} FROM ( \
               SELECT {}, ROW_NUMBER() OVER (ORDER BY {}) AS __cd_rn \
               FROM {} WHERE {} \
             ) __cd_keys WHERE {} = 0 ORDER BY __cd_rn {}",
            proj.join(", "),
            inner_proj.join(", "),
            order.join(", "),
            self.qualified_name(),
            self.where_clause(),
            d.mod_expr("__cd_rn", &stride.to_string()),
            d.limit_clause(n_pivots)
        )
    }

    /// Per-column statistics in one round trip: total row count, then for
    /// each column its non-null count and distinct estimate.
    pub fn column_stats_sql(&self, columns: &[SegmentColumn]) -> String {
        let d = self.dialect();
        let t = d.text_type();
        let mut proj = vec![format!("CAST(COUNT(*) AS {t}) AS __cd_total")];
        for (i, col) in columns.iter().enumerate() {
            let quoted = d.quote_ident(&col.name);
            proj.push(format!("CAST(COUNT({quoted}) AS {t}) AS __cd_n{i}"));
            proj.push(format!(
                "CAST(COUNT(DISTINCT {quoted}) AS {t}) AS __cd_d{i}"
            ));
        }
        format!(
            "SELECT {} FROM {} WHERE {}",
            proj.join(", "),
            self.qualified_name(),
            self.where_clause()
        )
    }

    /// Exact `COUNT(*)` fallback for cardinality estimation.
    pub fn count_sql(&self) -> String {
        let t = self.dialect().text_type();
        format!(
            "SELECT CAST(COUNT(*) AS {t}) FROM {} WHERE {}",
            self.qualified_name(),
            self.where_clause()
        )
    }
}

#[derive(Clone, Copy)]
enum BoundSide {
    GreaterEq,
    Less,
}

// NULLS-FIRST comparison atoms. A NULL bound component degenerates to a
// constant or null test; the SQL planner folds those away.

fn gt(d: &dyn Dialect, expr: &str, canon: &Canonical, val: &Value) -> String {
    if val.is_null() {
        format!("({expr} IS NOT NULL)")
    } else {
        format!("({expr} > {})", d.literal(canon, val))
    }
}

fn lt(d: &dyn Dialect, expr: &str, canon: &Canonical, val: &Value) -> String {
    if val.is_null() {
        "(1 = 0)".to_string()
    } else {
        format!("({expr} IS NULL OR {expr} < {})", d.literal(canon, val))
    }
}

fn eq(d: &dyn Dialect, expr: &str, canon: &Canonical, val: &Value) -> String {
    if val.is_null() {
        format!("({expr} IS NULL)")
    } else {
        format!("({expr} = {})", d.literal(canon, val))
    }
}

fn or(a: String, b: String) -> String {
    format!("({a} OR {b})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ConnDescriptor, DialectKind};
    use crate::driver::tests::StubDriver;
    use serde_json::json;

    fn seg() -> TableSegment {
        let driver = Arc::new(StubDriver::new(ConnDescriptor::new(DialectKind::Postgres)));
        TableSegment::new(
            driver,
            TableRef::new(Some("public".into()), "orders"),
            vec![SegmentColumn::new("id", types::normalise("bigint"))],
            vec![SegmentColumn::new("name", types::normalise("text"))],
        )
    }

    fn seg_composite() -> TableSegment {
        let driver = Arc::new(StubDriver::new(ConnDescriptor::new(DialectKind::Postgres)));
        TableSegment::new(
            driver,
            TableRef::new(Some("public".into()), "orders"),
            vec![
                SegmentColumn::new("region", types::normalise("text")),
                SegmentColumn::new("id", types::normalise("bigint")),
            ],
            vec![],
        )
    }

    #[test]
    fn test_where_clause_unbounded() {
        assert_eq!(seg().where_clause(), "1 = 1");
    }

    #[test]
    fn test_where_clause_with_bounds() {
        let mut s = seg();
        s.min_key = Some(vec![json!(100)]);
        s.max_key = Some(vec![json!(200)]);
        let w = s.where_clause();
        assert!(w.contains("\"id\" > 100") || w.contains("(\"id\" = 100)"), "{w}");
        assert!(w.contains("\"id\" < 200"), "{w}");
    }

    #[test]
    fn test_where_clause_keeps_predicate() {
        let s = seg().with_predicate("status = 'open'");
        assert!(s.where_clause().contains("(status = 'open')"));
    }

    #[test]
    fn test_with_predicate_stacks() {
        let s = seg().with_predicate("a = 1").with_predicate("b = 2");
        let w = s.where_clause();
        assert!(w.contains("(a = 1)") && w.contains("(b = 2)"), "{w}");
    }

    #[test]
    fn test_split_at_produces_covering_children() {
        let mut s = seg();
        s.min_key = Some(vec![json!(0)]);
        s.max_key = Some(vec![json!(100)]);
        let children = s.split_at(&[vec![json!(25)], vec![json!(50)], vec![json!(75)]]);
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].min_key, Some(vec![json!(0)]));
        assert_eq!(children[0].max_key, Some(vec![json!(25)]));
        assert_eq!(children[3].min_key, Some(vec![json!(75)]));
        assert_eq!(children[3].max_key, Some(vec![json!(100)]));
        // Adjacent children share a boundary: disjoint because min is
        // inclusive and max exclusive.
        assert_eq!(children[1].max_key, children[2].min_key);
    }

    #[test]
    fn test_split_at_drops_out_of_range_and_duplicate_pivots() {
        let mut s = seg();
        s.min_key = Some(vec![json!(10)]);
        s.max_key = Some(vec![json!(20)]);
        let children = s.split_at(&[
            vec![json!(5)],   // below min
            vec![json!(15)],
            vec![json!(15)],  // duplicate
            vec![json!(20)],  // == max (exclusive)
            vec![json!(99)],  // above max
        ]);
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_split_at_no_usable_pivots_returns_self() {
        let mut s = seg();
        s.min_key = Some(vec![json!(10)]);
        s.max_key = Some(vec![json!(11)]);
        let children = s.split_at(&[vec![json!(10)], vec![Value::Null]]);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].min_key, s.min_key);
    }

    #[test]
    fn test_composite_lex_bound_shape() {
        let mut s = seg_composite();
        s.min_key = Some(vec![json!("eu"), json!(5)]);
        let w = s.where_clause();
        // (region > 'eu') OR (region = 'eu' AND id >= 5)
        assert!(w.contains("\"region\" > 'eu'"), "{w}");
        assert!(w.contains("\"region\" = 'eu'"), "{w}");
        assert!(w.contains("\"id\" > 5"), "{w}");
        assert!(w.contains("\"id\" = 5"), "{w}");
    }

    #[test]
    fn test_null_bound_component() {
        let mut s = seg();
        s.min_key = Some(vec![Value::Null]);
        // Everything is >= NULL under NULLS-FIRST order.
        let w = s.where_clause();
        assert!(w.contains("IS NOT NULL") && w.contains("IS NULL"), "{w}");
    }

    #[test]
    fn test_checksum_sql_shape() {
        let sql = seg().checksum_sql().unwrap();
        assert!(sql.contains("COUNT(*)"), "{sql}");
        assert!(sql.contains("SUM(CAST("), "{sql}");
        assert!(sql.contains("\"public\".\"orders\""), "{sql}");
        assert!(sql.contains("md5"), "{sql}");
    }

    #[test]
    fn test_projection_sql_aliases_positionally() {
        let s = seg();
        let sql = s.projection_sql(&s.compared_columns());
        assert!(sql.contains("AS __cd_c0"), "{sql}");
        assert!(sql.contains("AS __cd_c1"), "{sql}");
    }

    #[test]
    fn test_sample_keys_sql_uses_row_number_stride() {
        let s = seg();
        let sql = s.sample_keys_sql(31, 320_000);
        assert!(sql.contains("ROW_NUMBER() OVER (ORDER BY \"id\")"), "{sql}");
        // stride = 320000 / 32 = 10000
        assert!(sql.contains("10000"), "{sql}");
        assert!(sql.contains("LIMIT 31"), "{sql}");
    }

    #[test]
    fn test_compare_key_tuples_composite() {
        let keys = vec![
            SegmentColumn::new("a", types::normalise("text")),
            SegmentColumn::new("b", types::normalise("bigint")),
        ];
        let x = vec![json!("m"), json!(2)];
        let y = vec![json!("m"), json!(10)];
        assert_eq!(compare_key_tuples(&keys, &x, &y), Ordering::Less);
        let z = vec![json!("z"), json!(0)];
        assert_eq!(compare_key_tuples(&keys, &z, &y), Ordering::Greater);
    }

    #[test]
    fn test_compare_key_tuples_null_component() {
        let keys = vec![SegmentColumn::new("a", types::normalise("bigint"))];
        assert_eq!(
            compare_key_tuples(&keys, &vec![Value::Null], &vec![Value::Null]),
            Ordering::Equal
        );
        assert_eq!(
            compare_key_tuples(&keys, &vec![Value::Null], &vec![json!(1)]),
            Ordering::Less
        );
    }
}
