//! Schema comparison.
//!
//! Builds catalog snapshots through driver introspection and computes a
//! structural diff: set-symmetric difference on table names, then on
//! column names per common table, then type classification per common
//! column through the canonical lattice. Pure function of its two
//! snapshots; output is in lexicographic table/column order.

use std::collections::BTreeMap;
use std::fmt;

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::driver::Driver;
use crate::error::DiffError;
use crate::segment::TableRef;
use crate::types::{self, Canonical, TypeCompat};

/// One introspected column in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub raw_type: String,
    pub canon: Canonical,
    pub nullable: bool,
    pub is_key: bool,
}

/// `{namespace → {table → {column → CatalogColumn}}}`, ordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub namespaces: BTreeMap<String, BTreeMap<String, BTreeMap<String, CatalogColumn>>>,
}

impl CatalogSnapshot {
    /// Flatten to `{table → columns}` across namespaces. Schema requests
    /// compare one namespace per side; on a multi-namespace snapshot a
    /// duplicated table name keeps the lexicographically last namespace's
    /// definition.
    pub fn tables(&self) -> BTreeMap<String, &BTreeMap<String, CatalogColumn>> {
        let mut out = BTreeMap::new();
        for tables in self.namespaces.values() {
            for (name, cols) in tables {
                out.insert(name.clone(), cols);
            }
        }
        out
    }
}

/// Take a catalog snapshot of the given namespaces (or the driver's
/// effective default).
pub async fn snapshot(
    driver: &dyn Driver,
    namespaces: Option<&[String]>,
) -> Result<CatalogSnapshot, DiffError> {
    let resolved: Vec<Option<String>> = match namespaces {
        Some(list) if !list.is_empty() => list.iter().cloned().map(Some).collect(),
        _ => vec![driver.effective_namespace(None)],
    };

    let mut snap = CatalogSnapshot::default();
    for ns in resolved {
        let tables = driver.list_tables(ns.as_deref()).await?;
        let infos = try_join_all(tables.iter().map(|t| {
            let table = TableRef::new(ns.clone(), t.clone());
            async move { driver.introspect_table(&table).await }
        }))
        .await?;

        let mut table_map = BTreeMap::new();
        for (name, cols) in tables.into_iter().zip(infos) {
            let col_map: BTreeMap<String, CatalogColumn> = cols
                .into_iter()
                .map(|c| {
                    (
                        c.name,
                        CatalogColumn {
                            raw_type: c.raw_type,
                            canon: c.canon,
                            nullable: c.nullable,
                            is_key: c.is_key_hint,
                        },
                    )
                })
                .collect();
            table_map.insert(name, col_map);
        }
        snap.namespaces
            .insert(ns.unwrap_or_default(), table_map);
    }
    Ok(snap)
}

/// Impact classification of one structural divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Impact::Low => "low",
            Impact::Medium => "medium",
            Impact::High => "high",
        })
    }
}

/// A column present on only one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDiff {
    pub column: String,
    pub impact: Impact,
}

/// A common column whose types are not identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMismatch {
    pub column: String,
    pub source_type: String,
    pub target_type: String,
    pub impact: Impact,
}

/// Column-level differences of one common table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub columns_only_in_source: Vec<ColumnDiff>,
    pub columns_only_in_target: Vec<ColumnDiff>,
    pub type_mismatches: Vec<TypeMismatch>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.columns_only_in_source.is_empty()
            && self.columns_only_in_target.is_empty()
            && self.type_mismatches.is_empty()
    }
}

/// The structural diff of two catalogs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub tables_only_in_source: Vec<String>,
    pub tables_only_in_target: Vec<String>,
    pub common_tables: Vec<String>,
    pub per_table: BTreeMap<String, TableDiff>,
}

/// Compute the structural diff of two snapshots.
///
/// Impact assignment is mechanical: a column missing from the target (or
/// type-incompatible, or a key/required column changing type) is *high*;
/// an extra column on the target is *medium*; a lossy-but-comparable type
/// change is *low*.
pub fn diff(source: &CatalogSnapshot, target: &CatalogSnapshot) -> SchemaDiff {
    let source_tables = source.tables();
    let target_tables = target.tables();
    let mut out = SchemaDiff::default();

    for name in source_tables.keys() {
        if !target_tables.contains_key(name) {
            out.tables_only_in_source.push(name.clone());
        }
    }
    for name in target_tables.keys() {
        if !source_tables.contains_key(name) {
            out.tables_only_in_target.push(name.clone());
        }
    }

    for (name, source_cols) in &source_tables {
        let Some(target_cols) = target_tables.get(name) else {
            continue;
        };
        out.common_tables.push(name.clone());
        let table_diff = diff_table(source_cols, target_cols);
        if !table_diff.is_empty() {
            out.per_table.insert(name.clone(), table_diff);
        }
    }
    out
}

fn diff_table(
    source: &BTreeMap<String, CatalogColumn>,
    target: &BTreeMap<String, CatalogColumn>,
) -> TableDiff {
    let mut out = TableDiff::default();

    for name in source.keys() {
        if !target.contains_key(name) {
            out.columns_only_in_source.push(ColumnDiff {
                column: name.clone(),
                impact: Impact::High,
            });
        }
    }
    for name in target.keys() {
        if !source.contains_key(name) {
            out.columns_only_in_target.push(ColumnDiff {
                column: name.clone(),
                impact: Impact::Medium,
            });
        }
    }

    for (name, s_col) in source {
        let Some(t_col) = target.get(name) else {
            continue;
        };
        if s_col.canon == t_col.canon {
            continue;
        }
        let compat = types::compare(&s_col.canon, &t_col.canon);
        let structurally_significant =
            s_col.is_key || t_col.is_key || !s_col.nullable || !t_col.nullable;
        let impact = match compat {
            TypeCompat::Incompatible => Impact::High,
            _ if structurally_significant => Impact::High,
            TypeCompat::Lossy => Impact::Low,
            TypeCompat::Compatible => Impact::Low,
        };
        out.type_mismatches.push(TypeMismatch {
            column: name.clone(),
            source_type: s_col.raw_type.clone(),
            target_type: t_col.raw_type.clone(),
            impact,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(raw: &str) -> CatalogColumn {
        CatalogColumn {
            raw_type: raw.to_string(),
            canon: types::normalise(raw),
            nullable: true,
            is_key: false,
        }
    }

    fn key_col(raw: &str) -> CatalogColumn {
        CatalogColumn {
            is_key: true,
            nullable: false,
            ..col(raw)
        }
    }

    fn snap(tables: &[(&str, &[(&str, CatalogColumn)])]) -> CatalogSnapshot {
        let mut snapshot = CatalogSnapshot::default();
        let table_map: BTreeMap<String, BTreeMap<String, CatalogColumn>> = tables
            .iter()
            .map(|(name, cols)| {
                (
                    name.to_string(),
                    cols.iter()
                        .map(|(c, info)| (c.to_string(), info.clone()))
                        .collect(),
                )
            })
            .collect();
        snapshot.namespaces.insert("public".to_string(), table_map);
        snapshot
    }

    #[test]
    fn test_documented_scenario() {
        // source {users(id int, name text), orders}; target {users(id int,
        // username text), products}.
        let source = snap(&[
            ("users", &[("id", key_col("int")), ("name", col("text"))]),
            ("orders", &[("id", key_col("int"))]),
        ]);
        let target = snap(&[
            ("users", &[("id", key_col("int")), ("username", col("text"))]),
            ("products", &[("id", key_col("int"))]),
        ]);

        let d = diff(&source, &target);
        assert_eq!(d.tables_only_in_source, vec!["orders"]);
        assert_eq!(d.tables_only_in_target, vec!["products"]);
        assert_eq!(d.common_tables, vec!["users"]);

        let users = &d.per_table["users"];
        assert_eq!(users.columns_only_in_source.len(), 1);
        assert_eq!(users.columns_only_in_source[0].column, "name");
        assert_eq!(users.columns_only_in_source[0].impact, Impact::High);
        assert_eq!(users.columns_only_in_target[0].column, "username");
        assert_eq!(users.columns_only_in_target[0].impact, Impact::Medium);
        assert!(users.type_mismatches.is_empty());
    }

    #[test]
    fn test_diff_is_symmetric_after_swap() {
        let a = snap(&[
            ("t1", &[("x", col("int"))]),
            ("t2", &[("y", col("text"))]),
        ]);
        let b = snap(&[
            ("t1", &[("x", col("int")), ("z", col("int"))]),
            ("t3", &[("w", col("text"))]),
        ]);
        let ab = diff(&a, &b);
        let ba = diff(&b, &a);
        assert_eq!(ab.tables_only_in_source, ba.tables_only_in_target);
        assert_eq!(ab.tables_only_in_target, ba.tables_only_in_source);
        assert_eq!(ab.common_tables, ba.common_tables);
        let ab_t1 = &ab.per_table["t1"];
        let ba_t1 = &ba.per_table["t1"];
        assert_eq!(
            ab_t1.columns_only_in_target.len(),
            ba_t1.columns_only_in_source.len()
        );
    }

    #[test]
    fn test_identical_snapshots_empty_diff() {
        let a = snap(&[("t", &[("x", col("bigint"))])]);
        let d = diff(&a, &a.clone());
        assert!(d.tables_only_in_source.is_empty());
        assert!(d.tables_only_in_target.is_empty());
        assert_eq!(d.common_tables, vec!["t"]);
        assert!(d.per_table.is_empty());
    }

    #[test]
    fn test_type_mismatch_impacts() {
        let source = snap(&[(
            "t",
            &[
                ("a", col("numeric(18,4)")),
                ("b", col("jsonb")),
                ("k", key_col("bigint")),
            ],
        )]);
        let target = snap(&[(
            "t",
            &[
                ("a", col("double precision")), // lossy, nullable: low
                ("b", col("text")),             // incompatible: high
                ("k", key_col("int")),          // key column change: high
            ],
        )]);
        let d = diff(&source, &target);
        let t = &d.per_table["t"];
        let by_col: BTreeMap<&str, Impact> = t
            .type_mismatches
            .iter()
            .map(|m| (m.column.as_str(), m.impact))
            .collect();
        assert_eq!(by_col["a"], Impact::Low);
        assert_eq!(by_col["b"], Impact::High);
        assert_eq!(by_col["k"], Impact::High);
    }

    #[test]
    fn test_compatible_spelling_difference_not_reported() {
        // numeric(18,4) and decimal(18,4) normalise identically.
        let a = snap(&[("t", &[("x", col("numeric(18,4)"))])]);
        let b = snap(&[("t", &[("x", col("decimal(18,4)"))])]);
        let d = diff(&a, &b);
        assert!(d.per_table.is_empty());
    }

    #[test]
    fn test_output_is_lexicographically_ordered() {
        let a = snap(&[
            ("zebra", &[("x", col("int"))]),
            ("alpha", &[("x", col("int"))]),
        ]);
        let b = snap(&[("middle", &[("x", col("int"))])]);
        let d = diff(&a, &b);
        assert_eq!(d.tables_only_in_source, vec!["alpha", "zebra"]);
    }
}
