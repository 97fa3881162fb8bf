//! Schema comparison through real sqlite introspection.

mod common;

use crossdiff::schemadiff::{self, Impact};

use common::*;

#[tokio::test]
async fn documented_schema_scenario() {
    let source_fx = sqlite_fixture("schema_src").await;
    let target_fx = sqlite_fixture("schema_tgt").await;
    exec(
        &source_fx.driver,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
    )
    .await;
    exec(
        &source_fx.driver,
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL)",
    )
    .await;
    exec(
        &target_fx.driver,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT)",
    )
    .await;
    exec(
        &target_fx.driver,
        "CREATE TABLE products (id INTEGER PRIMARY KEY)",
    )
    .await;

    let source_snap = schemadiff::snapshot(source_fx.driver.as_ref(), None)
        .await
        .unwrap();
    let target_snap = schemadiff::snapshot(target_fx.driver.as_ref(), None)
        .await
        .unwrap();
    let diff = schemadiff::diff(&source_snap, &target_snap);

    assert_eq!(diff.tables_only_in_source, vec!["orders"]);
    assert_eq!(diff.tables_only_in_target, vec!["products"]);
    assert_eq!(diff.common_tables, vec!["users"]);

    let users = &diff.per_table["users"];
    assert_eq!(users.columns_only_in_source.len(), 1);
    assert_eq!(users.columns_only_in_source[0].column, "name");
    assert_eq!(users.columns_only_in_source[0].impact, Impact::High);
    assert_eq!(users.columns_only_in_target[0].column, "username");
    assert_eq!(users.columns_only_in_target[0].impact, Impact::Medium);
    assert!(users.type_mismatches.is_empty());
}

#[tokio::test]
async fn reversal_swaps_only_in_lists() {
    let a_fx = sqlite_fixture("schema_rev_a").await;
    let b_fx = sqlite_fixture("schema_rev_b").await;
    exec(&a_fx.driver, "CREATE TABLE shared (id INTEGER, a TEXT)").await;
    exec(&a_fx.driver, "CREATE TABLE left_only (id INTEGER)").await;
    exec(&b_fx.driver, "CREATE TABLE shared (id INTEGER, b TEXT)").await;
    exec(&b_fx.driver, "CREATE TABLE right_only (id INTEGER)").await;

    let a = schemadiff::snapshot(a_fx.driver.as_ref(), None).await.unwrap();
    let b = schemadiff::snapshot(b_fx.driver.as_ref(), None).await.unwrap();
    let ab = schemadiff::diff(&a, &b);
    let ba = schemadiff::diff(&b, &a);

    assert_eq!(ab.tables_only_in_source, ba.tables_only_in_target);
    assert_eq!(ab.tables_only_in_target, ba.tables_only_in_source);
    assert_eq!(ab.common_tables, ba.common_tables);
    let ab_shared = &ab.per_table["shared"];
    let ba_shared = &ba.per_table["shared"];
    assert_eq!(ab_shared.columns_only_in_source[0].column, "a");
    assert_eq!(ba_shared.columns_only_in_target[0].column, "a");
}

#[tokio::test]
async fn snapshot_reflects_introspected_types_and_keys() {
    let fx = sqlite_fixture("schema_types").await;
    exec(
        &fx.driver,
        "CREATE TABLE items (id INTEGER PRIMARY KEY, price REAL, label TEXT NOT NULL)",
    )
    .await;

    let snap = schemadiff::snapshot(fx.driver.as_ref(), None).await.unwrap();
    let tables = snap.tables();
    let items = tables.get("items").expect("items table");
    assert!(items["id"].is_key);
    assert!(!items["label"].nullable);
    assert!(items["price"].nullable);
}

#[tokio::test]
async fn identical_databases_have_empty_diff() {
    let a_fx = sqlite_fixture("schema_same_a").await;
    let b_fx = sqlite_fixture("schema_same_b").await;
    for fx in [&a_fx, &b_fx] {
        exec(
            &fx.driver,
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)",
        )
        .await;
    }
    let a = schemadiff::snapshot(a_fx.driver.as_ref(), None).await.unwrap();
    let b = schemadiff::snapshot(b_fx.driver.as_ref(), None).await.unwrap();
    let d = schemadiff::diff(&a, &b);
    assert!(d.tables_only_in_source.is_empty());
    assert!(d.tables_only_in_target.is_empty());
    assert!(d.per_table.is_empty());
    assert_eq!(d.common_tables, vec!["t"]);
}
