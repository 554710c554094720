//! End-to-end store scenarios against the in-memory SQLite backend.
//!
//! These exercise the externally observable contract: version chains,
//! squash and delete shapes, checkpointed reads, revert, and paging. The
//! raw `<table>_versioned` rows are inspected directly where the contract
//! is about physical version shape.

use num_bigint::BigInt;
use sqlx::Row as _;

use chainstore_core::schema::{ColumnDef, ScalarType, Schema, TableDef};
use chainstore_core::{Checkpoint, Row, StoreError, Value, CHECKPOINT_LATEST};
use chainstore_storage::sqlite::SqliteEntityStore;
use chainstore_storage::{Condition, EntityStore, Filter, FindMany, OrderBy, Patch};

fn token_schema() -> Schema {
    Schema::new(
        vec![],
        vec![
            TableDef::new(
                "Token",
                vec![
                    ColumnDef::scalar("id", ScalarType::Bytes),
                    ColumnDef::scalar("supply", ScalarType::Bigint),
                    ColumnDef::optional_scalar("symbol", ScalarType::String),
                ],
            ),
            TableDef::new(
                "Account",
                vec![
                    ColumnDef::scalar("id", ScalarType::String),
                    ColumnDef::scalar("balance", ScalarType::Int),
                ],
            ),
        ],
    )
}

fn cp(n: u64) -> Checkpoint {
    Checkpoint::at_block(n * 12, 1, n)
}

fn supply(n: i64) -> Row {
    let mut row = Row::new();
    row.insert("supply".into(), Value::bigint(n));
    row
}

fn balance(id: &str, n: i64) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), Value::String(id.into()));
    row.insert("balance".into(), Value::Int(n));
    row
}

async fn store() -> SqliteEntityStore {
    let store = SqliteEntityStore::in_memory().await.unwrap();
    store.reload(token_schema()).await.unwrap();
    store
}

/// Raw `(id, from, to)` triples of a table's versions, id-then-from order.
async fn versions(store: &SqliteEntityStore, table: &str) -> Vec<(String, String, String)> {
    let name = format!("{}_{}_versioned", store.namespace(), table);
    sqlx::query(&format!(
        "SELECT \"id\", \"effectiveFromCheckpoint\", \"effectiveToCheckpoint\" \
         FROM \"{name}\" ORDER BY \"id\", \"effectiveFromCheckpoint\""
    ))
    .fetch_all(store.pool())
    .await
    .unwrap()
    .iter()
    .map(|row| {
        (
            row.get::<String, _>(0),
            row.get::<String, _>(1),
            row.get::<String, _>(2),
        )
    })
    .collect()
}

/// Check the version-chain invariants for every id in `rows`.
fn audit_chains(rows: &[(String, String, String)]) {
    let mut by_id: std::collections::BTreeMap<&str, Vec<(&str, &str)>> = Default::default();
    for (id, from, to) in rows {
        by_id.entry(id).or_default().push((from, to));
    }
    for (id, chain) in by_id {
        let open = chain.iter().filter(|(_, to)| *to == CHECKPOINT_LATEST).count();
        assert!(open <= 1, "id {id} has {open} open versions");
        for (from, to) in &chain {
            assert!(from < to, "id {id} has an empty interval {from}..{to}");
        }
        for pair in chain.windows(2) {
            assert_eq!(
                pair[0].1, pair[1].0,
                "id {id} has a gap between versions"
            );
        }
    }
}

#[tokio::test]
async fn create_update_then_revert() {
    let store = store().await;
    store
        .create("Token", cp(1), Value::bytes("0x1"), supply(0))
        .await
        .unwrap();
    store
        .update("Token", cp(2), Value::bytes("0x1"), Patch::set(supply(100)))
        .await
        .unwrap();

    let at_c1 = store
        .find_unique("Token", &Value::bytes("0x1"), Some(cp(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_c1["supply"], Value::bigint(0));
    let current = store
        .find_unique("Token", &Value::bytes("0x1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current["supply"], Value::bigint(100));

    store.revert(cp(2)).await.unwrap();
    let current = store
        .find_unique("Token", &Value::bytes("0x1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current["supply"], Value::bigint(0));
    audit_chains(&versions(&store, "Token").await);
}

#[tokio::test]
async fn same_checkpoint_writes_squash_into_one_version() {
    let store = store().await;
    store
        .create("Token", cp(3), Value::bytes("0x1"), supply(1))
        .await
        .unwrap();
    store
        .update("Token", cp(3), Value::bytes("0x1"), Patch::set(supply(2)))
        .await
        .unwrap();
    store
        .update("Token", cp(3), Value::bytes("0x1"), Patch::set(supply(3)))
        .await
        .unwrap();

    let rows = versions(&store, "Token").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, cp(3).encode());
    assert_eq!(rows[0].2, CHECKPOINT_LATEST);
    let current = store
        .find_unique("Token", &Value::bytes("0x1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current["supply"], Value::bigint(3));
}

#[tokio::test]
async fn delete_within_the_creating_checkpoint_leaves_no_trace() {
    let store = store().await;
    store
        .create("Token", cp(4), Value::bytes("0x1"), supply(1))
        .await
        .unwrap();
    let deleted = store
        .delete("Token", cp(4), Value::bytes("0x1"))
        .await
        .unwrap();
    assert!(deleted);
    assert!(versions(&store, "Token").await.is_empty());
}

#[tokio::test]
async fn delete_later_truncates_validity() {
    let store = store().await;
    store
        .create("Token", cp(1), Value::bytes("0x1"), supply(7))
        .await
        .unwrap();
    let deleted = store
        .delete("Token", cp(2), Value::bytes("0x1"))
        .await
        .unwrap();
    assert!(deleted);

    let rows = versions(&store, "Token").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, cp(1).encode());
    assert_eq!(rows[0].2, cp(2).encode());

    assert!(store
        .find_unique("Token", &Value::bytes("0x1"), None)
        .await
        .unwrap()
        .is_none());
    let historical = store
        .find_unique("Token", &Value::bytes("0x1"), Some(cp(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(historical["supply"], Value::bigint(7));

    // Deleting a row that no longer has a current version affects nothing.
    let again = store
        .delete("Token", cp(3), Value::bytes("0x1"))
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn revert_then_replay_reproduces_the_state() {
    async fn replay(store: &SqliteEntityStore) {
        store
            .update("Token", cp(2), Value::bytes("0xa"), Patch::set(supply(100)))
            .await
            .unwrap();
        store
            .create("Token", cp(3), Value::bytes("0xb"), supply(5))
            .await
            .unwrap();
        store.delete("Token", cp(4), Value::bytes("0xa")).await.unwrap();
    }

    let store = store().await;
    store
        .create("Token", cp(1), Value::bytes("0xa"), supply(0))
        .await
        .unwrap();
    replay(&store).await;
    let before = versions(&store, "Token").await;
    audit_chains(&before);

    store.revert(cp(2)).await.unwrap();
    replay(&store).await;
    let after = versions(&store, "Token").await;
    assert_eq!(before, after);

    // Revert is idempotent: doing it twice equals doing it once.
    store.revert(cp(2)).await.unwrap();
    let once = versions(&store, "Token").await;
    store.revert(cp(2)).await.unwrap();
    assert_eq!(versions(&store, "Token").await, once);
    audit_chains(&once);
}

#[tokio::test]
async fn create_many_spans_chunks_and_keeps_input_order() {
    let store = store().await;
    let rows: Vec<Row> = (0..1005).map(|i| balance(&format!("acct-{i:04}"), i)).collect();
    let created = store
        .create_many("Account", cp(1), rows)
        .await
        .unwrap();
    assert_eq!(created.len(), 1005);
    assert_eq!(created[0]["id"], Value::String("acct-0000".into()));
    assert_eq!(created[1004]["id"], Value::String("acct-1004".into()));

    let stored = store
        .find_many(
            "Account",
            FindMany {
                take: Some(1000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 1000);
}

#[tokio::test]
async fn update_many_applies_the_single_row_rule() {
    let store = store().await;
    store
        .create_many(
            "Account",
            cp(1),
            vec![balance("a", 1), balance("b", 5), balance("c", 10)],
        )
        .await
        .unwrap();

    let updated = store
        .update_many(
            "Account",
            cp(2),
            Some(Filter::new().and("balance", Condition::Gte(Value::Int(5)))),
            Patch::with(|current| {
                let mut patch = Row::new();
                match current["balance"] {
                    Value::Int(n) => patch.insert("balance".into(), Value::Int(n * 2)),
                    _ => unreachable!(),
                };
                patch
            }),
        )
        .await
        .unwrap();
    assert_eq!(updated.len(), 2);

    let all = store
        .find_many(
            "Account",
            FindMany {
                order_by: Some(OrderBy::asc("id")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let balances: Vec<_> = all.iter().map(|r| r["balance"].clone()).collect();
    assert_eq!(
        balances,
        vec![Value::Int(1), Value::Int(10), Value::Int(20)]
    );
    audit_chains(&versions(&store, "Account").await);
}

#[tokio::test]
async fn upsert_creates_then_updates() {
    let store = store().await;
    let first = store
        .upsert(
            "Token",
            cp(1),
            Value::bytes("0x1"),
            supply(1),
            Patch::set(supply(99)),
        )
        .await
        .unwrap();
    assert_eq!(first["supply"], Value::bigint(1));

    let second = store
        .upsert(
            "Token",
            cp(2),
            Value::bytes("0x1"),
            supply(1),
            Patch::set(supply(99)),
        )
        .await
        .unwrap();
    assert_eq!(second["supply"], Value::bigint(99));
    assert_eq!(versions(&store, "Token").await.len(), 2);
}

#[tokio::test]
async fn find_many_filters_orders_and_pages() {
    let store = store().await;
    store
        .create_many(
            "Account",
            cp(1),
            (0..10).map(|i| balance(&format!("acct-{i}"), i)).collect(),
        )
        .await
        .unwrap();

    let filtered = store
        .find_many(
            "Account",
            FindMany {
                filter: Some(
                    Filter::new()
                        .and("balance", Condition::Gt(Value::Int(2)))
                        .and("balance", Condition::Lte(Value::Int(7))),
                ),
                order_by: Some(OrderBy::desc("balance")),
                skip: Some(1),
                take: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let balances: Vec<_> = filtered.iter().map(|r| r["balance"].clone()).collect();
    assert_eq!(
        balances,
        vec![Value::Int(6), Value::Int(5), Value::Int(4)]
    );

    let none = store
        .find_many(
            "Account",
            FindMany {
                filter: Some(Filter::new().and("id", Condition::In(vec![]))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn reads_at_checkpoints_see_the_version_then_current() {
    let store = store().await;
    store
        .create("Token", cp(1), Value::bytes("0x1"), supply(1))
        .await
        .unwrap();
    store
        .update("Token", cp(3), Value::bytes("0x1"), Patch::set(supply(3)))
        .await
        .unwrap();
    store
        .update("Token", cp(5), Value::bytes("0x1"), Patch::set(supply(5)))
        .await
        .unwrap();

    // A checkpoint between versions resolves to the one open at it.
    let at_c2 = store
        .find_unique("Token", &Value::bytes("0x1"), Some(cp(2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_c2["supply"], Value::bigint(1));
    let at_c3 = store
        .find_unique("Token", &Value::bytes("0x1"), Some(cp(3)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_c3["supply"], Value::bigint(3));
    // Before the row existed there is nothing to see.
    assert!(store
        .find_unique("Token", &Value::bytes("0x1"), Some(cp(0)))
        .await
        .unwrap()
        .is_none());

    let many_at_c4 = store
        .find_many(
            "Token",
            FindMany {
                at: Some(cp(4)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(many_at_c4.len(), 1);
    assert_eq!(many_at_c4[0]["supply"], Value::bigint(3));
}

#[tokio::test]
async fn bigints_survive_the_full_path() {
    let store = store().await;
    let huge: BigInt = "115792089237316195423570985008687907853269984665640564039457584007913129639935"
        .parse()
        .unwrap();
    let mut row = Row::new();
    row.insert("supply".into(), Value::Bigint(huge.clone()));
    store
        .create("Token", cp(1), Value::bytes("0x1"), row)
        .await
        .unwrap();
    let read = store
        .find_unique("Token", &Value::bytes("0x1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read["supply"], Value::Bigint(huge));
}

#[tokio::test]
async fn schema_violations_surface_as_conflicts() {
    let store = store().await;
    // Unknown column.
    let mut bad = Row::new();
    bad.insert("nope".into(), Value::Int(1));
    let err = store
        .create("Token", cp(1), Value::bytes("0x1"), bad)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SchemaConflict(_)));

    // NULL into a required column, caught by the NOT NULL constraint.
    let mut null_supply = Row::new();
    null_supply.insert("supply".into(), Value::Null);
    let err = store
        .create("Token", cp(1), Value::bytes("0x2"), null_supply)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SchemaConflict(_)));
}

#[tokio::test]
async fn publish_exposes_current_versions_through_views() {
    let store = store().await;
    store
        .create("Token", cp(1), Value::bytes("0x1"), supply(1))
        .await
        .unwrap();
    store
        .update("Token", cp(2), Value::bytes("0x1"), Patch::set(supply(2)))
        .await
        .unwrap();
    store.publish().await.unwrap();
    assert_eq!(
        store.published_namespace().await.unwrap().as_deref(),
        Some(store.namespace())
    );

    let all_versions: i64 = sqlx::query_scalar("SELECT count(*) FROM \"Token_versioned\"")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(all_versions, 2);
    let current: i64 = sqlx::query_scalar("SELECT count(*) FROM \"Token\"")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(current, 1);
}
