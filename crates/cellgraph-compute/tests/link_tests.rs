mod common;

use std::collections::BTreeSet;

use cellgraph_compute::ComputeOrchestrator;
use cellgraph_core::{
    MetadataProvider, RecordStore, RecordUpdate, Relationship, ValidationCode,
};
use common::*;
use serde_json::{json, Value};

const LEFT: &str = "tbl_left";
const RIGHT: &str = "tbl_right";

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn linked(value: &Value) -> BTreeSet<String> {
    link_ids(value).into_iter().collect()
}

#[tokio::test]
async fn test_many_many_links_mirror_on_both_sides() {
    let (_store, tx) = pair_tables(Relationship::ManyMany);
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);

    let (_, outcome) = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r1", "r2"]))])
        .await
        .unwrap();
    assert_eq!(
        tx.value(LEFT, "l1", "fld_left_links").unwrap(),
        json!([{"id": "r1", "title": "Right r1"}, {"id": "r2", "title": "Right r2"}])
    );
    assert_eq!(outcome.published_op_count, 2);
    let mirrored = ctx.ops().cell_ops(&RIGHT.to_string(), "fld_right_links");
    let touched: BTreeSet<String> = mirrored.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(touched, set(&["r1", "r2"]));

    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l2").set("fld_left_links", json!([{"id": "r2"}]))])
        .await
        .unwrap();

    // Both sides describe the same key pairs.
    for right in ["r1", "r2", "r3"] {
        let from_right = linked(&tx.value(RIGHT, right, "fld_right_links").unwrap());
        let from_left: BTreeSet<String> = ["l1", "l2", "l3"]
            .iter()
            .filter(|left| linked(&tx.value(LEFT, left, "fld_left_links").unwrap()).contains(right))
            .map(|s| s.to_string())
            .collect();
        assert_eq!(from_right, from_left, "mismatch on {right}");
    }
    assert_eq!(linked(&tx.value(RIGHT, "r2", "fld_right_links").unwrap()), set(&["l1", "l2"]));
    assert_eq!(tx.value(RIGHT, "r3", "fld_right_links").unwrap(), Value::Null);
}

#[tokio::test]
async fn test_reorder_renumbers_and_append_continues() {
    let (_store, tx) = pair_tables(Relationship::ManyMany);
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);
    let left = tx.get_table_domain(LEFT).await.unwrap();
    let link = left.field("fld_left_links").unwrap().link_options().unwrap().clone();

    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r1", "r2"]))])
        .await
        .unwrap();
    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r2", "r1"]))])
        .await
        .unwrap();

    let pairs = tx.read_links(&link, &["l1".to_string()]).await.unwrap();
    let order: Vec<(String, Option<i64>)> = pairs.iter().map(|p| (p.foreign_id.clone(), p.order)).collect();
    assert_eq!(order, vec![("r2".to_string(), Some(1)), ("r1".to_string(), Some(2))]);
    assert_eq!(link_ids(&tx.value(LEFT, "l1", "fld_left_links").unwrap()), vec!["r2", "r1"]);

    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r2", "r1", "r3"]))])
        .await
        .unwrap();
    let pairs = tx.read_links(&link, &["l1".to_string()]).await.unwrap();
    let appended = pairs.iter().find(|p| p.foreign_id == "r3").unwrap();
    assert_eq!(appended.order, Some(3));
    assert_eq!(link_ids(&tx.value(LEFT, "l1", "fld_left_links").unwrap()), vec!["r2", "r1", "r3"]);
}

#[tokio::test]
async fn test_one_one_rejects_a_second_claim() {
    let (_store, tx) = pair_tables(Relationship::OneOne);
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);

    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!("r1"))])
        .await
        .unwrap();
    assert_eq!(
        tx.value(RIGHT, "r1", "fld_right_links").unwrap(),
        json!({"id": "l1", "title": "Left l1"})
    );

    let err = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l2").set("fld_left_links", json!("r1"))])
        .await
        .unwrap_err();
    assert!(err.is_consistency());
    assert_eq!(tx.record(LEFT, "l2").unwrap().version, 1);
    assert_eq!(tx.value(LEFT, "l2", "fld_left_links").unwrap(), Value::Null);
    assert_eq!(link_ids(&tx.value(RIGHT, "r1", "fld_right_links").unwrap()), vec!["l1"]);

    // Two hosts claiming one record within a single batch.
    let err = orchestrator
        .update_records(
            LEFT,
            &[
                RecordUpdate::new("l2").set("fld_left_links", json!("r2")),
                RecordUpdate::new("l3").set("fld_left_links", json!("r2")),
            ],
        )
        .await
        .unwrap_err();
    assert!(err.is_consistency());
    assert_eq!(tx.value(RIGHT, "r2", "fld_right_links").unwrap(), Value::Null);
}

#[tokio::test]
async fn test_one_one_claim_released_in_the_same_batch() {
    let (_store, tx) = pair_tables(Relationship::OneOne);
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);
    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!("r1"))])
        .await
        .unwrap();

    orchestrator
        .update_records(
            LEFT,
            &[
                RecordUpdate::new("l1").set("fld_left_links", Value::Null),
                RecordUpdate::new("l2").set("fld_left_links", json!("r1")),
            ],
        )
        .await
        .unwrap();

    assert_eq!(tx.value(LEFT, "l1", "fld_left_links").unwrap(), Value::Null);
    assert_eq!(
        tx.value(RIGHT, "r1", "fld_right_links").unwrap(),
        json!({"id": "l2", "title": "Left l2"})
    );
}

#[tokio::test]
async fn test_one_many_children_have_a_single_parent() {
    let (_store, tx) = pair_tables(Relationship::OneMany);
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);
    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r1", "r2"]))])
        .await
        .unwrap();
    assert_eq!(link_ids(&tx.value(RIGHT, "r2", "fld_right_links").unwrap()), vec!["l1"]);

    let err = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l2").set("fld_left_links", json!(["r2"]))])
        .await
        .unwrap_err();
    assert!(err.is_consistency());

    // Moving a child is fine when its old parent lets go in the same batch.
    orchestrator
        .update_records(
            LEFT,
            &[
                RecordUpdate::new("l1").set("fld_left_links", json!(["r1"])),
                RecordUpdate::new("l2").set("fld_left_links", json!(["r2"])),
            ],
        )
        .await
        .unwrap();
    assert_eq!(link_ids(&tx.value(LEFT, "l1", "fld_left_links").unwrap()), vec!["r1"]);
    assert_eq!(link_ids(&tx.value(LEFT, "l2", "fld_left_links").unwrap()), vec!["r2"]);
    assert_eq!(
        tx.value(RIGHT, "r2", "fld_right_links").unwrap(),
        json!({"id": "l2", "title": "Left l2"})
    );
}

#[tokio::test]
async fn test_many_one_rejects_a_second_claim() {
    let (_store, tx) = pair_tables(Relationship::ManyOne);
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);
    let left = tx.get_table_domain(LEFT).await.unwrap();
    let link = left.field("fld_left_links").unwrap().link_options().unwrap().clone();
    let hosts = vec!["l1".to_string(), "l2".to_string()];

    let err = orchestrator
        .update_records(
            LEFT,
            &[
                RecordUpdate::new("l1").set("fld_left_links", json!("r1")),
                RecordUpdate::new("l2").set("fld_left_links", json!({"id": "r1"})),
            ],
        )
        .await
        .unwrap_err();
    assert!(err.is_consistency());
    assert!(tx.read_links(&link, &hosts).await.unwrap().is_empty());
    assert_eq!(tx.value(LEFT, "l1", "fld_left_links").unwrap(), Value::Null);
    assert!(ctx.ops().is_empty());

    orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!("r1"))])
        .await
        .unwrap();
    let err = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l2").set("fld_left_links", json!("r1"))])
        .await
        .unwrap_err();
    assert!(err.is_consistency());
    let pairs = tx.read_links(&link, &hosts).await.unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].self_id, "l1");
    assert_eq!(tx.record(LEFT, "l2").unwrap().version, 1);
    assert_eq!(link_ids(&tx.value(RIGHT, "r1", "fld_right_links").unwrap()), vec!["l1"]);
}

#[tokio::test]
async fn test_link_cell_ops_carry_the_stored_value() {
    let (_store, tx) = pair_tables(Relationship::ManyMany);
    let ctx = context(&tx, test_config());

    ComputeOrchestrator::new(&ctx)
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r1"]))])
        .await
        .unwrap();

    let stored = tx.value(LEFT, "l1", "fld_left_links").unwrap();
    assert_eq!(stored, json!([{"id": "r1", "title": "Right r1"}]));
    let ops = ctx.ops().cell_ops(&LEFT.to_string(), "fld_left_links");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].1.new_value, stored);
    assert_eq!(ops[0].1.old_value, Value::Null);
}

#[tokio::test]
async fn test_malformed_link_cells_are_rejected() {
    let (_store, tx) = pair_tables(Relationship::ManyMany);
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);

    let err = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r1", "r1"]))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::DuplicateLinkTarget));

    let err = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!("r1"))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::InvalidCellValue));

    let err = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!([42]))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::InvalidCellValue));

    let err = orchestrator
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r_missing"]))])
        .await
        .unwrap_err();
    assert!(err.is_consistency());
    assert_eq!(tx.record(LEFT, "l1").unwrap().version, 1);
    assert!(ctx.ops().is_empty());
}

#[tokio::test]
async fn test_single_link_rejects_lists() {
    let (_store, tx) = pair_tables(Relationship::OneOne);
    let ctx = context(&tx, test_config());
    let err = ComputeOrchestrator::new(&ctx)
        .update_records(LEFT, &[RecordUpdate::new("l1").set("fld_left_links", json!(["r1"]))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::InvalidCellValue));
}

#[tokio::test]
async fn test_order_cannot_join_an_already_claimed_customer() {
    let (_store, tx) = linked_shop();
    let ctx = context(&tx, test_config());

    let err = ComputeOrchestrator::new(&ctx)
        .update_records(ORDERS, &[RecordUpdate::new("ord_3").set("fld_order_customer", json!("cus_ada"))])
        .await
        .unwrap_err();

    assert!(err.is_consistency());
    assert_eq!(
        tx.value(ORDERS, "ord_3", "fld_order_customer").unwrap(),
        json!({"id": "cus_bob", "title": "Bob"})
    );
    assert_eq!(tx.value(CUSTOMERS, "cus_ada", "fld_order_total").unwrap(), json!(250));
    assert!(ctx.ops().is_empty());
}

#[tokio::test]
async fn test_moving_an_order_updates_both_customers() {
    let (_store, tx) = linked_shop();
    tx.insert_records(
        CUSTOMERS,
        vec![row(&[("id", json!("cus_cyd")), ("fld_cust_name", json!("Cyd"))])],
    )
    .unwrap();
    tx.materialize_all().unwrap();
    assert_eq!(tx.value(CUSTOMERS, "cus_cyd", "fld_order_total").unwrap(), json!(0));
    let ctx = context(&tx, test_config());

    ComputeOrchestrator::new(&ctx)
        .update_records(ORDERS, &[RecordUpdate::new("ord_3").set("fld_order_customer", json!("cus_cyd"))])
        .await
        .unwrap();

    assert_eq!(
        tx.value(ORDERS, "ord_3", "fld_order_customer").unwrap(),
        json!({"id": "cus_cyd", "title": "Cyd"})
    );
    assert_eq!(link_ids(&tx.value(CUSTOMERS, "cus_cyd", "fld_cust_orders").unwrap()), vec!["ord_3"]);
    assert_eq!(tx.value(CUSTOMERS, "cus_bob", "fld_cust_orders").unwrap(), Value::Null);
    assert_eq!(linked(&tx.value(CUSTOMERS, "cus_ada", "fld_cust_orders").unwrap()), set(&["ord_1", "ord_2"]));
    assert_eq!(tx.value(CUSTOMERS, "cus_cyd", "fld_order_total").unwrap(), json!(120));
    assert_eq!(tx.value(CUSTOMERS, "cus_bob", "fld_order_total").unwrap(), json!(0));
    assert_eq!(tx.value(CUSTOMERS, "cus_ada", "fld_order_total").unwrap(), json!(250));
    assert_eq!(tx.value(ORDERS, "ord_3", "fld_order_cust_name").unwrap(), json!(["Cyd"]));

    let mirrored = ctx.ops().cell_ops(&CUSTOMERS.to_string(), "fld_cust_orders");
    assert_eq!(mirrored.len(), 2);
    let bob = mirrored.iter().find(|(id, _)| id == "cus_bob").unwrap();
    assert_eq!(bob.1.new_value, Value::Null);
    assert_eq!(link_ids(&bob.1.old_value), vec!["ord_3"]);
    let lookups = ctx.ops().cell_ops(&ORDERS.to_string(), "fld_order_cust_name");
    assert_eq!(lookups.len(), 1);
    assert_eq!(lookups[0].1.old_value, json!(["Bob"]));
}
