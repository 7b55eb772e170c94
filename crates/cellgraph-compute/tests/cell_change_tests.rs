mod common;

use std::sync::Arc;

use cellgraph_compute::{
    ComputeOrchestrator, ComputedEvaluator, DependencyCollector, DirectCauses,
};
use cellgraph_core::{
    CellChangeContext, CellGraphError, ComputeConfig, Field, FieldOptions, FieldType, MetadataProvider, RecordStore,
    RecordUpdate, TableDomain, ValidationCode,
};
use cellgraph_memstore::{MemorySink, MemoryStore};
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_edit_without_dependents_publishes_nothing() {
    let (store, tx) = conditional_shop();
    store.reset_stats();
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);

    let (rows, outcome) = orchestrator
        .update_records(ORDERS, &[RecordUpdate::new("ord_1").set("fld_order_title", json!("Floor lamp"))])
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(outcome.published_op_count, 0);
    assert_eq!(store.stats().update_from_select_calls, 0);
    assert_eq!(store.stats().bulk_update_calls, 1);

    // Only the base op reaches the collaboration log.
    let sink = MemorySink::new();
    assert_eq!(ctx.flush_ops(&sink).await.unwrap(), 1);
    let published = sink.published();
    assert_eq!(published[0].collection, "rec_tbl_orders");
    assert_eq!(published[0].expected_version, 1);
    assert_eq!(published[0].op_for("fld_order_title").unwrap().new_value, json!("Floor lamp"));
}

#[tokio::test]
async fn test_formula_gets_one_op_per_impacted_record() {
    let (_store, tx) = conditional_shop();
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);

    let (_, outcome) = orchestrator
        .update_records(
            ORDERS,
            &[
                RecordUpdate::new("ord_1").set("fld_amount", json!(60)),
                RecordUpdate::new("ord_3").set("fld_amount", json!(10)),
            ],
        )
        .await
        .unwrap();

    let formula_ops = ctx.ops().cell_ops(&ORDERS.to_string(), "fld_amount_x2");
    assert_eq!(formula_ops.len(), 2);
    for (record_id, op) in &formula_ops {
        let stored = tx.value(ORDERS, record_id, "fld_amount_x2").unwrap();
        assert_eq!(op.new_value, stored);
    }
    assert_eq!(tx.value(ORDERS, "ord_1", "fld_amount_x2").unwrap(), json!(120));
    assert_eq!(tx.value(ORDERS, "ord_3", "fld_amount_x2").unwrap(), json!(20));

    // Computed ops compose on top of the base edit.
    let raw = ctx.ops().snapshot();
    let computed = raw
        .iter()
        .find(|op| op.record_id == "ord_1" && op.op_for("fld_amount_x2").is_some())
        .unwrap();
    assert_eq!(computed.expected_version, 2);
    assert!(computed.op_for("fld_amount").is_none());

    let summary = outcome.impact.table(ORDERS).unwrap();
    assert_eq!(summary.record_count, Some(2));
}

#[tokio::test]
async fn test_reevaluation_is_idempotent() {
    let (_store, tx) = conditional_shop();
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);
    orchestrator
        .update_records(ORDERS, &[RecordUpdate::new("ord_1").set("fld_amount", json!(150))])
        .await
        .unwrap();
    let before = ctx.computed_op_count();

    let change = CellChangeContext::new(ORDERS, "ord_1", "fld_amount", Some(json!(50)), Some(json!(150)));
    let impact = DependencyCollector::new(&ctx)
        .collect_cell_changes(ORDERS, &[change.clone()])
        .await
        .unwrap();
    let report = ComputedEvaluator::new(&ctx)
        .evaluate(&impact, &DirectCauses::from_changes([&change]))
        .await
        .unwrap();

    assert_eq!(report.op_count, 0);
    assert!(report.rows > 0);
    assert_eq!(ctx.computed_op_count(), before);
}

#[tokio::test]
async fn test_base_edit_bumps_version_by_one() {
    let (_store, tx) = conditional_shop();
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);
    assert_eq!(tx.record(ORDERS, "ord_2").unwrap().version, 1);

    orchestrator
        .update_records(ORDERS, &[RecordUpdate::new("ord_2").at_version(1).set("fld_amount", json!(1))])
        .await
        .unwrap();
    assert_eq!(tx.record(ORDERS, "ord_2").unwrap().version, 2);

    let err = orchestrator
        .update_records(ORDERS, &[RecordUpdate::new("ord_2").at_version(1).set("fld_amount", json!(2))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::VersionMismatch));

    let err = orchestrator
        .update_records(ORDERS, &[RecordUpdate::new("ord_missing").set("fld_amount", json!(2))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::RecordNotFound));
    assert_eq!(tx.record(ORDERS, "ord_2").unwrap().version, 2);
}

#[tokio::test]
async fn test_invalid_writes_are_validation_errors() {
    let (_store, tx) = conditional_shop();
    let ctx = context(&tx, test_config());
    let orchestrator = ComputeOrchestrator::new(&ctx);

    let err = orchestrator
        .update_records(ORDERS, &[RecordUpdate::new("ord_1").set("fld_amount_x2", json!(5))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::IllegalOperation));

    let err = orchestrator
        .update_records(ORDERS, &[RecordUpdate::new("ord_1").set("fld_nope", json!(5))])
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = orchestrator
        .update_records(CUSTOMERS, &[RecordUpdate::new("cus_bob").set("fld_cust_name", json!("Ada"))])
        .await
        .unwrap_err();
    assert_eq!(err.validation_code(), Some(ValidationCode::UniqueViolation));
    assert!(err.to_string().contains("Name"));
}

#[tokio::test]
async fn test_audit_fields_are_republished_on_edited_records() {
    let store = MemoryStore::new();
    let tx = Arc::new(store.begin());
    let mut tracked = Field::new("fld_touched_by", "Touched by", FieldType::LastModifiedBy);
    tracked.options = FieldOptions::LastModifiedBy {
        tracked_field_ids: vec!["fld_status".into()],
    };
    tx.create_table(TableDomain::new(
        "tbl_tasks",
        "Tasks",
        "t_tasks",
        vec![
            text("fld_task", "Task"),
            text("fld_status", "Status"),
            Field::new("fld_edited_by", "Edited by", FieldType::LastModifiedBy),
            tracked,
        ],
    ))
    .unwrap();
    tx.insert_records(
        "tbl_tasks",
        vec![
            row(&[("id", json!("task_1")), ("fld_task", json!("Write docs"))]),
            row(&[("id", json!("task_2")), ("fld_task", json!("Ship"))]),
        ],
    )
    .unwrap();
    tx.materialize_all().unwrap();

    let ctx = context(&tx, test_config());
    let (_, outcome) = ComputeOrchestrator::new(&ctx)
        .update_records("tbl_tasks", &[RecordUpdate::new("task_1").set("fld_task", json!("Write more docs"))])
        .await
        .unwrap();

    // The actor did not change, yet the edited record republishes its audit cell.
    assert_eq!(outcome.published_op_count, 1);
    let ops = ctx.ops().cell_ops(&"tbl_tasks".to_string(), "fld_edited_by");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].0, "task_1");
    assert_eq!(ops[0].1.new_value, json!("system"));
    assert!(ctx.ops().cell_ops(&"tbl_tasks".to_string(), "fld_touched_by").is_empty());
}

#[tokio::test]
async fn test_deadlocks_are_retried_with_identical_inputs() {
    let (store, tx) = conditional_shop();
    store.reset_stats();
    store.inject_deadlocks(2);
    let ctx = context(&tx, test_config());

    ComputeOrchestrator::new(&ctx)
        .update_records(ORDERS, &[RecordUpdate::new("ord_1").set("fld_amount", json!(70))])
        .await
        .unwrap();

    assert_eq!(tx.value(ORDERS, "ord_1", "fld_amount_x2").unwrap(), json!(140));
    // One table in one layer: the first two attempts deadlock.
    assert_eq!(store.stats().update_from_select_calls, 3);
}

#[tokio::test]
async fn test_deadlocks_surface_after_bounded_retries() {
    let (store, tx) = conditional_shop();
    store.reset_stats();
    store.inject_deadlocks(10);
    let config = ComputeConfig {
        deadlock_max_retries: 2,
        ..test_config()
    };
    let ctx = context(&tx, config);

    let err = ComputeOrchestrator::new(&ctx)
        .update_records(ORDERS, &[RecordUpdate::new("ord_1").set("fld_amount", json!(70))])
        .await
        .unwrap_err();

    assert!(err.is_deadlock());
    assert_eq!(store.stats().update_from_select_calls, 3);
    let CellGraphError::Storage(storage) = &err else {
        panic!("expected a storage error, got {err}");
    };
    let context = storage.context.as_ref().unwrap();
    assert_eq!(context.table.as_deref(), Some("t_orders"));
    assert_eq!(context.fields, vec!["fld_amount_x2".to_string()]);
    assert!(context.sql.as_deref().unwrap().starts_with("UPDATE \"t_orders\""));
    let rendered = err.to_string();
    assert!(rendered.contains("[fields=fld_amount_x2]"));
    assert!(rendered.contains("[sql=UPDATE"));
}

#[tokio::test]
async fn test_row_locks_follow_physical_name_order() {
    let (store, tx) = linked_shop();
    store.reset_stats();
    let ctx = context(&tx, test_config());

    ComputeOrchestrator::new(&ctx)
        .update_records(ORDERS, &[RecordUpdate::new("ord_3").set("fld_amount", json!(130))])
        .await
        .unwrap();

    let locked: Vec<String> = store.stats().lock_log.into_iter().map(|(table, _)| table).collect();
    assert_eq!(locked, vec!["t_customers".to_string(), "t_orders".to_string()]);
    assert_eq!(tx.value(CUSTOMERS, "cus_bob", "fld_order_total").unwrap(), json!(130));
}

#[tokio::test]
async fn test_single_writer_storage_skips_row_locks() {
    let store = MemoryStore::single_writer();
    let tx = Arc::new(store.begin());
    tx.create_table(orders_table()).unwrap();
    tx.insert_records(ORDERS, vec![row(&[("id", json!("ord_1")), ("fld_amount", json!(3))])])
        .unwrap();
    let ctx = context(&tx, test_config());
    assert!(!ctx.store().supports_row_locks());

    ComputeOrchestrator::new(&ctx)
        .update_records(ORDERS, &[RecordUpdate::new("ord_1").set("fld_amount", json!(4))])
        .await
        .unwrap();

    assert!(store.stats().lock_log.is_empty());
    assert_eq!(tx.value(ORDERS, "ord_1", "fld_amount_x2").unwrap(), json!(8));
}

#[tokio::test]
async fn test_multiple_sources_are_merged_into_one_pass() {
    let (store, tx) = conditional_shop();
    store.reset_stats();
    let ctx = context(&tx, test_config());
    let sources = vec![
        cellgraph_compute::CellChangeSource {
            table_id: ORDERS.into(),
            changes: vec![CellChangeContext::new(ORDERS, "ord_1", "fld_amount", Some(json!(50)), Some(json!(5)))],
        },
        cellgraph_compute::CellChangeSource {
            table_id: ORDERS.into(),
            changes: vec![CellChangeContext::new(ORDERS, "ord_2", "fld_amount", Some(json!(200)), Some(json!(20)))],
        },
    ];
    let table = tx.get_table_domain(ORDERS).await.unwrap();
    let (_, outcome) = ComputeOrchestrator::new(&ctx)
        .compute_cell_changes_multi(&sources, async {
            tx.bulk_update(
                &table,
                &["fld_amount".to_string()],
                &[("ord_1".into(), vec![json!(5)]), ("ord_2".into(), vec![json!(20)])],
                "system",
            )
            .await
        })
        .await
        .unwrap();

    assert_eq!(tx.value(ORDERS, "ord_1", "fld_amount_x2").unwrap(), json!(10));
    assert_eq!(tx.value(ORDERS, "ord_2", "fld_amount_x2").unwrap(), json!(40));
    // ord_2 dropped out of Ada's big-order total.
    assert_eq!(tx.value(CUSTOMERS, "cus_ada", "fld_big_total").unwrap(), json!(0));
    assert_eq!(outcome.impact.table(ORDERS).unwrap().record_count, Some(2));
}
