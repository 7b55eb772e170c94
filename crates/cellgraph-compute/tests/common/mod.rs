#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use cellgraph_compute::ComputeContext;
use cellgraph_core::{
    Aggregate, BinaryOp, ComputeConfig, Expr, Field, FieldId, FieldType, Filter, FilterOperator,
    LookupOptions, Relationship, TableDomain,
};
use cellgraph_memstore::{LinkSpec, MemoryStore, MemoryTransaction};
use serde_json::{json, Value};

pub const ORDERS: &str = "tbl_orders";
pub const CUSTOMERS: &str = "tbl_customers";

pub fn row(pairs: &[(&str, Value)]) -> BTreeMap<FieldId, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn text(id: &str, name: &str) -> Field {
    Field::new(id, name, FieldType::SingleLineText)
}

pub fn number(id: &str, name: &str) -> Field {
    Field::new(id, name, FieldType::Number)
}

pub fn test_config() -> ComputeConfig {
    ComputeConfig {
        deadlock_backoff_ms: 1,
        ..ComputeConfig::default()
    }
}

pub fn context(tx: &Arc<MemoryTransaction>, config: ComputeConfig) -> ComputeContext {
    cellgraph_core::init_tracing("warn");
    ComputeContext::new(tx.clone(), tx.clone(), config)
}

/// Ids of a link-shaped cell, in stored order.
pub fn link_ids(value: &Value) -> Vec<String> {
    cellgraph_compute::link_ids_in(value)
}

pub fn orders_table() -> TableDomain {
    TableDomain::new(
        ORDERS,
        "Orders",
        "t_orders",
        vec![
            text("fld_order_title", "Title"),
            number("fld_amount", "Amount"),
            text("fld_customer_name", "Customer name"),
            Field::formula(
                "fld_amount_x2",
                "Amount x2",
                Expr::binary(BinaryOp::Mul, Expr::field("fld_amount"), Expr::literal(json!(2))),
            ),
        ],
    )
}

pub fn customers_table() -> TableDomain {
    TableDomain::new(
        CUSTOMERS,
        "Customers",
        "t_customers",
        vec![text("fld_cust_name", "Name").unique()],
    )
}

/// Orders and customers without any link between them. Customers carry
/// conditional rollups over orders.
pub fn conditional_shop() -> (MemoryStore, Arc<MemoryTransaction>) {
    let store = MemoryStore::new();
    let tx = Arc::new(store.begin());
    tx.create_table(orders_table()).unwrap();
    tx.create_table(customers_table()).unwrap();
    tx.create_field(
        CUSTOMERS,
        Field::rollup(
            "fld_big_total",
            "Big order total",
            Aggregate::Sum,
            LookupOptions {
                foreign_table_id: ORDERS.into(),
                lookup_field_id: "fld_amount".into(),
                link_field_id: None,
                filter: Some(Filter::and(vec![
                    Filter::condition("fld_amount", FilterOperator::IsGreater, json!(100)),
                    Filter::host_condition("fld_customer_name", FilterOperator::Is, "fld_cust_name"),
                ])),
            },
        ),
    )
    .unwrap();
    tx.insert_records(
        CUSTOMERS,
        vec![
            row(&[("id", json!("cus_ada")), ("fld_cust_name", json!("Ada"))]),
            row(&[("id", json!("cus_bob")), ("fld_cust_name", json!("Bob"))]),
        ],
    )
    .unwrap();
    tx.insert_records(
        ORDERS,
        vec![
            row(&[
                ("id", json!("ord_1")),
                ("fld_order_title", json!("Lamp")),
                ("fld_amount", json!(50)),
                ("fld_customer_name", json!("Ada")),
            ]),
            row(&[
                ("id", json!("ord_2")),
                ("fld_order_title", json!("Desk")),
                ("fld_amount", json!(200)),
                ("fld_customer_name", json!("Ada")),
            ]),
            row(&[
                ("id", json!("ord_3")),
                ("fld_order_title", json!("Chair")),
                ("fld_amount", json!(120)),
                ("fld_customer_name", json!("Bob")),
            ]),
        ],
    )
    .unwrap();
    tx.materialize_all().unwrap();
    (store, tx)
}

/// Orders linked to customers (many orders to one customer, mirrored as a
/// one-to-many list on the customer), with a rollup and a lookup across the link.
pub fn linked_shop() -> (MemoryStore, Arc<MemoryTransaction>) {
    let store = MemoryStore::new();
    let tx = Arc::new(store.begin());
    tx.create_table(orders_table()).unwrap();
    tx.create_table(customers_table()).unwrap();
    tx.create_link(
        &LinkSpec::new(
            Relationship::ManyOne,
            (ORDERS, "t_orders"),
            "fld_order_customer",
            (CUSTOMERS, "t_customers"),
            "fld_cust_name",
        )
        .symmetric("fld_cust_orders", "fld_order_title"),
    )
    .unwrap();
    tx.create_field(
        CUSTOMERS,
        Field::rollup(
            "fld_order_total",
            "Order total",
            Aggregate::Sum,
            LookupOptions {
                foreign_table_id: ORDERS.into(),
                lookup_field_id: "fld_amount".into(),
                link_field_id: Some("fld_cust_orders".into()),
                filter: None,
            },
        ),
    )
    .unwrap();
    tx.create_field(
        ORDERS,
        Field::lookup(
            "fld_order_cust_name",
            "Customer (lookup)",
            FieldType::SingleLineText,
            LookupOptions {
                foreign_table_id: CUSTOMERS.into(),
                lookup_field_id: "fld_cust_name".into(),
                link_field_id: Some("fld_order_customer".into()),
                filter: None,
            },
        ),
    )
    .unwrap();
    tx.insert_records(
        CUSTOMERS,
        vec![
            row(&[("id", json!("cus_ada")), ("fld_cust_name", json!("Ada"))]),
            row(&[("id", json!("cus_bob")), ("fld_cust_name", json!("Bob"))]),
        ],
    )
    .unwrap();
    tx.insert_records(
        ORDERS,
        vec![
            row(&[("id", json!("ord_1")), ("fld_order_title", json!("Lamp")), ("fld_amount", json!(50))]),
            row(&[("id", json!("ord_2")), ("fld_order_title", json!("Desk")), ("fld_amount", json!(200))]),
            row(&[("id", json!("ord_3")), ("fld_order_title", json!("Chair")), ("fld_amount", json!(120))]),
        ],
    )
    .unwrap();
    tx.link(ORDERS, "fld_order_customer", "ord_1", &["cus_ada"]).unwrap();
    tx.link(ORDERS, "fld_order_customer", "ord_2", &["cus_ada"]).unwrap();
    tx.link(ORDERS, "fld_order_customer", "ord_3", &["cus_bob"]).unwrap();
    tx.materialize_all().unwrap();
    (store, tx)
}

/// Two tables joined by a symmetric link of the given cardinality.
pub fn pair_tables(relationship: Relationship) -> (MemoryStore, Arc<MemoryTransaction>) {
    let store = MemoryStore::new();
    let tx = Arc::new(store.begin());
    tx.create_table(TableDomain::new("tbl_left", "Left", "t_left", vec![text("fld_left_name", "Name")]))
        .unwrap();
    tx.create_table(TableDomain::new("tbl_right", "Right", "t_right", vec![text("fld_right_name", "Name")]))
        .unwrap();
    tx.create_link(
        &LinkSpec::new(
            relationship,
            ("tbl_left", "t_left"),
            "fld_left_links",
            ("tbl_right", "t_right"),
            "fld_right_name",
        )
        .symmetric("fld_right_links", "fld_left_name"),
    )
    .unwrap();
    tx.insert_records(
        "tbl_left",
        ["l1", "l2", "l3"]
            .iter()
            .map(|id| row(&[("id", json!(id)), ("fld_left_name", json!(format!("Left {id}")))]))
            .collect(),
    )
    .unwrap();
    tx.insert_records(
        "tbl_right",
        ["r1", "r2", "r3"]
            .iter()
            .map(|id| row(&[("id", json!(id)), ("fld_right_name", json!(format!("Right {id}")))]))
            .collect(),
    )
    .unwrap();
    tx.materialize_all().unwrap();
    (store, tx)
}
