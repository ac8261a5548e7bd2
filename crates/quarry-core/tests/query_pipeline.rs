//! End-to-end pipeline tests: real storage engine under parsed and planned
//! SQL, executed through the vectorized operators.

use quarry_core::executor::{
    AggregateExec, AggregateFunc, AggregateMeasure, Executor, FilterExec, HashJoinExec,
    JoinCondition, LimitExec, ScanExec, SortExec, SortKey,
};
use quarry_core::{
    parse, Column, ColumnSchema, DataType, Engine, Planner, PlanNodeType, Row, ScanOptions, Value,
};
use std::sync::Arc;

fn events_engine() -> (tempfile::TempDir, Arc<Engine>) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::open(dir.path().join("store")).unwrap());
    engine
        .register_table(quarry_core::TableSchema {
            name: "events".into(),
            columns: vec![
                ColumnSchema { name: "user_id".into(), data_type: DataType::Int },
                ColumnSchema { name: "country".into(), data_type: DataType::String },
                ColumnSchema { name: "amount".into(), data_type: DataType::Float },
            ],
            ..Default::default()
        })
        .unwrap();
    let rows: Vec<Row> = (0..5)
        .map(|i| {
            Row::from([
                ("user_id".to_string(), Value::Int(i % 2)),
                (
                    "country".to_string(),
                    Value::String(if i % 2 == 0 { "BR" } else { "US" }.to_string()),
                ),
                ("amount".to_string(), Value::Float(i as f64 + 1.0)),
            ])
        })
        .collect();
    engine.ingest("events", "p1", &rows).unwrap();
    (dir, engine)
}

fn users_table(engine: &Engine) {
    engine
        .register_table(quarry_core::TableSchema {
            name: "users".into(),
            columns: vec![
                ColumnSchema { name: "id".into(), data_type: DataType::Int },
                ColumnSchema { name: "name".into(), data_type: DataType::String },
            ],
            ..Default::default()
        })
        .unwrap();
    let rows: Vec<Row> = [(0, "alice"), (1, "bob")]
        .iter()
        .map(|(id, name)| {
            Row::from([
                ("id".to_string(), Value::Int(*id)),
                ("name".to_string(), Value::String(name.to_string())),
            ])
        })
        .collect();
    engine.ingest("users", "u1", &rows).unwrap();
}

#[test]
fn scan_filter_aggregate_over_real_storage() {
    let (_dir, engine) = events_engine();
    let scan = ScanExec::new(engine, "events", ScanOptions::default());
    let filter = FilterExec::new(
        Box::new(scan),
        Box::new(|row| Ok(row.value("country")?.as_str()? == "BR")),
    );
    let mut agg = AggregateExec::new(
        Box::new(filter),
        vec!["country".into()],
        vec![
            AggregateMeasure {
                func: AggregateFunc::Count,
                column: "*".into(),
                alias: Some("total".into()),
            },
            AggregateMeasure {
                func: AggregateFunc::Sum,
                column: "amount".into(),
                alias: Some("sum_amount".into()),
            },
        ],
    );

    let result = agg.next().unwrap().unwrap();
    assert_eq!(result.row_count, 1);
    assert_eq!(result.columns["total"].get(0).unwrap(), Value::Int(3));
    assert_eq!(result.columns["sum_amount"].get(0).unwrap(), Value::Float(9.0));
    assert!(agg.next().unwrap().is_none());
    agg.close();
}

#[test]
fn scan_join_sort_limit_over_real_storage() {
    let (_dir, engine) = events_engine();
    users_table(&engine);

    let users = ScanExec::new(engine.clone(), "users", ScanOptions::default());
    let events = ScanExec::new(engine, "events", ScanOptions::default());
    let join = HashJoinExec::new(
        Box::new(users),
        Box::new(events),
        JoinCondition { left_column: "id".into(), right_column: "user_id".into() },
    );
    let sort = SortExec::new(
        Box::new(join),
        vec![SortKey { column: "right.amount".into(), ascending: false }],
        16,
    );
    let mut limit = LimitExec::new(Box::new(sort), 2);

    let batch = limit.next().unwrap().unwrap();
    assert_eq!(batch.row_count, 2);
    assert_eq!(batch.columns["right.amount"].float_data, vec![5.0, 4.0]);
    assert_eq!(batch.columns["name"].get(0).unwrap(), Value::String("alice".into()));
    assert_eq!(batch.columns["name"].get(1).unwrap(), Value::String("bob".into()));
    assert!(limit.next().unwrap().is_none());
}

#[test]
fn scan_row_totals_match_filter_counts() {
    let (_dir, engine) = events_engine();
    // sum(batch.row_count) equals the number of rows satisfying the filter
    for batch_size in [1, 2, 4096] {
        let batches = engine
            .scan(
                "events",
                ScanOptions {
                    batch_size: Some(batch_size),
                    filter: Some(Box::new(|row| Ok(row.value("user_id")?.as_int()? == 0))),
                    ..Default::default()
                },
            )
            .unwrap();
        let total: usize = batches.iter().map(|b| b.row_count).sum();
        assert_eq!(total, 3, "batch_size {batch_size}");
        for batch in &batches {
            for col in batch.columns.values() {
                assert_eq!(col.len(), batch.row_count);
            }
        }
    }
}

#[test]
fn parsed_sql_plans_into_executable_fragments() {
    let (_dir, engine) = events_engine();
    users_table(&engine);

    let stmt = parse(
        "SELECT e.user_id, COUNT(*) AS total FROM events e \
         JOIN users u ON e.user_id = u.id \
         WHERE e.country = 'BR' AND e.user_id = u.id \
         GROUP BY e.user_id ORDER BY total DESC LIMIT 10",
    )
    .unwrap();
    let planner = Planner::new(engine.clone());
    let plan = planner.build(&stmt).unwrap();

    assert_eq!(plan.root.node_type, PlanNodeType::Root);
    assert_eq!(plan.root.children.len(), 1);

    let fragments = quarry_core::collect_fragments(&plan.root);
    assert_eq!(fragments.len(), 2);
    // Every fragment is an executable scan over a known table.
    for fragment in &fragments {
        let table = fragment.property_str("table").unwrap();
        let batches = engine.scan(table, ScanOptions::default()).unwrap();
        assert!(!batches.is_empty());
    }
}

#[test]
fn multi_partition_scan_orders_partitions_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("store")).unwrap();
    engine
        .register_table(quarry_core::TableSchema {
            name: "t".into(),
            columns: vec![ColumnSchema { name: "v".into(), data_type: DataType::Int }],
            ..Default::default()
        })
        .unwrap();
    for (partition, value) in [("p2", 2), ("p1", 1), ("p3", 3)] {
        engine
            .ingest("t", partition, &[Row::from([("v".to_string(), Value::Int(value))])])
            .unwrap();
    }
    let batches = engine.scan("t", ScanOptions::default()).unwrap();
    let values: Vec<i64> = batches
        .iter()
        .flat_map(|b| b.columns["v"].int_data.clone())
        .collect();
    assert_eq!(values, vec![1, 2, 3]);

    let partitions: Vec<String> = batches.iter().map(|b| b.partition.clone()).collect();
    assert_eq!(partitions, vec!["p1", "p2", "p3"]);
}

#[test]
fn empty_partition_emits_no_batches() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("store")).unwrap();
    engine
        .register_table(quarry_core::TableSchema {
            name: "t".into(),
            columns: vec![ColumnSchema { name: "v".into(), data_type: DataType::Int }],
            ..Default::default()
        })
        .unwrap();
    engine.ingest("t", "p1", &[]).unwrap();
    let batches = engine.scan("t", ScanOptions::default()).unwrap();
    assert!(batches.is_empty());
}

#[test]
fn batch_columns_are_owned_copies() {
    let (_dir, engine) = events_engine();
    let batches = engine.scan("events", ScanOptions::default()).unwrap();
    let mut column: Column = batches[0].columns["user_id"].clone();
    column.append(Value::Int(99)).unwrap();
    let again = engine.scan("events", ScanOptions::default()).unwrap();
    assert_eq!(again[0].columns["user_id"].len(), 5);
}

#[test]
fn ingest_scan_roundtrip_preserves_values() {
    let (_dir, engine) = events_engine();
    let batches = engine
        .scan(
            "events",
            ScanOptions { partitions: vec!["p1".into()], ..Default::default() },
        )
        .unwrap();
    let mut amounts = Vec::new();
    for batch in &batches {
        for i in 0..batch.row_count {
            amounts.push(batch.columns["amount"].get(i).unwrap());
        }
    }
    let expected: Vec<Value> = (0..5).map(|i| Value::Float(i as f64 + 1.0)).collect();
    assert_eq!(amounts, expected);
}
