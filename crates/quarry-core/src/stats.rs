//! Per-column statistics computed at ingest time.

use crate::catalog::{ColumnStats, ScalarValue};
use crate::types::{Column, DataType, Value};
use std::collections::HashMap;

pub fn compute_stats(columns: &HashMap<String, Column>) -> HashMap<String, ColumnStats> {
    columns
        .iter()
        .map(|(name, col)| (name.clone(), summarize_column(col)))
        .collect()
}

fn summarize_column(col: &Column) -> ColumnStats {
    if col.is_empty() {
        return ColumnStats::default();
    }
    match col.data_type {
        DataType::Int => {
            let min = *col.int_data.iter().min().unwrap();
            let max = *col.int_data.iter().max().unwrap();
            stats_of(col.int_data.len(), Value::Int(min), Value::Int(max))
        }
        DataType::Float => {
            let mut min = col.float_data[0];
            let mut max = col.float_data[0];
            for &v in &col.float_data[1..] {
                if v < min {
                    min = v;
                }
                if v > max {
                    max = v;
                }
            }
            stats_of(col.float_data.len(), Value::Float(min), Value::Float(max))
        }
        DataType::String => {
            let min = col.string_data.iter().min().unwrap().clone();
            let max = col.string_data.iter().max().unwrap().clone();
            stats_of(col.string_data.len(), Value::String(min), Value::String(max))
        }
        DataType::Bool => {
            // min = any false ever seen, max = any true ever seen
            let any_false = col.bool_data.iter().any(|v| !v);
            let any_true = col.bool_data.iter().any(|v| *v);
            stats_of(
                col.bool_data.len(),
                Value::Bool(!any_false),
                Value::Bool(any_true),
            )
        }
    }
}

fn stats_of(count: usize, min: Value, max: Value) -> ColumnStats {
    ColumnStats {
        count,
        null_count: 0,
        min: Some(ScalarValue::from_value(&min)),
        max: Some(ScalarValue::from_value(&max)),
    }
}
