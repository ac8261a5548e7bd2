//! Row-oriented fast path for single-table SELECTs executed directly
//! against the local storage engine.
//!
//! The runner covers the narrow subset the coordinator serves synchronously:
//! one FROM table, no GROUP BY and no aggregate functions. WHERE is a
//! short-circuiting boolean tree over comparisons; projections are `*` or
//! plain column references. LIMIT is applied after ORDER BY.

use crate::error::{EngineError, Result};
use crate::sql::{Expression, OrderExpression, SelectItem, SelectStatement, SortDirection};
use crate::storage::{Engine, ScanOptions};
use crate::types::{compare_values, Column, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// A projected output row.
pub type RunnerRow = HashMap<String, Value>;

#[derive(Clone)]
pub struct Runner {
    engine: Arc<Engine>,
}

impl Runner {
    pub fn new(engine: Arc<Engine>) -> Runner {
        Runner { engine }
    }

    /// Executes a SELECT statement and returns the projected rows.
    pub fn execute(&self, stmt: &SelectStatement) -> Result<Vec<RunnerRow>> {
        if stmt.from.len() != 1 {
            return Err(EngineError::Execution(
                "runner supports exactly one table".into(),
            ));
        }
        if !stmt.from[0].joins.is_empty() {
            return Err(EngineError::Execution("runner does not support joins".into()));
        }
        if !stmt.group_by.is_empty() {
            return Err(EngineError::Execution("runner does not support GROUP BY".into()));
        }
        if stmt
            .columns
            .iter()
            .any(|item| matches!(item.expr, Expression::Function { .. }))
        {
            return Err(EngineError::Execution(
                "runner does not support aggregate functions".into(),
            ));
        }

        let table_ref = &stmt.from[0];
        let schema = self.engine.table(&table_ref.name)?;
        let columns = schema.column_names();
        let alias = table_ref
            .alias
            .clone()
            .unwrap_or_else(|| table_ref.name.clone());

        let batches = self.engine.scan(
            &table_ref.name,
            ScanOptions { columns: columns.clone(), ..Default::default() },
        )?;

        let mut rows = Vec::new();
        for batch in &batches {
            for index in 0..batch.row_count {
                let ctx = RowContext::new(&batch.columns, &columns, index, &alias)?;
                if !evaluate_boolean(stmt.where_clause.as_ref(), &ctx)? {
                    continue;
                }
                rows.push(build_projection(&stmt.columns, &ctx)?);
            }
        }

        apply_order(&mut rows, &stmt.order_by);
        // LIMIT truncates only after the ordering is established.
        if let Some(limit) = stmt.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }
}

struct RowContext<'a> {
    values: HashMap<String, Value>,
    order: &'a [String],
    alias: String,
}

impl<'a> RowContext<'a> {
    fn new(
        columns: &HashMap<String, Column>,
        order: &'a [String],
        index: usize,
        alias: &str,
    ) -> Result<RowContext<'a>> {
        let mut values = HashMap::with_capacity(order.len());
        for name in order {
            if let Some(col) = columns.get(name) {
                values.insert(name.to_lowercase(), col.get(index)?);
            }
        }
        Ok(RowContext { values, order, alias: alias.to_lowercase() })
    }

    fn get_column(&self, table: Option<&str>, name: &str) -> Result<Value> {
        if let Some(table) = table {
            if !table.eq_ignore_ascii_case(&self.alias) {
                return Err(EngineError::Execution(format!(
                    "table {table} is not available in this row"
                )));
            }
        }
        self.values
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| EngineError::Execution(format!("column {name} not found")))
    }
}

fn evaluate_boolean(expr: Option<&Expression>, ctx: &RowContext<'_>) -> Result<bool> {
    let Some(expr) = expr else {
        return Ok(true);
    };
    match expr {
        Expression::Binary { left, op, right } => {
            let op_upper = op.to_uppercase();
            match op_upper.as_str() {
                "AND" => {
                    if !evaluate_boolean(Some(left), ctx)? {
                        return Ok(false);
                    }
                    evaluate_boolean(Some(right), ctx)
                }
                "OR" => {
                    if evaluate_boolean(Some(left), ctx)? {
                        return Ok(true);
                    }
                    evaluate_boolean(Some(right), ctx)
                }
                _ => {
                    let left = evaluate_value(left, ctx)?;
                    let right = evaluate_value(right, ctx)?;
                    let ordering = compare_values(&left, &right)?;
                    match op_upper.as_str() {
                        "=" | "==" => Ok(ordering == Ordering::Equal),
                        "!=" | "<>" => Ok(ordering != Ordering::Equal),
                        "<" => Ok(ordering == Ordering::Less),
                        "<=" => Ok(ordering != Ordering::Greater),
                        ">" => Ok(ordering == Ordering::Greater),
                        ">=" => Ok(ordering != Ordering::Less),
                        other => Err(EngineError::Execution(format!(
                            "operator {other} is not supported"
                        ))),
                    }
                }
            }
        }
        Expression::Unary { op, expr } if op.eq_ignore_ascii_case("NOT") => {
            Ok(!evaluate_boolean(Some(expr), ctx)?)
        }
        Expression::Unary { op, .. } => Err(EngineError::Execution(format!(
            "unary operator {op} is not supported"
        ))),
        other => {
            let value = evaluate_value(other, ctx)?;
            value.as_bool().map_err(|_| {
                EngineError::Execution(format!(
                    "value of type {} cannot be interpreted as boolean",
                    value.data_type()
                ))
            })
        }
    }
}

fn evaluate_value(expr: &Expression, ctx: &RowContext<'_>) -> Result<Value> {
    match expr {
        Expression::Column { table, name } => ctx.get_column(table.as_deref(), name),
        Expression::Literal(value) => Ok(value.clone()),
        Expression::Binary { .. } => Err(EngineError::Execution(
            "arithmetic expressions are not supported".into(),
        )),
        other => Err(EngineError::Execution(format!(
            "expression {other} is not supported"
        ))),
    }
}

fn build_projection(items: &[SelectItem], ctx: &RowContext<'_>) -> Result<RunnerRow> {
    let mut result = RunnerRow::new();
    let wildcard_item = [SelectItem { expr: Expression::Wildcard { table: None }, alias: None }];
    let items = if items.is_empty() { &wildcard_item[..] } else { items };
    for item in items {
        match &item.expr {
            Expression::Wildcard { .. } => {
                for name in ctx.order {
                    if let Some(value) = ctx.values.get(&name.to_lowercase()) {
                        result.insert(name.clone(), value.clone());
                    }
                }
            }
            Expression::Column { table, name } => {
                let value = ctx.get_column(table.as_deref(), name)?;
                let key = item.alias.clone().unwrap_or_else(|| name.clone());
                result.insert(key, value);
            }
            _ => {
                return Err(EngineError::Execution(
                    "only column projections are supported".into(),
                ))
            }
        }
    }
    Ok(result)
}

fn apply_order(rows: &mut [RunnerRow], order: &[OrderExpression]) {
    if order.is_empty() || rows.len() <= 1 {
        return;
    }
    rows.sort_by(|left, right| {
        for item in order {
            let Expression::Column { name, .. } = &item.expr else {
                continue;
            };
            let (Some(l), Some(r)) = (left.get(name), right.get(name)) else {
                continue;
            };
            let ordering = compare_values(l, r).unwrap_or(Ordering::Equal);
            if ordering == Ordering::Equal {
                continue;
            }
            return match item.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
        }
        Ordering::Equal
    });
}
