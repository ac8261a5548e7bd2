//! Turns a parsed [`SelectStatement`] into a distributed [`PhysicalPlan`].
//!
//! The planner splits the WHERE clause into conjuncts, pushes single-table
//! predicates down to the owning scan, folds the FROM clause into a join
//! tree, and rewrites aggregation queries into the two-stage
//! local/exchange/global shape the coordinator expects.

use crate::catalog::TableSchema;
use crate::error::{EngineError, Result};
use crate::plan::{NodeIds, PhysicalPlan, PlanNode, PlanNodeType};
use crate::sql::{
    Expression, JoinType, OrderExpression, SelectItem, SelectStatement, SortDirection,
    TableReference,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// The minimum the planner needs to resolve schemas.
pub trait MetadataProvider: Send + Sync {
    fn table(&self, name: &str) -> Result<TableSchema>;
}

impl MetadataProvider for crate::storage::Engine {
    fn table(&self, name: &str) -> Result<TableSchema> {
        crate::storage::Engine::table(self, name)
    }
}

/// Projection entry recorded on PROJECT nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionSpec {
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wildcard: bool,
}

/// Aggregate entry recorded on AGGREGATE nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub func: String,
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub distinct: bool,
}

/// Sort entry recorded on SORT nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub expr: String,
    pub direction: String,
}

pub struct Planner {
    metadata: Arc<dyn MetadataProvider>,
    ids: NodeIds,
}

impl Planner {
    pub fn new(metadata: Arc<dyn MetadataProvider>) -> Planner {
        Planner { metadata, ids: NodeIds::new() }
    }

    /// Builds the distributed physical plan for the query.
    pub fn build(&self, stmt: &SelectStatement) -> Result<PhysicalPlan> {
        if stmt.from.is_empty() {
            return Err(EngineError::Plan("FROM clause is required".into()));
        }

        let (table_predicates, global_predicates) = split_predicates(stmt);
        let mut root = self.build_from_tree(&stmt.from, &table_predicates)?;

        if !global_predicates.is_empty() {
            let mut filter = self.ids.node(PlanNodeType::Filter);
            filter
                .properties
                .insert("predicates".into(), json!(expressions_to_strings(&global_predicates)));
            filter.add_child(root);
            root = filter;
        }

        let projections = projection_specs(&stmt.columns);
        if !projections.is_empty() && !projections.iter().all(|p| p.wildcard) {
            let mut project = self.ids.node(PlanNodeType::Project);
            project.properties.insert("items".into(), json!(projections));
            project.add_child(root);
            root = project;
        }

        if needs_aggregation(stmt) {
            root = self.build_aggregation(root, stmt)?;
        }

        if !stmt.order_by.is_empty() {
            let mut sort = self.ids.node(PlanNodeType::Sort);
            sort.properties
                .insert("keys".into(), json!(sort_specs(&stmt.order_by)));
            sort.add_child(root);
            root = sort;
        }

        if let Some(limit) = stmt.limit {
            let mut limit_node = self.ids.node(PlanNodeType::Limit);
            limit_node.properties.insert("count".into(), json!(limit));
            limit_node.add_child(root);
            root = limit_node;
        }

        let mut final_root = self.ids.node(PlanNodeType::Root);
        final_root.add_child(root);
        Ok(PhysicalPlan { root: final_root })
    }

    fn build_from_tree(
        &self,
        from: &[TableReference],
        table_predicates: &HashMap<String, Vec<Expression>>,
    ) -> Result<PlanNode> {
        let mut root: Option<PlanNode> = None;
        for table_ref in from {
            let sub_plan = self.build_table_node(table_ref, table_predicates)?;
            root = Some(match root {
                None => sub_plan,
                // Comma-separated tables become an implicit CROSS join.
                Some(left) => self.join_node(left, sub_plan, JoinType::Cross, None),
            });
        }
        Ok(root.expect("from clause checked non-empty"))
    }

    fn build_table_node(
        &self,
        table_ref: &TableReference,
        table_predicates: &HashMap<String, Vec<Expression>>,
    ) -> Result<PlanNode> {
        let mut root = self.scan_node(
            &table_ref.name,
            table_ref.alias.as_deref(),
            table_predicates,
        )?;
        for join in &table_ref.joins {
            let right = self.scan_node(&join.table, join.alias.as_deref(), table_predicates)?;
            root = self.join_node(root, right, join.join_type, Some(&join.condition));
        }
        Ok(root)
    }

    fn scan_node(
        &self,
        table: &str,
        alias: Option<&str>,
        table_predicates: &HashMap<String, Vec<Expression>>,
    ) -> Result<PlanNode> {
        let schema = self.metadata.table(table)?;
        let alias = alias.unwrap_or(table).to_lowercase();
        let mut scan = self.ids.node(PlanNodeType::Scan);
        scan.properties.insert("table".into(), json!(table));
        scan.properties.insert("alias".into(), json!(&alias));
        scan.properties.insert("columns".into(), json!(schema.column_names()));

        if let Some(predicates) = table_predicates.get(&alias) {
            if !predicates.is_empty() {
                let mut filter = self.ids.node(PlanNodeType::Filter);
                filter
                    .properties
                    .insert("predicates".into(), json!(expressions_to_strings(predicates)));
                filter.add_child(scan);
                return Ok(filter);
            }
        }
        Ok(scan)
    }

    fn join_node(
        &self,
        left: PlanNode,
        right: PlanNode,
        join_type: JoinType,
        condition: Option<&Expression>,
    ) -> PlanNode {
        let mut join = self.ids.node(PlanNodeType::Join);
        join.properties.insert("type".into(), json!(join_type.as_str()));
        if let Some(condition) = condition {
            join.properties.insert("condition".into(), json!(condition.to_string()));
        }
        join.add_child(left);
        join.add_child(right);
        join
    }

    fn build_aggregation(&self, child: PlanNode, stmt: &SelectStatement) -> Result<PlanNode> {
        let specs = aggregate_specs(&stmt.columns);
        if let Some(distinct) = specs.iter().find(|s| s.distinct) {
            return Err(EngineError::Plan(format!(
                "DISTINCT aggregates are not supported: {}({})",
                distinct.func, distinct.expr
            )));
        }
        let group_keys = expressions_to_strings(&stmt.group_by);

        let mut local = self.ids.node(PlanNodeType::Aggregate);
        local.properties.insert("stage".into(), json!("LOCAL"));
        local.properties.insert("groupKeys".into(), json!(&group_keys));
        local.properties.insert("aggregates".into(), json!(&specs));
        local.add_child(child);

        let mut exchange = self.ids.node(PlanNodeType::Exchange);
        exchange.properties.insert("mode".into(), json!("SHUFFLE"));
        exchange.add_child(local);

        let mut global = self.ids.node(PlanNodeType::Aggregate);
        global.properties.insert("stage".into(), json!("GLOBAL"));
        global.properties.insert("groupKeys".into(), json!(&group_keys));
        global.properties.insert("aggregates".into(), json!(&specs));
        global.add_child(exchange);
        Ok(global)
    }
}

/// Splits WHERE into per-table predicates (keyed by lower-cased alias) and
/// the conjuncts referencing zero or several tables.
fn split_predicates(
    stmt: &SelectStatement,
) -> (HashMap<String, Vec<Expression>>, Vec<Expression>) {
    let mut by_table: HashMap<String, Vec<Expression>> = HashMap::new();
    let mut global = Vec::new();
    let Some(where_clause) = &stmt.where_clause else {
        return (by_table, global);
    };
    for predicate in split_conjuncts(where_clause) {
        let tables = referenced_tables(predicate);
        if tables.len() == 1 {
            let alias = tables.into_iter().next().expect("one table");
            by_table.entry(alias).or_default().push(predicate.clone());
        } else {
            global.push(predicate.clone());
        }
    }
    (by_table, global)
}

fn split_conjuncts(expr: &Expression) -> Vec<&Expression> {
    match expr {
        Expression::Binary { left, op, right } if op.eq_ignore_ascii_case("AND") => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        other => vec![other],
    }
}

fn referenced_tables(expr: &Expression) -> std::collections::HashSet<String> {
    let mut tables = std::collections::HashSet::new();
    expr.walk(&mut |e| {
        if let Expression::Column { table: Some(table), .. } = e {
            tables.insert(table.to_lowercase());
        }
    });
    tables
}

fn expressions_to_strings(exprs: &[Expression]) -> Vec<String> {
    exprs.iter().map(|e| e.to_string()).collect()
}

fn projection_specs(items: &[SelectItem]) -> Vec<ProjectionSpec> {
    items
        .iter()
        .map(|item| ProjectionSpec {
            expr: item.expr.to_string(),
            alias: item.alias.clone(),
            wildcard: item.is_wildcard(),
        })
        .collect()
}

fn needs_aggregation(stmt: &SelectStatement) -> bool {
    !stmt.group_by.is_empty()
        || stmt
            .columns
            .iter()
            .any(|item| matches!(item.expr, Expression::Function { .. }))
}

/// Aggregate specs come only from top-level FunctionCall items of the
/// SELECT list.
fn aggregate_specs(items: &[SelectItem]) -> Vec<AggregateSpec> {
    items
        .iter()
        .filter_map(|item| match &item.expr {
            Expression::Function { name, args, distinct } => Some(AggregateSpec {
                func: name.to_uppercase(),
                expr: args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", "),
                alias: item.alias.clone(),
                distinct: *distinct,
            }),
            _ => None,
        })
        .collect()
}

fn sort_specs(items: &[OrderExpression]) -> Vec<SortSpec> {
    items
        .iter()
        .map(|item| SortSpec {
            expr: item.expr.to_string(),
            direction: match item.direction {
                SortDirection::Asc => "ASC".into(),
                SortDirection::Desc => "DESC".into(),
            },
        })
        .collect()
}
