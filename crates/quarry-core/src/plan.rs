//! Physical plan tree: nodes, properties and rendering.
//!
//! Plan nodes carry operator parameters in a free-form JSON property map so
//! the planner, the coordinator and the visualizer can agree on a single
//! serialized shape.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies the physical operator a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanNodeType {
    Scan,
    Filter,
    Project,
    Aggregate,
    Exchange,
    Join,
    Sort,
    Limit,
    Root,
}

impl fmt::Display for PlanNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanNodeType::Scan => "SCAN",
            PlanNodeType::Filter => "FILTER",
            PlanNodeType::Project => "PROJECT",
            PlanNodeType::Aggregate => "AGGREGATE",
            PlanNodeType::Exchange => "EXCHANGE",
            PlanNodeType::Join => "JOIN",
            PlanNodeType::Sort => "SORT",
            PlanNodeType::Limit => "LIMIT",
            PlanNodeType::Root => "ROOT",
        };
        f.write_str(name)
    }
}

/// A node with children and operator-specific properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: PlanNodeType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PlanNode>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Json>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub stats: HashMap<String, Json>,
}

impl PlanNode {
    pub fn add_child(&mut self, child: PlanNode) {
        self.children.push(child);
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// Preorder traversal.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a PlanNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Issues `node-NNN` identifiers. Each planner owns one so isolated plans in
/// tests do not share a counter.
#[derive(Debug, Default)]
pub struct NodeIds {
    counter: AtomicU64,
}

impl NodeIds {
    pub fn new() -> NodeIds {
        NodeIds::default()
    }

    pub fn node(&self, node_type: PlanNodeType) -> PlanNode {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        PlanNode {
            id: format!("node-{id:03}"),
            node_type,
            children: Vec::new(),
            properties: HashMap::new(),
            stats: HashMap::new(),
        }
    }
}

/// The distributed operator tree produced by the planner, wrapped in a ROOT
/// sentinel with exactly one child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    pub root: PlanNode,
}

impl PhysicalPlan {
    /// Readable JSON rendering of the whole plan.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Serialization(format!("plan: {e}")))
    }

    /// Graphviz DOT rendering.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph Plan {\n  rankdir=TB;\n");
        self.root.walk(&mut |node| {
            let mut label = format!("{}\\n{}", node.id, node.node_type);
            if !node.properties.is_empty() {
                let mut keys: Vec<&String> = node.properties.keys().collect();
                keys.sort();
                for key in keys {
                    label.push_str(&format!("\\n{key}={}", node.properties[key]));
                }
            }
            out.push_str(&format!("  \"{}\" [label=\"{label}\", shape=box];\n", node.id));
            for child in &node.children {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", node.id, child.id));
            }
        });
        out.push_str("}\n");
        out
    }
}
