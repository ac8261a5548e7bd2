//! Table schemas and the persisted catalog.
//!
//! The catalog is the source of truth for every table and partition the
//! engine knows about. It is serialized as pretty-printed JSON at
//! `<root>/catalog.json` and replaced atomically on every update; a crash
//! between writing a partition file and saving the catalog leaves an orphan
//! file the catalog never references.

use crate::error::{EngineError, Result};
use crate::types::{DataType, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

/// Table metadata as declared at registration time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

/// A row ready to be ingested: column name to value. Every schema column
/// must be present; extra keys are ignored.
pub type Row = HashMap<String, Value>;

impl TableSchema {
    /// Ensures the schema definition is sane.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Schema("table name is required".into()));
        }
        if self.columns.is_empty() {
            return Err(EngineError::Schema(format!(
                "table {} must have at least one column",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if col.name.trim().is_empty() {
                return Err(EngineError::Schema(format!(
                    "table {} has a column without name",
                    self.name
                )));
            }
            if !seen.insert(col.name.to_lowercase()) {
                return Err(EngineError::Schema(format!(
                    "duplicated column {} in table {}",
                    col.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Ordered list of column names as declared.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Looks a column up by name, ignoring case.
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Checks that the row carries a correctly typed value for every column.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        for col in &self.columns {
            let value = row.get(&col.name).ok_or_else(|| {
                EngineError::Schema(format!("missing value for column {:?}", col.name))
            })?;
            if value.data_type() != col.data_type {
                return Err(EngineError::Schema(format!(
                    "column {} expects {} but received {}",
                    col.name,
                    col.data_type,
                    value.data_type()
                )));
            }
        }
        Ok(())
    }
}

/// JSON-friendly rendering of a scalar, used for min/max statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarValue {
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool: Option<bool>,
}

impl ScalarValue {
    pub fn from_value(value: &Value) -> ScalarValue {
        let mut scalar = ScalarValue {
            data_type: value.data_type(),
            int: None,
            string: None,
            float: None,
            bool: None,
        };
        match value {
            Value::Int(v) => scalar.int = Some(*v),
            Value::String(v) => scalar.string = Some(v.clone()),
            Value::Float(v) => scalar.float = Some(*v),
            Value::Bool(v) => scalar.bool = Some(*v),
        }
        scalar
    }

    pub fn to_value(&self) -> Option<Value> {
        match self.data_type {
            DataType::Int => self.int.map(Value::Int),
            DataType::String => self.string.clone().map(Value::String),
            DataType::Float => self.float.map(Value::Float),
            DataType::Bool => self.bool.map(Value::Bool),
        }
    }
}

/// Basic per-column statistics used for pruning and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnStats {
    pub count: usize,
    #[serde(default)]
    pub null_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<ScalarValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<ScalarValue>,
}

/// Points at a serialized partition file and carries its statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMetadata {
    pub id: String,
    pub file_path: String,
    pub row_count: usize,
    pub stats: HashMap<String, ColumnStats>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

/// Schema plus partitions for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub name: String,
    pub schema: TableSchema,
    pub partitions: HashMap<String, PartitionMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableMetadata {
    /// Partition metadata sorted by id.
    pub fn sorted_partitions(&self) -> Vec<&PartitionMetadata> {
        let mut ids: Vec<&String> = self.partitions.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| &self.partitions[id]).collect()
    }
}

/// The persisted description of all tables and partitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub tables: HashMap<String, TableMetadata>,
}

impl Catalog {
    /// Writes the catalog atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::Io(format!("catalog dir: {e}")))?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::Serialization(format!("catalog: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|e| EngineError::Io(format!("catalog tmp: {e}")))?;
        fs::rename(&tmp, path).map_err(|e| EngineError::Io(format!("catalog rename: {e}")))?;
        Ok(())
    }

    /// Reads catalog info, or returns an empty catalog when the file does
    /// not exist yet.
    pub fn load(path: &Path) -> Result<Catalog> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Catalog::default());
            }
            Err(e) => return Err(EngineError::Io(format!("catalog read: {e}"))),
        };
        serde_json::from_slice(&data)
            .map_err(|e| EngineError::Serialization(format!("catalog parse: {e}")))
    }
}
