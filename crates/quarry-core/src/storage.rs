//! Columnar storage engine: durable catalog, immutable partition files and
//! projected scans.
//!
//! Partitions are written once and never mutated; re-ingesting an existing
//! partition id fails. Each partition is a bincode-encoded column map under
//! `<root>/<table>/<partition>.bin`, written to a temp file and renamed into
//! place. Lookups and scans take the read lock; registration and ingest take
//! the write lock.

use crate::catalog::{Catalog, PartitionMetadata, Row, TableMetadata, TableSchema};
use crate::error::{EngineError, Result};
use crate::stats::compute_stats;
use crate::types::{Column, Value};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Read-only access to a row's values during predicate evaluation. Lookup is
/// by original column name, not by the projected subset.
pub trait RowView {
    fn value(&self, column: &str) -> Result<Value>;
}

/// Per-row predicate applied during scans. `false` or an error excludes the
/// row; errors propagate to the caller.
pub type ScanFilter = Box<dyn Fn(&dyn RowView) -> Result<bool> + Send + Sync>;

/// Controls projection, predicate and partition selection for a scan.
#[derive(Default)]
pub struct ScanOptions {
    /// Projected columns; empty means the full schema in declaration order.
    pub columns: Vec<String>,
    /// Partition ids to read; empty means all, sorted by id.
    pub partitions: Vec<String>,
    /// Rows per output batch; `None` means 4096. Must be at least 1.
    pub batch_size: Option<usize>,
    pub filter: Option<ScanFilter>,
}

/// The unit returned by scans: a projected slice of one partition.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub table: String,
    pub partition: String,
    pub columns: HashMap<String, Column>,
    pub row_count: usize,
}

#[derive(Serialize, Deserialize)]
struct PartitionPayload {
    columns: HashMap<String, Column>,
}

/// Storage engine rooted at a data directory.
pub struct Engine {
    root_dir: PathBuf,
    catalog_path: PathBuf,
    catalog: RwLock<Catalog>,
}

impl Engine {
    /// Creates or loads an engine rooted at the provided directory.
    pub fn open(root_dir: impl Into<PathBuf>) -> Result<Engine> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir)
            .map_err(|e| EngineError::Io(format!("data dir {}: {e}", root_dir.display())))?;
        let catalog_path = root_dir.join("catalog.json");
        let catalog = Catalog::load(&catalog_path)?;
        info!(root = %root_dir.display(), tables = catalog.tables.len(), "storage engine opened");
        Ok(Engine {
            root_dir,
            catalog_path,
            catalog: RwLock::new(catalog),
        })
    }

    /// Adds a schema definition to the catalog and persists it.
    pub fn register_table(&self, schema: TableSchema) -> Result<()> {
        schema.validate()?;
        let mut catalog = self.catalog.write();
        if catalog.tables.contains_key(&schema.name) {
            return Err(EngineError::TableExists(schema.name));
        }
        let now = Utc::now();
        info!(table = %schema.name, columns = schema.columns.len(), "registering table");
        catalog.tables.insert(
            schema.name.clone(),
            TableMetadata {
                name: schema.name.clone(),
                schema,
                partitions: HashMap::new(),
                created_at: now,
                updated_at: now,
            },
        );
        catalog.save(&self.catalog_path)
    }

    /// Returns a copy of the schema for the requested table.
    pub fn table(&self, name: &str) -> Result<TableSchema> {
        let catalog = self.catalog.read();
        catalog
            .tables
            .get(name)
            .map(|meta| meta.schema.clone())
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }

    /// Snapshot of all registered schemas.
    pub fn list_tables(&self) -> Vec<TableSchema> {
        let catalog = self.catalog.read();
        catalog.tables.values().map(|meta| meta.schema.clone()).collect()
    }

    /// Stores rows as a new immutable partition for the given table.
    pub fn ingest(
        &self,
        table: &str,
        partition_id: &str,
        rows: &[Row],
    ) -> Result<PartitionMetadata> {
        let mut catalog = self.catalog.write();
        let meta = catalog
            .tables
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
        if meta.partitions.contains_key(partition_id) {
            return Err(EngineError::PartitionExists(format!("{table}/{partition_id}")));
        }

        let schema = meta.schema.clone();
        let mut columns: HashMap<String, Column> = schema
            .columns
            .iter()
            .map(|c| (c.name.clone(), Column::new(c.name.clone(), c.data_type)))
            .collect();
        for (i, row) in rows.iter().enumerate() {
            schema
                .validate_row(row)
                .map_err(|e| EngineError::Schema(format!("row {i}: {e}")))?;
            for col_schema in &schema.columns {
                let value = row[&col_schema.name].clone();
                columns
                    .get_mut(&col_schema.name)
                    .expect("column built from schema")
                    .append(value)
                    .map_err(|e| {
                        EngineError::Schema(format!("row {i} column {}: {e}", col_schema.name))
                    })?;
            }
        }

        let relative_path = format!("{table}/{partition_id}.bin");
        let full_path = self.root_dir.join(&relative_path);
        write_partition(&full_path, &columns)
            .map_err(|e| EngineError::Io(format!("partition {table}/{partition_id}: {e}")))?;

        let stats = compute_stats(&columns);
        let row_count = schema
            .columns
            .first()
            .map(|c| columns[&c.name].len())
            .unwrap_or(0);
        let now = Utc::now();
        let partition_meta = PartitionMetadata {
            id: partition_id.to_string(),
            file_path: relative_path,
            row_count,
            stats,
            created_at: now,
            updated_at: now,
            tags: None,
        };

        let meta = catalog.tables.get_mut(table).expect("checked above");
        meta.partitions.insert(partition_id.to_string(), partition_meta.clone());
        meta.updated_at = now;
        catalog.save(&self.catalog_path)?;
        info!(table, partition = partition_id, rows = row_count, "partition ingested");
        Ok(partition_meta)
    }

    /// Iterates selected partitions returning projected batches of rows that
    /// satisfy the predicate, in insertion order.
    pub fn scan(&self, table: &str, opts: ScanOptions) -> Result<Vec<RecordBatch>> {
        let (schema, partition_metas) = {
            let catalog = self.catalog.read();
            let meta = catalog
                .tables
                .get(table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;

            let mut partitions = opts.partitions.clone();
            if partitions.is_empty() {
                partitions = meta
                    .sorted_partitions()
                    .into_iter()
                    .map(|p| p.id.clone())
                    .collect();
            } else {
                partitions.sort();
            }
            let mut selected = Vec::with_capacity(partitions.len());
            for id in &partitions {
                let part = meta.partitions.get(id).ok_or_else(|| {
                    EngineError::PartitionNotFound(format!("{table}/{id}"))
                })?;
                selected.push(part.clone());
            }
            (meta.schema.clone(), selected)
        };

        let projected = if opts.columns.is_empty() {
            schema.column_names()
        } else {
            opts.columns.clone()
        };
        for name in &projected {
            if schema.column_by_name(name).is_none() {
                return Err(EngineError::Schema(format!(
                    "unknown column {name} in projection"
                )));
            }
        }

        let batch_size = match opts.batch_size {
            None => DEFAULT_BATCH_SIZE,
            Some(0) => {
                return Err(EngineError::Execution("batch_size must be at least 1".into()))
            }
            Some(n) => n,
        };

        let mut result = Vec::new();
        for partition in &partition_metas {
            let full_path = self.root_dir.join(&partition.file_path);
            let columns = read_partition(&full_path)
                .map_err(|e| EngineError::Io(format!("partition {}: {e}", partition.id)))?;
            let mut row_len = partition.row_count;
            if row_len == 0 {
                if let Some(first) = columns.get(&projected[0]) {
                    row_len = first.len();
                }
            }

            let mut selected_idx = Vec::with_capacity(batch_size);
            for row_index in 0..row_len {
                if let Some(filter) = &opts.filter {
                    let row = RowAccessor { columns: &columns, index: row_index };
                    if !filter(&row)? {
                        continue;
                    }
                }
                selected_idx.push(row_index);
                if selected_idx.len() == batch_size {
                    result.push(build_batch(table, &partition.id, &columns, &projected, &selected_idx));
                    selected_idx.clear();
                }
            }
            if !selected_idx.is_empty() {
                result.push(build_batch(table, &partition.id, &columns, &projected, &selected_idx));
            }
        }
        debug!(table, batches = result.len(), "scan complete");
        Ok(result)
    }
}

fn write_partition(path: &Path, columns: &HashMap<String, Column>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = PartitionPayload { columns: columns.clone() };
    let data = bincode::serialize(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

fn read_partition(path: &Path) -> std::io::Result<HashMap<String, Column>> {
    let data = fs::read(path)?;
    let payload: PartitionPayload = bincode::deserialize(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(payload.columns)
}

fn build_batch(
    table: &str,
    partition: &str,
    columns: &HashMap<String, Column>,
    projected: &[String],
    indexes: &[usize],
) -> RecordBatch {
    let mut out = HashMap::with_capacity(projected.len());
    for name in projected {
        if let Some(col) = columns.get(name) {
            out.insert(name.clone(), project_column(col, indexes));
        }
    }
    RecordBatch {
        table: table.to_string(),
        partition: partition.to_string(),
        columns: out,
        row_count: indexes.len(),
    }
}

fn project_column(col: &Column, indexes: &[usize]) -> Column {
    let mut out = Column::new(col.name.clone(), col.data_type);
    match col.data_type {
        crate::types::DataType::Int => {
            out.int_data = indexes.iter().map(|&i| col.int_data[i]).collect();
        }
        crate::types::DataType::Float => {
            out.float_data = indexes.iter().map(|&i| col.float_data[i]).collect();
        }
        crate::types::DataType::String => {
            out.string_data = indexes.iter().map(|&i| col.string_data[i].clone()).collect();
        }
        crate::types::DataType::Bool => {
            out.bool_data = indexes.iter().map(|&i| col.bool_data[i]).collect();
        }
    }
    out
}

struct RowAccessor<'a> {
    columns: &'a HashMap<String, Column>,
    index: usize,
}

impl RowView for RowAccessor<'_> {
    fn value(&self, column: &str) -> Result<Value> {
        let col = self.columns.get(column).ok_or_else(|| {
            EngineError::Execution(format!("column {column} not found in row"))
        })?;
        col.get(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnSchema;
    use crate::types::DataType;

    fn events_schema() -> TableSchema {
        TableSchema {
            name: "events".into(),
            columns: vec![
                ColumnSchema { name: "user_id".into(), data_type: DataType::Int },
                ColumnSchema { name: "value".into(), data_type: DataType::Float },
                ColumnSchema { name: "country".into(), data_type: DataType::String },
            ],
            ..Default::default()
        }
    }

    fn event_row(user_id: i64, value: f64, country: &str) -> Row {
        Row::from([
            ("user_id".to_string(), Value::Int(user_id)),
            ("value".to_string(), Value::Float(value)),
            ("country".to_string(), Value::String(country.to_string())),
        ])
    }

    fn sample_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path().join("store")).unwrap();
        engine.register_table(events_schema()).unwrap();
        (dir, engine)
    }

    #[test]
    fn ingest_and_filtered_scan() {
        let (_dir, engine) = sample_engine();
        let rows = vec![
            event_row(42, 10.5, "BR"),
            event_row(7, 8.1, "US"),
            event_row(42, 13.4, "BR"),
        ];
        engine.ingest("events", "p1", &rows).unwrap();

        let batches = engine
            .scan(
                "events",
                ScanOptions {
                    columns: vec!["user_id".into(), "value".into()],
                    batch_size: Some(1),
                    filter: Some(Box::new(|row| {
                        Ok(row.value("user_id")?.as_int()? == 42)
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(batches.len(), 2);
        let total: usize = batches.iter().map(|b| b.row_count).sum();
        assert_eq!(total, 2);
        for batch in &batches {
            assert_eq!(batch.row_count, 1);
            assert_eq!(batch.columns.len(), 2);
            assert!(batch.columns.contains_key("user_id"));
            assert!(!batch.columns.contains_key("country"));
        }
    }

    #[test]
    fn scan_preserves_insertion_order() {
        let (_dir, engine) = sample_engine();
        let rows = vec![
            event_row(3, 1.0, "BR"),
            event_row(1, 2.0, "US"),
            event_row(2, 3.0, "AR"),
        ];
        engine.ingest("events", "p1", &rows).unwrap();
        let batches = engine.scan("events", ScanOptions::default()).unwrap();
        assert_eq!(batches.len(), 1);
        let ids = &batches[0].columns["user_id"].int_data;
        assert_eq!(ids, &vec![3, 1, 2]);
    }

    #[test]
    fn duplicate_partition_rejected() {
        let (_dir, engine) = sample_engine();
        engine.ingest("events", "p1", &[event_row(1, 1.0, "BR")]).unwrap();
        let err = engine.ingest("events", "p1", &[event_row(2, 2.0, "US")]).unwrap_err();
        assert!(matches!(err, EngineError::PartitionExists(_)));
    }

    #[test]
    fn unknown_projection_column_fails() {
        let (_dir, engine) = sample_engine();
        let err = engine
            .scan("events", ScanOptions { columns: vec!["missing".into()], ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
    }

    #[test]
    fn unknown_partition_fails() {
        let (_dir, engine) = sample_engine();
        let err = engine
            .scan("events", ScanOptions { partitions: vec!["nope".into()], ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, EngineError::PartitionNotFound(_)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let (_dir, engine) = sample_engine();
        let err = engine
            .scan("events", ScanOptions { batch_size: Some(0), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn register_existing_table_fails() {
        let (_dir, engine) = sample_engine();
        let err = engine.register_table(events_schema()).unwrap_err();
        assert!(matches!(err, EngineError::TableExists(_)));
    }

    #[test]
    fn catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        {
            let engine = Engine::open(&root).unwrap();
            engine.register_table(events_schema()).unwrap();
            engine.ingest("events", "p1", &[event_row(42, 10.5, "BR")]).unwrap();
        }
        let engine = Engine::open(&root).unwrap();
        let schema = engine.table("events").unwrap();
        assert_eq!(schema.columns.len(), 3);
        assert_eq!(engine.list_tables().len(), 1);
        let batches = engine.scan("events", ScanOptions::default()).unwrap();
        assert_eq!(batches[0].row_count, 1);
        assert_eq!(batches[0].columns["country"].string_data, vec!["BR".to_string()]);
    }

    #[test]
    fn filter_error_propagates() {
        let (_dir, engine) = sample_engine();
        engine.ingest("events", "p1", &[event_row(1, 1.0, "BR")]).unwrap();
        let err = engine
            .scan(
                "events",
                ScanOptions {
                    filter: Some(Box::new(|row| {
                        row.value("missing")?;
                        Ok(true)
                    })),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn ingest_computes_stats() {
        let (_dir, engine) = sample_engine();
        let meta = engine
            .ingest(
                "events",
                "p1",
                &[event_row(42, 10.5, "BR"), event_row(7, 8.1, "US")],
            )
            .unwrap();
        let user_stats = &meta.stats["user_id"];
        assert_eq!(user_stats.count, 2);
        assert_eq!(user_stats.min.as_ref().unwrap().to_value(), Some(Value::Int(7)));
        assert_eq!(user_stats.max.as_ref().unwrap().to_value(), Some(Value::Int(42)));
    }
}
