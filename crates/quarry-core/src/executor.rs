//! Pull-based vectorized operators.
//!
//! Every operator exposes `next()` returning the next batch, `Ok(None)` at
//! end of stream, and `close()` to release resources. Batches are column
//! maps with a shared row count; each executor instance runs single-threaded
//! within its pipeline.

use crate::error::{EngineError, Result};
use crate::storage::{RecordBatch, ScanOptions};
use crate::types::{compare_values, Column, DataType, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_SORT_BATCH_SIZE: usize = 1024;

/// The block of rows exchanged between operators.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub columns: HashMap<String, Column>,
    pub row_count: usize,
    pub meta: HashMap<String, String>,
}

/// Common interface of pull-based operators.
pub trait Executor {
    fn next(&mut self) -> Result<Option<Batch>>;
    fn close(&mut self);
}

/// Row-level predicate used by [`FilterExec`].
pub type Predicate = Box<dyn Fn(&BatchRow<'_>) -> Result<bool> + Send>;

/// Read-only view over one row of a batch.
pub struct BatchRow<'a> {
    batch: &'a Batch,
    index: usize,
}

impl BatchRow<'_> {
    pub fn value(&self, column: &str) -> Result<Value> {
        let col = self.batch.columns.get(column).ok_or_else(|| {
            EngineError::Execution(format!("column {column} not found in batch"))
        })?;
        col.get(self.index)
    }
}

// ============================================================================
// Scan
// ============================================================================

/// Abstracts the storage engine so executors can be driven from fakes in
/// tests.
pub trait StorageScanner: Send + Sync {
    fn scan_table(&self, table: &str, opts: ScanOptions) -> Result<Vec<RecordBatch>>;
}

impl StorageScanner for crate::storage::Engine {
    fn scan_table(&self, table: &str, opts: ScanOptions) -> Result<Vec<RecordBatch>> {
        self.scan(table, opts)
    }
}

/// Reads columnar batches from storage, one batch per stored batch.
pub struct ScanExec {
    engine: Arc<dyn StorageScanner>,
    table: String,
    options: Option<ScanOptions>,
    batches: Vec<RecordBatch>,
    index: usize,
    loaded: bool,
}

impl ScanExec {
    pub fn new(engine: Arc<dyn StorageScanner>, table: impl Into<String>, options: ScanOptions) -> ScanExec {
        ScanExec {
            engine,
            table: table.into(),
            options: Some(options),
            batches: Vec::new(),
            index: 0,
            loaded: false,
        }
    }

    fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let options = self.options.take().unwrap_or_default();
        self.batches = self.engine.scan_table(&self.table, options)?;
        self.loaded = true;
        Ok(())
    }
}

impl Executor for ScanExec {
    fn next(&mut self) -> Result<Option<Batch>> {
        self.load()?;
        if self.index >= self.batches.len() {
            return Ok(None);
        }
        let record = &self.batches[self.index];
        self.index += 1;
        let columns = record
            .columns
            .iter()
            .map(|(name, col)| (name.clone(), col.clone()))
            .collect();
        Ok(Some(Batch {
            columns,
            row_count: record.row_count,
            meta: HashMap::from([
                ("table".to_string(), record.table.clone()),
                ("partition".to_string(), record.partition.clone()),
            ]),
        }))
    }

    fn close(&mut self) {
        self.batches = Vec::new();
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Applies a predicate over child batches, materializing only passing rows.
/// A row whose predicate errors is treated as non-passing.
pub struct FilterExec {
    child: Box<dyn Executor>,
    predicate: Predicate,
}

impl FilterExec {
    pub fn new(child: Box<dyn Executor>, predicate: Predicate) -> FilterExec {
        FilterExec { child, predicate }
    }

    fn apply(&self, batch: &Batch) -> Batch {
        let mut result = Batch {
            columns: batch
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), Column::new(col.name.clone(), col.data_type)))
                .collect(),
            row_count: 0,
            meta: batch.meta.clone(),
        };
        for i in 0..batch.row_count {
            let row = BatchRow { batch, index: i };
            let pass = (self.predicate)(&row).unwrap_or(false);
            if !pass {
                continue;
            }
            for (name, col) in &batch.columns {
                if let Ok(value) = col.get(i) {
                    let _ = result.columns.get_mut(name).expect("same schema").append(value);
                }
            }
            result.row_count += 1;
        }
        result
    }
}

impl Executor for FilterExec {
    fn next(&mut self) -> Result<Option<Batch>> {
        loop {
            let Some(batch) = self.child.next()? else {
                return Ok(None);
            };
            let filtered = self.apply(&batch);
            if filtered.row_count > 0 {
                return Ok(Some(filtered));
            }
        }
    }

    fn close(&mut self) {
        self.child.close();
    }
}

// ============================================================================
// Hash join
// ============================================================================

/// Join columns; both must be present in the respective batches.
#[derive(Debug, Clone)]
pub struct JoinCondition {
    pub left_column: String,
    pub right_column: String,
}

/// In-memory INNER hash join. The left side is drained into a hash table
/// keyed by the canonical string form of the join value; right batches probe
/// it row by row. Right columns are emitted with a `right.` prefix.
pub struct HashJoinExec {
    left: Box<dyn Executor>,
    right: Box<dyn Executor>,
    condition: JoinCondition,
    hash_table: Option<HashMap<String, Vec<HashMap<String, Value>>>>,
    left_schema: HashMap<String, DataType>,
}

impl HashJoinExec {
    pub fn new(left: Box<dyn Executor>, right: Box<dyn Executor>, condition: JoinCondition) -> HashJoinExec {
        HashJoinExec {
            left,
            right,
            condition,
            hash_table: None,
            left_schema: HashMap::new(),
        }
    }

    fn build_hash_table(&mut self) -> Result<()> {
        let mut table: HashMap<String, Vec<HashMap<String, Value>>> = HashMap::new();
        while let Some(batch) = self.left.next()? {
            for i in 0..batch.row_count {
                let row = BatchRow { batch: &batch, index: i };
                let key = row.value(&self.condition.left_column)?;
                let mut record = HashMap::with_capacity(batch.columns.len());
                for name in batch.columns.keys() {
                    let value = row.value(name)?;
                    self.left_schema.insert(name.clone(), value.data_type());
                    record.insert(name.clone(), value);
                }
                table.entry(key.to_string()).or_default().push(record);
            }
        }
        self.hash_table = Some(table);
        Ok(())
    }

    fn probe(&self, batch: &Batch) -> Result<Batch> {
        let hash_table = self.hash_table.as_ref().expect("built before probing");
        let mut result = Batch::default();
        for (name, data_type) in &self.left_schema {
            result.columns.insert(name.clone(), Column::new(name.clone(), *data_type));
        }
        for (name, col) in &batch.columns {
            let output = format!("right.{name}");
            result.columns.insert(output.clone(), Column::new(output, col.data_type));
        }
        for i in 0..batch.row_count {
            let row = BatchRow { batch, index: i };
            let Ok(key) = row.value(&self.condition.right_column) else {
                continue;
            };
            let Some(matches) = hash_table.get(&key.to_string()) else {
                continue;
            };
            for record in matches {
                for (name, value) in record {
                    result
                        .columns
                        .get_mut(name)
                        .expect("left schema column")
                        .append(value.clone())?;
                }
                for name in batch.columns.keys() {
                    let value = row.value(name)?;
                    result
                        .columns
                        .get_mut(&format!("right.{name}"))
                        .expect("right column")
                        .append(value)?;
                }
                result.row_count += 1;
            }
        }
        Ok(result)
    }
}

impl Executor for HashJoinExec {
    fn next(&mut self) -> Result<Option<Batch>> {
        if self.hash_table.is_none() {
            self.build_hash_table()?;
        }
        loop {
            let Some(right_batch) = self.right.next()? else {
                return Ok(None);
            };
            let result = self.probe(&right_batch)?;
            if result.row_count > 0 {
                return Ok(Some(result));
            }
        }
    }

    fn close(&mut self) {
        self.left.close();
        self.right.close();
    }
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFunc {
    pub fn parse(name: &str) -> Result<AggregateFunc> {
        match name.to_uppercase().as_str() {
            "COUNT" => Ok(AggregateFunc::Count),
            "SUM" => Ok(AggregateFunc::Sum),
            "MIN" => Ok(AggregateFunc::Min),
            "MAX" => Ok(AggregateFunc::Max),
            "AVG" => Ok(AggregateFunc::Avg),
            other => Err(EngineError::Execution(format!(
                "unsupported aggregate function {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
            AggregateFunc::Avg => "AVG",
        }
    }

    fn output_type(&self) -> DataType {
        match self {
            AggregateFunc::Count => DataType::Int,
            _ => DataType::Float,
        }
    }
}

/// One measure computed by [`AggregateExec`].
#[derive(Debug, Clone)]
pub struct AggregateMeasure {
    pub func: AggregateFunc,
    pub column: String,
    pub alias: Option<String>,
}

impl AggregateMeasure {
    fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}({})", self.func.as_str(), self.column))
    }
}

/// Single numeric accumulator shared by all aggregate functions; INT input
/// is widened to FLOAT.
#[derive(Debug, Default)]
struct NumericAccumulator {
    count: i64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl NumericAccumulator {
    fn accumulate(&mut self, value: &Value) -> Result<()> {
        let v = match value {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            other => {
                return Err(EngineError::Execution(format!(
                    "aggregate supports only INT/FLOAT input, got {}",
                    other.data_type()
                )))
            }
        };
        self.count += 1;
        self.sum += v;
        if self.min.map_or(true, |m| v < m) {
            self.min = Some(v);
        }
        if self.max.map_or(true, |m| v > m) {
            self.max = Some(v);
        }
        Ok(())
    }

    fn finalize(&self, func: AggregateFunc) -> Value {
        match func {
            AggregateFunc::Count => Value::Int(self.count),
            AggregateFunc::Sum => Value::Float(self.sum),
            AggregateFunc::Avg => {
                if self.count == 0 {
                    Value::Float(0.0)
                } else {
                    Value::Float(self.sum / self.count as f64)
                }
            }
            AggregateFunc::Min => Value::Float(self.min.unwrap_or(0.0)),
            AggregateFunc::Max => Value::Float(self.max.unwrap_or(0.0)),
        }
    }
}

struct GroupState {
    group_values: Vec<(String, Value)>,
    accumulators: Vec<NumericAccumulator>,
}

/// Drains its child into per-group accumulators and emits a single batch
/// with one row per group.
pub struct AggregateExec {
    child: Box<dyn Executor>,
    group_keys: Vec<String>,
    measures: Vec<AggregateMeasure>,
    emitted: bool,
}

impl AggregateExec {
    pub fn new(
        child: Box<dyn Executor>,
        group_keys: Vec<String>,
        measures: Vec<AggregateMeasure>,
    ) -> AggregateExec {
        AggregateExec { child, group_keys, measures, emitted: false }
    }

    fn group_key(&self, row: &BatchRow<'_>) -> String {
        if self.group_keys.is_empty() {
            return "__all__".to_string();
        }
        let parts: Vec<String> = self
            .group_keys
            .iter()
            .map(|key| row.value(key).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        parts.join("|")
    }

    fn compute(&mut self) -> Result<Batch> {
        let mut state: HashMap<String, GroupState> = HashMap::new();
        let mut group_order: Vec<String> = Vec::new();

        while let Some(batch) = self.child.next()? {
            for i in 0..batch.row_count {
                let row = BatchRow { batch: &batch, index: i };
                let key = self.group_key(&row);
                if !state.contains_key(&key) {
                    let mut group_values = Vec::with_capacity(self.group_keys.len());
                    for group_key in &self.group_keys {
                        group_values.push((group_key.clone(), row.value(group_key)?));
                    }
                    state.insert(
                        key.clone(),
                        GroupState {
                            group_values,
                            accumulators: self
                                .measures
                                .iter()
                                .map(|_| NumericAccumulator::default())
                                .collect(),
                        },
                    );
                    group_order.push(key.clone());
                }
                let entry = state.get_mut(&key).expect("inserted above");
                for (idx, measure) in self.measures.iter().enumerate() {
                    // COUNT(*) counts rows without a column lookup.
                    let value = if measure.func == AggregateFunc::Count && measure.column == "*" {
                        Value::Int(1)
                    } else {
                        row.value(&measure.column)?
                    };
                    entry.accumulators[idx].accumulate(&value)?;
                }
            }
        }

        if state.is_empty() {
            return Ok(Batch::default());
        }

        let mut columns: HashMap<String, Column> = HashMap::new();
        let first = &state[&group_order[0]];
        for (name, value) in &first.group_values {
            columns.insert(name.clone(), Column::new(name.clone(), value.data_type()));
        }
        for measure in &self.measures {
            let name = measure.output_name();
            columns.insert(name.clone(), Column::new(name, measure.func.output_type()));
        }

        for key in &group_order {
            let entry = &state[key];
            for (name, value) in &entry.group_values {
                columns
                    .get_mut(name)
                    .expect("group column")
                    .append(value.clone())?;
            }
            for (idx, measure) in self.measures.iter().enumerate() {
                let value = entry.accumulators[idx].finalize(measure.func);
                columns
                    .get_mut(&measure.output_name())
                    .expect("measure column")
                    .append(value)?;
            }
        }

        Ok(Batch {
            columns,
            row_count: state.len(),
            meta: HashMap::new(),
        })
    }
}

impl Executor for AggregateExec {
    fn next(&mut self) -> Result<Option<Batch>> {
        if self.emitted {
            return Ok(None);
        }
        let result = self.compute()?;
        self.emitted = true;
        Ok(Some(result))
    }

    fn close(&mut self) {
        self.child.close();
    }
}

// ============================================================================
// Sort
// ============================================================================

#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
}

/// Buffers the whole child output, sorts it with a stable multi-key
/// comparator and re-emits batches of `batch_size` rows.
pub struct SortExec {
    child: Box<dyn Executor>,
    keys: Vec<SortKey>,
    buffer: Option<Batch>,
    batch_size: usize,
}

impl SortExec {
    pub fn new(child: Box<dyn Executor>, keys: Vec<SortKey>, batch_size: usize) -> SortExec {
        let batch_size = if batch_size == 0 { DEFAULT_SORT_BATCH_SIZE } else { batch_size };
        SortExec { child, keys, buffer: None, batch_size }
    }

    fn load_and_sort(&mut self) -> Result<()> {
        let mut rows: Vec<HashMap<String, Value>> = Vec::new();
        while let Some(batch) = self.child.next()? {
            for i in 0..batch.row_count {
                let row = BatchRow { batch: &batch, index: i };
                let mut record = HashMap::with_capacity(batch.columns.len());
                for name in batch.columns.keys() {
                    record.insert(name.clone(), row.value(name)?);
                }
                rows.push(record);
            }
        }

        let keys = self.keys.clone();
        rows.sort_by(|left, right| {
            for key in &keys {
                let (Some(l), Some(r)) = (left.get(&key.column), right.get(&key.column)) else {
                    continue;
                };
                let ordering = compare_values(l, r).unwrap_or(Ordering::Equal);
                if ordering == Ordering::Equal {
                    continue;
                }
                return if key.ascending { ordering } else { ordering.reverse() };
            }
            Ordering::Equal
        });

        if rows.is_empty() {
            self.buffer = Some(Batch::default());
            return Ok(());
        }
        let mut columns: HashMap<String, Column> = rows[0]
            .iter()
            .map(|(name, value)| (name.clone(), Column::new(name.clone(), value.data_type())))
            .collect();
        for row in &rows {
            for (name, value) in row {
                columns
                    .get_mut(name)
                    .expect("uniform schema")
                    .append(value.clone())?;
            }
        }
        self.buffer = Some(Batch {
            row_count: rows.len(),
            columns,
            meta: HashMap::new(),
        });
        Ok(())
    }
}

impl Executor for SortExec {
    fn next(&mut self) -> Result<Option<Batch>> {
        if self.buffer.is_none() {
            self.load_and_sort()?;
        }
        let buffer = self.buffer.as_mut().expect("loaded above");
        if buffer.row_count == 0 {
            return Ok(None);
        }
        let emit = self.batch_size.min(buffer.row_count);
        let mut result = Batch { row_count: emit, ..Default::default() };
        let mut remaining = HashMap::with_capacity(buffer.columns.len());
        for (name, col) in &buffer.columns {
            result.columns.insert(name.clone(), col.slice(0, emit)?);
            remaining.insert(name.clone(), col.slice(emit, col.len())?);
        }
        buffer.columns = remaining;
        buffer.row_count -= emit;
        Ok(Some(result))
    }

    fn close(&mut self) {
        self.child.close();
    }
}

// ============================================================================
// Limit
// ============================================================================

/// Passes batches through until the accumulated row count reaches the cap;
/// the final batch is trimmed to respect it.
pub struct LimitExec {
    child: Box<dyn Executor>,
    limit: usize,
    emitted: usize,
}

impl LimitExec {
    pub fn new(child: Box<dyn Executor>, limit: usize) -> LimitExec {
        LimitExec { child, limit, emitted: 0 }
    }
}

impl Executor for LimitExec {
    fn next(&mut self) -> Result<Option<Batch>> {
        if self.emitted >= self.limit {
            return Ok(None);
        }
        let Some(batch) = self.child.next()? else {
            return Ok(None);
        };
        let remaining = self.limit - self.emitted;
        if batch.row_count <= remaining {
            self.emitted += batch.row_count;
            return Ok(Some(batch));
        }
        let mut trimmed = Batch {
            row_count: remaining,
            meta: batch.meta.clone(),
            columns: HashMap::with_capacity(batch.columns.len()),
        };
        for (name, col) in &batch.columns {
            trimmed.columns.insert(name.clone(), col.slice(0, remaining)?);
        }
        self.emitted = self.limit;
        Ok(Some(trimmed))
    }

    fn close(&mut self) {
        self.child.close();
    }
}
