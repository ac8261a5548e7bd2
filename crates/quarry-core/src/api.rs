//! Transport-agnostic API surface of the coordinator.
//!
//! [`ApiService`] wires the parser, planner, coordinator, local runner and
//! worker bridges together. The server binary binds these operations over
//! length-prefixed JSON frames; the request/response types and the status
//! mapping live here so every transport agrees on the same semantics.

use crate::catalog::{ColumnSchema, Row, TableSchema};
use crate::distributed::{Coordinator, TaskRequest, TaskResult, WorkerBridge, WorkerClient};
use crate::error::{EngineError, Result};
use crate::planner::Planner;
use crate::runner::{Runner, RunnerRow};
use crate::sql;
use crate::storage::Engine;
use crate::types::{DataType, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(25);
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ============================================================================
// Wire protocol
// ============================================================================

/// Operations accepted by the coordinator, used by the server, the worker
/// and the ingestor binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Query {
        sql: String,
    },
    QueryStatus {
        id: String,
    },
    QueryTree {
        id: String,
        #[serde(default)]
        format: Option<String>,
    },
    DataLoad {
        table: String,
        #[serde(default)]
        schema: Option<SchemaPayload>,
        rows: Vec<serde_json::Map<String, Json>>,
        #[serde(default)]
        partition_id: Option<String>,
    },
    WorkerRegister {
        #[serde(default)]
        id: Option<String>,
    },
    WorkerPoll {
        id: String,
        #[serde(default)]
        secret: Option<String>,
    },
    WorkerResult {
        id: String,
        #[serde(default)]
        secret: Option<String>,
        result: TaskResult,
    },
    WorkerHeartbeat {
        id: String,
        #[serde(default)]
        secret: Option<String>,
    },
    Health,
}

/// Response envelope: an HTTP-style status code, a JSON body and an optional
/// error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub body: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(status: u16, body: Json) -> Response {
        Response { status, body, error: None }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Response {
        Response { status, body: Json::Null, error: Some(message.into()) }
    }

    pub fn is_success(&self) -> bool {
        self.status < 300
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPayload {
    pub columns: Vec<ColumnPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnPayload {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySubmitted {
    pub id: String,
    pub status: String,
    pub plan_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStatusResponse {
    pub id: String,
    pub status: String,
    pub results: Vec<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Map<String, Json>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    pub table: String,
    pub partition_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: String,
    pub secret: String,
    pub poll: String,
    pub result: String,
    pub heartbeat: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub task: Option<TaskRequest>,
}

/// Maps an engine error to the HTTP-style status every transport reports.
pub fn status_code(err: &EngineError) -> u16 {
    match err {
        EngineError::Schema(_)
        | EngineError::Parse(_)
        | EngineError::Plan(_)
        | EngineError::Execution(_) => 400,
        EngineError::TableNotFound(_) | EngineError::PartitionNotFound(_) => 404,
        EngineError::TableExists(_) | EngineError::PartitionExists(_) => 409,
        EngineError::Coordination(msg) => {
            if msg.contains("not found") {
                404
            } else if msg.contains("no workers") {
                503
            } else {
                409
            }
        }
        EngineError::Transport(msg) => {
            if msg.contains("required") {
                401
            } else if msg.contains("invalid") {
                403
            } else {
                500
            }
        }
        EngineError::Io(_) | EngineError::Serialization(_) => 500,
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Reads one length-prefixed JSON frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| EngineError::Transport(format!("frame header: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(EngineError::Transport(format!("frame too large: {len} bytes")));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| EngineError::Transport(format!("frame body: {e}")))?;
    serde_json::from_slice(&buf)
        .map_err(|e| EngineError::Serialization(format!("frame decode: {e}")))
}

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(payload)
        .map_err(|e| EngineError::Serialization(format!("frame encode: {e}")))?;
    writer
        .write_all(&(data.len() as u32).to_be_bytes())
        .await
        .map_err(|e| EngineError::Transport(format!("frame header: {e}")))?;
    writer
        .write_all(&data)
        .await
        .map_err(|e| EngineError::Transport(format!("frame body: {e}")))?;
    Ok(())
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
struct LocalResult {
    rows: Option<Vec<RunnerRow>>,
    error: Option<String>,
}

/// Coordinator-side service behind the wire protocol.
pub struct ApiService {
    engine: Arc<Engine>,
    planner: Planner,
    coordinator: Arc<Coordinator>,
    runner: Runner,
    workers: Mutex<HashMap<String, Arc<WorkerBridge>>>,
    results: RwLock<HashMap<String, LocalResult>>,
    poll_wait: Duration,
}

impl ApiService {
    pub fn new(engine: Arc<Engine>, coordinator: Arc<Coordinator>) -> ApiService {
        ApiService {
            planner: Planner::new(engine.clone()),
            runner: Runner::new(engine.clone()),
            engine,
            coordinator,
            workers: Mutex::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> ApiService {
        self.poll_wait = poll_wait;
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Dispatches one request to the matching operation.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Response {
        match request {
            Request::Query { sql } => match self.submit_query(&sql) {
                Ok(submitted) => Response::ok(202, json!(submitted)),
                Err(e) => Response::error(status_code(&e), e.to_string()),
            },
            Request::QueryStatus { id } => match self.query_status(&id) {
                Ok(status) => Response::ok(200, json!(status)),
                Err(e) => Response::error(status_code(&e), e.to_string()),
            },
            Request::QueryTree { id, format } => {
                match self.query_tree(&id, format.as_deref()) {
                    Ok(tree) => Response::ok(200, json!({ "tree": tree })),
                    Err(e) => Response::error(status_code(&e), e.to_string()),
                }
            }
            Request::DataLoad { table, schema, rows, partition_id } => {
                match self.data_load(&table, schema.as_ref(), &rows, partition_id.as_deref()) {
                    Ok(loaded) => Response::ok(201, json!(loaded)),
                    Err(e) => Response::error(status_code(&e), e.to_string()),
                }
            }
            Request::WorkerRegister { id } => match self.worker_register(id) {
                Ok(registration) => Response::ok(201, json!(registration)),
                Err(e) => Response::error(status_code(&e), e.to_string()),
            },
            Request::WorkerPoll { id, secret } => {
                match self.worker_poll(&id, secret.as_deref()).await {
                    Ok(Some(task)) => Response::ok(200, json!(PollResponse { task: Some(task) })),
                    Ok(None) => Response::ok(204, json!(PollResponse { task: None })),
                    Err(e) => Response::error(status_code(&e), e.to_string()),
                }
            }
            Request::WorkerResult { id, secret, result } => {
                match self.worker_result(&id, secret.as_deref(), result) {
                    Ok(()) => Response::ok(200, json!({ "status": "received" })),
                    Err(e) => Response::error(status_code(&e), e.to_string()),
                }
            }
            Request::WorkerHeartbeat { id, secret } => {
                match self.worker_heartbeat(&id, secret.as_deref()) {
                    Ok(()) => Response::ok(200, json!({ "status": "alive" })),
                    Err(e) => Response::error(status_code(&e), e.to_string()),
                }
            }
            Request::Health => Response::ok(200, json!({ "status": "ok" })),
        }
    }

    /// Parses, plans and submits a query; the local runner populates row
    /// results in the background.
    pub fn submit_query(self: &Arc<Self>, sql_text: &str) -> Result<QuerySubmitted> {
        if sql_text.trim().is_empty() {
            return Err(EngineError::Parse("sql is required".into()));
        }
        let stmt = sql::parse(sql_text)?;
        let plan = self.planner.build(&stmt)?;
        let plan_root = plan.root.node_type.to_string();
        let id = self.coordinator.submit(plan)?;
        debug!(query = %id, "query submitted");

        let service = Arc::clone(self);
        let query_id = id.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = service.runner.execute(&stmt);
            let result = match outcome {
                Ok(rows) => LocalResult { rows: Some(rows), error: None },
                Err(e) => LocalResult { rows: None, error: Some(e.to_string()) },
            };
            service.results.write().insert(query_id, result);
        });

        let status = self.coordinator.query_status(&id)?;
        Ok(QuerySubmitted { id, status: status.to_string(), plan_root })
    }

    pub fn query_status(&self, id: &str) -> Result<QueryStatusResponse> {
        let status = self.coordinator.query_status(id)?;
        let results = self.coordinator.query_results(id)?;
        let mut response = QueryStatusResponse {
            id: id.to_string(),
            status: status.to_string(),
            results,
            rows: None,
            result_error: None,
        };
        if let Some(local) = self.results.read().get(id) {
            match (&local.rows, &local.error) {
                (Some(rows), _) => {
                    response.rows = Some(rows.iter().map(row_to_json).collect());
                }
                (None, Some(error)) => response.result_error = Some(error.clone()),
                _ => {}
            }
        }
        Ok(response)
    }

    /// Serializes the stored plan as JSON or Graphviz DOT.
    pub fn query_tree(&self, id: &str, format: Option<&str>) -> Result<String> {
        let plan = self.coordinator.query_plan(id)?;
        match format {
            None => plan.to_json(),
            Some(f) if f.eq_ignore_ascii_case("json") => plan.to_json(),
            Some(f) if f.eq_ignore_ascii_case("dot") => Ok(plan.to_dot()),
            Some(other) => Err(EngineError::Execution(format!(
                "format must be json or dot, got {other}"
            ))),
        }
    }

    /// Registers the schema when absent, then ingests the rows as one
    /// partition.
    pub fn data_load(
        &self,
        table: &str,
        schema: Option<&SchemaPayload>,
        rows: &[serde_json::Map<String, Json>],
        partition_id: Option<&str>,
    ) -> Result<LoadResponse> {
        if table.trim().is_empty() {
            return Err(EngineError::Schema("table is required".into()));
        }
        if rows.is_empty() {
            return Err(EngineError::Schema("rows must not be empty".into()));
        }
        let schema = self.ensure_table_schema(table, schema)?;
        let typed_rows = build_rows(&schema, rows)?;
        let partition_id = partition_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("part-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()));
        self.engine.ingest(table, &partition_id, &typed_rows)?;
        info!(table, partition = %partition_id, rows = typed_rows.len(), "data loaded");
        Ok(LoadResponse {
            table: table.to_string(),
            partition_id,
            status: "loaded".into(),
        })
    }

    pub fn worker_register(&self, id: Option<String>) -> Result<WorkerRegistration> {
        let id = match id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => format!("worker-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()),
        };
        let bridge = Arc::new(WorkerBridge::new(id.clone()));
        {
            let mut workers = self.workers.lock();
            if workers.contains_key(&id) {
                return Err(EngineError::Coordination(format!(
                    "worker {id} already registered"
                )));
            }
            workers.insert(id.clone(), bridge.clone());
        }
        self.coordinator.register(bridge.clone() as Arc<dyn WorkerClient>);
        info!(worker = %id, "remote worker registered");
        Ok(WorkerRegistration {
            id: id.clone(),
            secret: bridge.secret().to_string(),
            poll: format!("/workers/{id}/poll"),
            result: format!("/workers/{id}/result"),
            heartbeat: format!("/workers/{id}/heartbeat"),
        })
    }

    pub async fn worker_poll(&self, id: &str, secret: Option<&str>) -> Result<Option<TaskRequest>> {
        let bridge = self.authorize_worker(id, secret)?;
        Ok(bridge.wait_task(self.poll_wait).await)
    }

    pub fn worker_result(&self, id: &str, secret: Option<&str>, mut result: TaskResult) -> Result<()> {
        let bridge = self.authorize_worker(id, secret)?;
        result.worker_id = id.to_string();
        bridge.deliver_result(result)
    }

    pub fn worker_heartbeat(&self, id: &str, secret: Option<&str>) -> Result<()> {
        let bridge = self.authorize_worker(id, secret)?;
        bridge.update_heartbeat();
        Ok(())
    }

    fn authorize_worker(&self, id: &str, secret: Option<&str>) -> Result<Arc<WorkerBridge>> {
        let bridge = {
            let workers = self.workers.lock();
            workers
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::Coordination(format!("worker {id} not found")))?
        };
        let Some(secret) = secret.filter(|s| !s.is_empty()) else {
            return Err(EngineError::Transport("worker secret required".into()));
        };
        if !bridge.validate_secret(secret) {
            warn!(worker = id, "rejected worker request with invalid secret");
            return Err(EngineError::Transport("invalid worker secret".into()));
        }
        Ok(bridge)
    }

    fn ensure_table_schema(
        &self,
        table: &str,
        payload: Option<&SchemaPayload>,
    ) -> Result<TableSchema> {
        match self.engine.table(table) {
            Ok(schema) => Ok(schema),
            Err(EngineError::TableNotFound(_)) => {
                let payload = payload.ok_or_else(|| {
                    EngineError::Schema("schema must be provided for new tables".into())
                })?;
                if payload.columns.is_empty() {
                    return Err(EngineError::Schema("columns must not be empty".into()));
                }
                let columns = payload
                    .columns
                    .iter()
                    .map(|col| {
                        Ok(ColumnSchema {
                            name: col.name.to_lowercase(),
                            data_type: parse_column_type(&col.data_type)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let schema = TableSchema {
                    name: table.to_string(),
                    columns,
                    ..Default::default()
                };
                self.engine.register_table(schema.clone())?;
                Ok(schema)
            }
            Err(e) => Err(e),
        }
    }
}

fn parse_column_type(name: &str) -> Result<DataType> {
    match name.to_uppercase().as_str() {
        "INT" | "INT64" => Ok(DataType::Int),
        "STRING" => Ok(DataType::String),
        "FLOAT" | "FLOAT64" => Ok(DataType::Float),
        "BOOL" | "BOOLEAN" => Ok(DataType::Bool),
        other => Err(EngineError::Schema(format!("type {other} is not supported"))),
    }
}

fn build_rows(
    schema: &TableSchema,
    data: &[serde_json::Map<String, Json>],
) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(data.len());
    for item in data {
        let mut row = Row::new();
        for col in &schema.columns {
            let raw = item.get(&col.name).ok_or_else(|| {
                EngineError::Schema(format!("column {} is missing", col.name))
            })?;
            let value = convert_value(col.data_type, raw)
                .map_err(|e| EngineError::Schema(format!("column {}: {e}", col.name)))?;
            row.insert(col.name.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn convert_value(data_type: DataType, raw: &Json) -> Result<Value> {
    match data_type {
        DataType::Int => raw
            .as_i64()
            .or_else(|| raw.as_f64().map(|f| f as i64))
            .map(Value::Int)
            .ok_or_else(|| EngineError::Schema(format!("value {raw} is not an integer"))),
        DataType::Float => raw
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| EngineError::Schema(format!("value {raw} is not a float"))),
        DataType::String => raw
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| EngineError::Schema(format!("value {raw} is not a string"))),
        DataType::Bool => raw
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| EngineError::Schema(format!("value {raw} is not a boolean"))),
    }
}

fn row_to_json(row: &RunnerRow) -> serde_json::Map<String, Json> {
    row.iter()
        .map(|(name, value)| {
            let json = match value {
                Value::Int(v) => json!(v),
                Value::Float(v) => json!(v),
                Value::String(v) => json!(v),
                Value::Bool(v) => json!(v),
            };
            (name.clone(), json)
        })
        .collect()
}
