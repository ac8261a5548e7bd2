//! Quarry data loader.
//!
//! Reads a JSON file of rows (optionally with an inline schema) and pushes
//! it into a running coordinator as one partition.
//!
//! File format:
//! ```json
//! {
//!   "schema": {"columns": [{"name": "user_id", "type": "INT"}]},
//!   "rows": [{"user_id": 42}]
//! }
//! ```

use anyhow::{anyhow, Context};
use clap::Parser;
use quarry_core::api::{read_frame, write_frame, Request, Response, SchemaPayload};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "quarry-ingestor")]
#[command(about = "Load JSON row files into a quarry coordinator")]
struct Args {
    /// Coordinator address
    #[arg(long, default_value = "127.0.0.1:7421")]
    coordinator: String,

    /// Target table
    #[arg(long)]
    table: String,

    /// Partition id; generated by the coordinator when empty
    #[arg(long)]
    partition_id: Option<String>,

    /// JSON file holding the rows to load
    file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LoadFile {
    #[serde(default)]
    schema: Option<SchemaPayload>,
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let data = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let load: LoadFile = serde_json::from_str(&data).context("parsing load file")?;
    if load.rows.is_empty() {
        return Err(anyhow!("load file has no rows"));
    }

    let row_count = load.rows.len();
    let request = Request::DataLoad {
        table: args.table.clone(),
        schema: load.schema,
        rows: load.rows,
        partition_id: args.partition_id.clone(),
    };

    let mut socket = TcpStream::connect(&args.coordinator)
        .await
        .with_context(|| format!("connecting {}", args.coordinator))?;
    write_frame(&mut socket, &request).await?;
    let response: Response = read_frame(&mut socket).await?;
    if !response.is_success() {
        return Err(anyhow!(
            "load rejected ({}): {}",
            response.status,
            response.error.unwrap_or_default()
        ));
    }
    info!(
        table = %args.table,
        rows = row_count,
        partition = %response.body["partition_id"].as_str().unwrap_or(""),
        "load complete"
    );
    Ok(())
}
