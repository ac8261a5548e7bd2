//! Quarry remote worker.
//!
//! Registers with the coordinator, long-polls for scan fragments, executes
//! them against its local storage engine and delivers the results. Failed
//! polls back off and reconnect.

use anyhow::{anyhow, Context};
use clap::Parser;
use quarry_core::api::{read_frame, write_frame, Request, Response, WorkerRegistration};
use quarry_core::{execute_fragment, Engine, TaskRequest, TaskResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "quarry-worker")]
#[command(about = "Quarry worker: polls the coordinator and executes scan fragments")]
struct Args {
    /// Worker id; generated by the coordinator when empty
    #[arg(long)]
    id: Option<String>,

    /// Directory with locally ingested partitions
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Coordinator address
    #[arg(long, default_value = "127.0.0.1:7421")]
    coordinator: String,

    /// Wait between polls when no task is available
    #[arg(long, default_value_t = 3)]
    idle_wait_secs: u64,
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
    let engine = Arc::new(Engine::open(&args.data_dir).context("opening storage")?);
    let idle_wait = Duration::from_secs(args.idle_wait_secs.max(1));

    let registration = register(&args.coordinator, args.id.clone())
        .await
        .context("registering worker")?;
    info!(worker = %registration.id, coordinator = %args.coordinator, "worker registered");

    loop {
        let task = match poll_task(&args.coordinator, &registration).await {
            Ok(task) => task,
            Err(e) => {
                warn!("poll failed: {e}");
                tokio::time::sleep(idle_wait).await;
                continue;
            }
        };
        let Some(task) = task else {
            continue;
        };
        info!(task = %task.task_id, "executing fragment");
        let result = execute_fragment(&engine, &task.fragment, &registration.id, &task.task_id);
        if let Err(e) = send_result(&args.coordinator, &registration, result).await {
            warn!("sending result failed: {e}");
        }
    }
}

async fn call(addr: &str, request: &Request) -> anyhow::Result<Response> {
    let mut socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting {addr}"))?;
    write_frame(&mut socket, request).await?;
    let response: Response = read_frame(&mut socket).await?;
    Ok(response)
}

async fn register(addr: &str, id: Option<String>) -> anyhow::Result<WorkerRegistration> {
    let response = call(addr, &Request::WorkerRegister { id }).await?;
    if !response.is_success() {
        return Err(anyhow!(
            "registration rejected ({}): {}",
            response.status,
            response.error.unwrap_or_default()
        ));
    }
    Ok(serde_json::from_value(response.body)?)
}

async fn poll_task(
    addr: &str,
    registration: &WorkerRegistration,
) -> anyhow::Result<Option<TaskRequest>> {
    let response = call(
        addr,
        &Request::WorkerPoll {
            id: registration.id.clone(),
            secret: Some(registration.secret.clone()),
        },
    )
    .await?;
    if response.status == 204 {
        return Ok(None);
    }
    if !response.is_success() {
        return Err(anyhow!(
            "poll rejected ({}): {}",
            response.status,
            response.error.unwrap_or_default()
        ));
    }
    let task = response.body.get("task").cloned().unwrap_or_default();
    if task.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(task)?))
}

async fn send_result(
    addr: &str,
    registration: &WorkerRegistration,
    result: TaskResult,
) -> anyhow::Result<()> {
    let response = call(
        addr,
        &Request::WorkerResult {
            id: registration.id.clone(),
            secret: Some(registration.secret.clone()),
            result,
        },
    )
    .await?;
    if !response.is_success() {
        return Err(anyhow!(
            "result rejected ({}): {}",
            response.status,
            response.error.unwrap_or_default()
        ));
    }
    Ok(())
}
