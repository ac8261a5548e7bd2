//! Quarry coordinator server.
//!
//! Exposes the core API over length-prefixed JSON frames on TCP: query
//! submission and status, plan trees, data load, and the worker long-poll
//! endpoints. Optionally registers embedded in-process workers so a single
//! node can serve queries without remote workers.

use anyhow::Context;
use clap::Parser;
use quarry_core::api::{read_frame, write_frame, ApiService, Request, Response};
use quarry_core::{execute_fragment, Coordinator, Engine, LocalWorker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "quarry-server")]
#[command(about = "Quarry coordinator: SQL API, data load and worker endpoints")]
struct Args {
    /// Directory for the local storage engine
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1:7421")]
    bind_addr: String,

    /// Number of embedded in-process workers registered at startup
    #[arg(long, default_value_t = 0)]
    embedded_workers: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::open(&args.data_dir).context("opening storage")?);
    let coordinator = Arc::new(Coordinator::new());

    for n in 0..args.embedded_workers {
        let id = format!("embedded-{}", n + 1);
        let worker_engine = engine.clone();
        let worker_id = id.clone();
        coordinator.register(Arc::new(LocalWorker::new(id, move |task| {
            execute_fragment(&worker_engine, &task.fragment, &worker_id, &task.task_id)
        })));
    }

    let service = Arc::new(ApiService::new(engine, coordinator));
    let listener = TcpListener::bind(&args.bind_addr)
        .await
        .with_context(|| format!("binding {}", args.bind_addr))?;
    info!(
        addr = %args.bind_addr,
        embedded_workers = args.embedded_workers,
        "coordinator listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, service).await {
                        warn!(%peer, "connection ended: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down coordinator");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut socket: TcpStream, service: Arc<ApiService>) -> anyhow::Result<()> {
    loop {
        let request: Request = match read_frame(&mut socket).await {
            Ok(request) => request,
            // Clean disconnect or a malformed frame; either way the
            // connection is done.
            Err(quarry_core::EngineError::Transport(_)) => return Ok(()),
            Err(e) => {
                let response = Response::error(400, e.to_string());
                let _ = write_frame(&mut socket, &response).await;
                return Ok(());
            }
        };
        let response = service.handle(request).await;
        if let Err(e) = write_frame(&mut socket, &response).await {
            error!("writing response failed: {e}");
            return Ok(());
        }
    }
}
