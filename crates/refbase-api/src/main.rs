// SPDX-License-Identifier: MIT OR Apache-2.0
//! The refbase API server binary.
//!
//! Wires configuration, tracing, the component graph, the task workers, the
//! expiry sweeper and the HTTP listener. Exit codes: 0 success, 1 unhandled
//! error, 2 argument error.

use refbase_api::{build_router, run_sweeper, run_worker, AppState};
use refbase_blob::FsBlobClient;
use refbase_config::RepoConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const EXIT_UNHANDLED: i32 = 1;
const EXIT_USAGE: i32 = 2;

struct Args {
    config_path: Option<PathBuf>,
    blob_root: PathBuf,
    listen: String,
    workers: usize,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config_path: None,
        blob_root: PathBuf::from("./blob-data"),
        listen: "127.0.0.1:8000".to_string(),
        workers: 4,
    };
    let mut raw = std::env::args().skip(1);
    while let Some(flag) = raw.next() {
        let mut value = |name: &str| {
            raw.next()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match flag.as_str() {
            "--config" => args.config_path = Some(PathBuf::from(value("--config")?)),
            "--blob-root" => args.blob_root = PathBuf::from(value("--blob-root")?),
            "--listen" => args.listen = value("--listen")?,
            "--workers" => {
                args.workers = value("--workers")?
                    .parse()
                    .map_err(|_| "--workers must be an integer".to_string())?;
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(args)
}

fn load_config(path: Option<&PathBuf>) -> Result<RepoConfig, String> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("reading {}: {e}", path.display()))?;
            RepoConfig::from_toml_str(&raw).map_err(|e| e.to_string())
        }
        None => Ok(RepoConfig::default()),
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config_path.as_ref())?;
    let blob = Arc::new(FsBlobClient::new(&args.blob_root));
    let state = AppState::build(config, blob);

    state.index_manager.ensure_initialized().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut joins = Vec::new();
    for _ in 0..args.workers.max(1) {
        joins.push(tokio::spawn(run_worker(
            Arc::clone(&state),
            shutdown_rx.clone(),
        )));
    }
    joins.push(tokio::spawn(run_sweeper(
        Arc::clone(&state),
        shutdown_rx.clone(),
    )));

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(
        target: "refbase.api.main",
        listen = %args.listen,
        workers = args.workers,
        "refbase api listening"
    );
    axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!(target: "refbase.api.main", "shutting down");
    let _ = shutdown_tx.send(true);
    for join in joins {
        let _ = join.await;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            error!(target: "refbase.api.main", %message, "argument error");
            std::process::exit(EXIT_USAGE);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(target: "refbase.api.main", error = %err, "failed to start runtime");
            std::process::exit(EXIT_UNHANDLED);
        }
    };
    if let Err(err) = runtime.block_on(run(args)) {
        error!(target: "refbase.api.main", error = %err, "unhandled error");
        std::process::exit(EXIT_UNHANDLED);
    }
}
