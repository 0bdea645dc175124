mod handlers;
mod monitor;
mod state;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::{AppState, MasterConfig};

#[derive(Parser, Debug)]
#[command(name = "master")]
#[command(about = "Job master: registro de workers, heartbeats y barreras")]
struct Args {
    /// Dirección donde escucha la API HTTP
    #[arg(long, env = "MASTER_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Cantidad de workers del job
    #[arg(long, env = "MASTER_WORKERS", default_value_t = 1)]
    workers: u32,

    #[arg(long, env = "MASTER_HEARTBEAT_TIMEOUT_SECS", default_value_t = 20)]
    heartbeat_timeout_secs: u64,

    #[arg(long, env = "MASTER_BARRIER_TIMEOUT_SECS", default_value_t = 60)]
    barrier_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let state = AppState::new(MasterConfig {
        expected_workers: args.workers,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        barrier_timeout: Duration::from_secs(args.barrier_timeout_secs),
    });

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_workers(monitor_state).await;
    });

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("no se pudo abrir {}", args.bind))?;
    info!(
        "master escuchando en {} (esperando {} workers)",
        listener.local_addr()?,
        args.workers
    );

    axum::serve(listener, app).await.context("servidor HTTP")?;
    Ok(())
}
