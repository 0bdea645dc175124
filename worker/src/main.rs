mod jm_client;
mod job;
mod worker;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use comms::{Mode, OperationKind};
use tracing_subscriber::EnvFilter;

use crate::jm_client::ClientConfig;
use crate::job::JobConfig;
use crate::worker::WorkerConfig;

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Worker: se registra en el master y corre un job colectivo")]
struct Args {
    /// - En Docker: MASTER_URL=http://master:8080
    #[arg(long, env = "MASTER_URL", default_value = "http://localhost:8080")]
    master_url: String,

    /// Host que se anuncia al master (por defecto el hostname)
    #[arg(long, env = "WORKER_HOST")]
    host: Option<String>,

    #[arg(long, env = "WORKER_PORT", default_value_t = 0)]
    port: u16,

    #[arg(long, env = "WORKER_CONNECT_TIME_LIMIT_SECS", default_value_t = 100)]
    connect_time_limit_secs: u64,

    #[arg(long, env = "WORKER_RESPONSE_WAIT_SECS", default_value_t = 10)]
    response_wait_secs: u64,

    #[arg(long, env = "WORKER_PING_INTERVAL_SECS", default_value_t = 5)]
    ping_interval_secs: u64,

    /// broadcast, reduce, gather, partition, keyed_reduce, allreduce, allgather
    #[arg(long, env = "JOB_OPERATION", default_value = "reduce")]
    operation: OperationKind,

    #[arg(long, env = "JOB_SOURCES", default_value_t = 4)]
    sources: u32,

    #[arg(long, env = "JOB_SINKS", default_value_t = 1)]
    sinks: u32,

    /// Contenedores lógicos; 0 = uno por worker registrado, con sus recursos
    #[arg(long, env = "JOB_CONTAINERS", default_value_t = 0)]
    containers: u32,

    #[arg(long, env = "JOB_ITERATIONS", default_value_t = 10)]
    iterations: u32,

    /// streaming o batch
    #[arg(long, env = "JOB_MODE", default_value = "streaming")]
    mode: Mode,

    #[arg(long, env = "JOB_DEADLINE_SECS", default_value_t = 60)]
    deadline_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,comms=info,reqwest=info")),
        )
        .init();

    let args = Args::parse();

    let cfg = WorkerConfig {
        host: args.host,
        port: args.port,
        client: ClientConfig {
            master_url: args.master_url,
            connect_time_limit: Duration::from_secs(args.connect_time_limit_secs),
            response_wait: Duration::from_secs(args.response_wait_secs),
            ping_interval: Duration::from_secs(args.ping_interval_secs),
        },
        job: JobConfig {
            operation: args.operation,
            sources: args.sources,
            sinks: args.sinks,
            iterations: args.iterations,
            mode: args.mode,
            deadline: Duration::from_secs(args.deadline_secs),
        },
        containers: args.containers,
    };

    worker::run(cfg).await
}
