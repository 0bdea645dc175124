use anyhow::{Context, Result};
use common::{RegisterRequest, Resource, WorkerPlan, WorkerState};
use comms::CommsConfig;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};
use tracing::{info, warn};

use crate::jm_client::{ClientConfig, JmClient};
use crate::job::{self, JobConfig};

pub struct WorkerConfig {
    pub host: Option<String>,
    pub port: u16,
    pub client: ClientConfig,
    pub job: JobConfig,
    /// 0: un contenedor por worker descubierto, con los recursos que declaró.
    pub containers: u32,
}

/// Recursos de la máquina: RAM y disco en MB, CPU en cores.
fn local_resource() -> Resource {
    let mut sys = System::new_all();
    sys.refresh_cpu();
    sys.refresh_disks_list();

    let cores = sys.cpus().len() as f64;
    let ram_mb = (sys.total_memory() / (1024 * 1024)) as f64;
    let disk_mb = sys
        .disks()
        .iter()
        .map(|d| d.available_space())
        .sum::<u64>()
        / (1024 * 1024);

    info!(
        "recursos locales: {} cores ({:.1}% en uso), {} MB RAM, {} MB disco",
        cores,
        sys.global_cpu_info().cpu_usage(),
        ram_mb,
        disk_mb
    );
    Resource::new(ram_mb, cores, disk_mb as f64)
}

/// Ciclo completo del worker:
/// - se conecta y se registra en el master
/// - espera a que estén todos y pasa la barrera de arranque
/// - corre el job colectivo fuera del runtime async
/// - reporta COMPLETED o FAILED
pub async fn run(cfg: WorkerConfig) -> Result<()> {
    let host = match cfg.host {
        Some(h) => h,
        None => hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string(),
    };

    let resource = tokio::task::spawn_blocking(local_resource)
        .await
        .context("lectura de recursos")?;

    let mut client = JmClient::new(cfg.client)?;
    client.connect().await?;
    let worker_id = client
        .register(&RegisterRequest {
            host: host.clone(),
            port: cfg.port,
            resource,
        })
        .await?;

    let pinger = client.start_pinger()?;

    let workers = client.list_workers().await?;
    info!(
        "worker {} ({}): {} workers en el job",
        worker_id,
        host,
        workers.len()
    );

    client.barrier("start").await?;
    client.report_state(WorkerState::Running).await?;

    let job_cfg = cfg.job;
    let worker_plan = if cfg.containers == 0 {
        WorkerPlan::from_workers(&workers)
    } else {
        WorkerPlan::uniform(cfg.containers)
    };
    let comms_config = CommsConfig::from_env();

    let outcome = tokio::task::spawn_blocking(move || {
        job::run_job(&job_cfg, &worker_plan, &comms_config)
    })
    .await
    .context("hilo del job")?;

    let result = match outcome {
        Ok(report) => {
            info!(
                "worker {}: {:?} listo en {:?} ({} contenedores)",
                worker_id, report.operation, report.elapsed, report.containers
            );
            for (task, delivery) in &report.last {
                info!("  task {} -> {:?}", task, delivery);
            }
            client.report_state(WorkerState::Completed).await?;
            if let Err(e) = client.barrier("end").await {
                warn!("barrera de cierre: {}", e);
            }
            Ok(())
        }
        Err(e) => {
            warn!("worker {}: job falló: {:#}", worker_id, e);
            if let Err(report_err) = client.report_state(WorkerState::Failed).await {
                warn!("no se pudo reportar FAILED: {}", report_err);
            }
            Err(e)
        }
    };

    pinger.abort();
    client.close();
    result
}
