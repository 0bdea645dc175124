// master/src/state.rs

use common::{Resource, WorkerId, WorkerState};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Workers que tienen que registrarse antes de arrancar el job.
    pub expected_workers: u32,
    pub heartbeat_timeout: Duration,
    pub barrier_timeout: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub workers: Arc<Mutex<BTreeMap<WorkerId, WorkerMeta>>>,
    // próximo id a entregar, en orden de registro
    pub next_worker_id: Arc<Mutex<WorkerId>>,
    pub barriers: Arc<Mutex<HashMap<String, Barrier>>>,
}

impl AppState {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            config: Arc::new(config),
            workers: Arc::new(Mutex::new(BTreeMap::new())),
            next_worker_id: Arc::new(Mutex::new(0)),
            barriers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub host: String,
    pub port: u16,
    pub resource: Resource,
    pub state: WorkerState,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
}

/// Barrera con nombre. Una vez liberada queda liberada: el tag no se reutiliza.
pub struct Barrier {
    pub arrived: BTreeSet<WorkerId>,
    pub released: watch::Sender<bool>,
}

impl Barrier {
    pub fn new() -> Self {
        let (released, _) = watch::channel(false);
        Self {
            arrived: BTreeSet::new(),
            released,
        }
    }
}
