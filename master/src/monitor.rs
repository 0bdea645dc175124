use crate::state::AppState;
use common::WorkerId;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub async fn monitor_workers(state: AppState) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        match sweep_once(&state, SystemTime::now()) {
            Ok(dead) if !dead.is_empty() => {
                warn!("workers sin heartbeat: {:?}", dead);
            }
            Ok(_) => {}
            Err(e) => warn!("error en sweep de workers: {}", e),
        }
    }
}

/// Marca como muertos los workers sin heartbeat desde hace más de `heartbeat_timeout`.
/// Devuelve los que cambiaron en esta pasada.
pub fn sweep_once(state: &AppState, now: SystemTime) -> Result<Vec<WorkerId>, String> {
    let timeout = state.config.heartbeat_timeout;
    let mut workers = state.workers.lock().map_err(|_| "lock workers")?;
    let mut newly_dead = Vec::new();

    for (id, meta) in workers.iter_mut() {
        if meta.dead {
            continue;
        }
        if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
            if elapsed > timeout {
                meta.dead = true;
                info!("marcando worker {} como muerto", id);
                newly_dead.push(*id);
            }
        }
    }

    Ok(newly_dead)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MasterConfig, WorkerMeta};
    use common::{Resource, WorkerState};

    fn meta(last_heartbeat: SystemTime) -> WorkerMeta {
        WorkerMeta {
            host: "node".to_string(),
            port: 0,
            resource: Resource::ZERO,
            state: WorkerState::Running,
            registered_at: chrono::Utc::now(),
            last_heartbeat,
            dead: false,
        }
    }

    #[test]
    fn marca_muerto_una_sola_vez() {
        let state = AppState::new(MasterConfig {
            expected_workers: 2,
            heartbeat_timeout: Duration::from_secs(20),
            barrier_timeout: Duration::from_secs(1),
        });
        let now = SystemTime::now();
        {
            let mut workers = state.workers.lock().unwrap();
            workers.insert(0, meta(now - Duration::from_secs(60)));
            workers.insert(1, meta(now));
        }

        assert_eq!(sweep_once(&state, now).unwrap(), vec![0]);
        assert!(sweep_once(&state, now).unwrap().is_empty());
        assert!(state.workers.lock().unwrap()[&0].dead);
        assert!(!state.workers.lock().unwrap()[&1].dead);
    }
}
