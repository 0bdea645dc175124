//! Mensajes JSON entre worker y job master.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::Resource;
use crate::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Starting,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub resource: Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// `None` cuando el master ya tiene todos los workers esperados.
    pub worker_id: Option<WorkerId>,
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub worker_id: WorkerId,
    pub state: WorkerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub host: String,
    pub port: u16,
    pub resource: Resource,
    pub state: WorkerState,
    pub registered_at: DateTime<Utc>,
    pub dead: bool,
    pub last_heartbeat_secs_ago: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerListResponse {
    /// Ordenados por id.
    pub workers: Vec<WorkerInfo>,
    pub expected: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierRequest {
    pub worker_id: WorkerId,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierResponse {
    pub tag: String,
    pub released: bool,
}
