use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    BarrierRequest, BarrierResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse, StateRequest, StateResponse, WorkerId, WorkerInfo, WorkerListResponse,
    WorkerState,
};
use serde::Deserialize;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::{AppState, Barrier, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/workers/state", post(worker_state))
        .route("/api/v1/barrier", post(barrier))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn poisoned<T>(_: T) -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Registra un worker y le da el siguiente id numérico
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, StatusCode> {
    let mut workers = state.workers.lock().map_err(poisoned)?;
    let mut next_id = state.next_worker_id.lock().map_err(poisoned)?;

    if workers.len() as u32 >= state.config.expected_workers {
        warn!(
            "registro rechazado para {}:{}: ya hay {} workers",
            req.host,
            req.port,
            workers.len()
        );
        return Ok(Json(RegisterResponse {
            worker_id: None,
            accepted: false,
        }));
    }

    let worker_id: WorkerId = *next_id;
    *next_id += 1;

    workers.insert(
        worker_id,
        WorkerMeta {
            host: req.host.clone(),
            port: req.port,
            resource: req.resource,
            state: WorkerState::Starting,
            registered_at: Utc::now(),
            last_heartbeat: SystemTime::now(),
            dead: false,
        },
    );

    info!(
        "worker registrado: {} ({}:{}) [{}/{}]",
        worker_id,
        req.host,
        req.port,
        workers.len(),
        state.config.expected_workers
    );
    Ok(Json(RegisterResponse {
        worker_id: Some(worker_id),
        accepted: true,
    }))
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, StatusCode> {
    let mut workers = state.workers.lock().map_err(poisoned)?;
    if let Some(meta) = workers.get_mut(&req.worker_id) {
        meta.last_heartbeat = SystemTime::now();
        if meta.dead {
            info!("worker {} vuelve a dar señales", req.worker_id);
            meta.dead = false;
        }
        Ok(Json(HeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Cambio de estado reportado por el worker
async fn worker_state(
    State(state): State<AppState>,
    Json(req): Json<StateRequest>,
) -> Result<Json<StateResponse>, StatusCode> {
    let mut workers = state.workers.lock().map_err(poisoned)?;
    let Some(meta) = workers.get_mut(&req.worker_id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    if meta.state != req.state {
        info!(
            "worker {}: {:?} -> {:?}",
            req.worker_id, meta.state, req.state
        );
    }
    meta.state = req.state;
    meta.last_heartbeat = SystemTime::now();
    Ok(Json(StateResponse { ok: true }))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    wait_all: bool,
}

// Lista de workers ordenada por id; con wait_all responde 503 hasta que estén todos
async fn list_workers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<WorkerListResponse>, StatusCode> {
    let now = SystemTime::now();
    let workers = state.workers.lock().map_err(poisoned)?;
    let expected = state.config.expected_workers;

    if params.wait_all && (workers.len() as u32) < expected {
        debug!("lista pedida con {}/{} workers", workers.len(), expected);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let out = workers
        .iter()
        .map(|(id, meta)| WorkerInfo {
            id: *id,
            host: meta.host.clone(),
            port: meta.port,
            resource: meta.resource,
            state: meta.state,
            registered_at: meta.registered_at,
            dead: meta.dead,
            last_heartbeat_secs_ago: now
                .duration_since(meta.last_heartbeat)
                .unwrap_or_default()
                .as_secs(),
        })
        .collect();

    Ok(Json(WorkerListResponse {
        workers: out,
        expected,
    }))
}

// Bloquea hasta que todos los workers esperados llegan al mismo tag
async fn barrier(
    State(state): State<AppState>,
    Json(req): Json<BarrierRequest>,
) -> Result<Json<BarrierResponse>, StatusCode> {
    {
        let workers = state.workers.lock().map_err(poisoned)?;
        if !workers.contains_key(&req.worker_id) {
            return Err(StatusCode::NOT_FOUND);
        }
    }

    let mut released = {
        let mut barriers = state.barriers.lock().map_err(poisoned)?;
        let barrier = barriers
            .entry(req.tag.clone())
            .or_insert_with(Barrier::new);
        barrier.arrived.insert(req.worker_id);
        debug!(
            "barrera '{}': llegó worker {} ({}/{})",
            req.tag,
            req.worker_id,
            barrier.arrived.len(),
            state.config.expected_workers
        );
        if barrier.arrived.len() as u32 >= state.config.expected_workers
            && !*barrier.released.borrow()
        {
            info!("barrera '{}' liberada", req.tag);
            barrier.released.send_replace(true);
        }
        barrier.released.subscribe()
    };

    let outcome = tokio::time::timeout(state.config.barrier_timeout, released.wait_for(|r| *r))
        .await
        .map(|r| r.is_ok());

    match outcome {
        Ok(true) => Ok(Json(BarrierResponse {
            tag: req.tag,
            released: true,
        })),
        Ok(false) => Err(StatusCode::INTERNAL_SERVER_ERROR),
        Err(_) => {
            warn!(
                "worker {} agotó la espera en la barrera '{}'",
                req.worker_id, req.tag
            );
            Err(StatusCode::REQUEST_TIMEOUT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MasterConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(expected: u32) -> AppState {
        AppState::new(MasterConfig {
            expected_workers: expected,
            heartbeat_timeout: Duration::from_secs(20),
            barrier_timeout: Duration::from_millis(200),
        })
    }

    async fn post(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn get_uri(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn register(app: &Router, port: u16) -> RegisterResponse {
        let (status, body) = post(
            app,
            "/api/v1/workers/register",
            serde_json::json!({ "host": "node", "port": port }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn ids_secuenciales_y_rechazo_al_llenarse() {
        let app = build_router(state(2));
        assert_eq!(register(&app, 1).await.worker_id, Some(0));
        assert_eq!(register(&app, 2).await.worker_id, Some(1));
        let third = register(&app, 3).await;
        assert!(!third.accepted);
        assert_eq!(third.worker_id, None);
    }

    #[tokio::test]
    async fn lista_espera_a_todos() {
        let app = build_router(state(2));
        register(&app, 1).await;
        let (status, _) = get_uri(&app, "/api/v1/workers?wait_all=true").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // sin wait_all responde con lo que hay
        let (status, _) = get_uri(&app, "/api/v1/workers").await;
        assert_eq!(status, StatusCode::OK);

        register(&app, 2).await;
        let (status, body) = get_uri(&app, "/api/v1/workers?wait_all=true").await;
        assert_eq!(status, StatusCode::OK);
        let list: WorkerListResponse = serde_json::from_slice(&body).unwrap();
        let ids: Vec<WorkerId> = list.workers.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(list.expected, 2);
    }

    #[tokio::test]
    async fn estado_y_heartbeat() {
        let app = build_router(state(1));
        register(&app, 1).await;

        let (status, _) = post(
            &app,
            "/api/v1/workers/state",
            serde_json::json!({ "worker_id": 0, "state": "RUNNING" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post(
            &app,
            "/api/v1/workers/heartbeat",
            serde_json::json!({ "worker_id": 9 }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get_uri(&app, "/api/v1/workers").await;
        let list: WorkerListResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.workers[0].state, WorkerState::Running);
    }

    #[tokio::test]
    async fn barrera_libera_cuando_llegan_todos() {
        let app = build_router(state(2));
        register(&app, 1).await;
        register(&app, 2).await;

        let a = {
            let app = app.clone();
            tokio::spawn(async move {
                post(
                    &app,
                    "/api/v1/barrier",
                    serde_json::json!({ "worker_id": 0, "tag": "start" }),
                )
                .await
            })
        };
        let (status_b, _) = post(
            &app,
            "/api/v1/barrier",
            serde_json::json!({ "worker_id": 1, "tag": "start" }),
        )
        .await;
        let (status_a, body_a) = a.await.unwrap();

        assert_eq!(status_a, StatusCode::OK);
        assert_eq!(status_b, StatusCode::OK);
        let resp: BarrierResponse = serde_json::from_slice(&body_a).unwrap();
        assert!(resp.released);
        assert_eq!(resp.tag, "start");
    }

    #[tokio::test]
    async fn barrera_incompleta_da_timeout() {
        let app = build_router(state(2));
        register(&app, 1).await;
        let (status, _) = post(
            &app,
            "/api/v1/barrier",
            serde_json::json!({ "worker_id": 0, "tag": "end" }),
        )
        .await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let app = build_router(state(1));
        let (status, body) = get_uri(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }
}
