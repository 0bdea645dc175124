//! Cliente del job master.
//!
//! Máquina de estados `Disconnected -> Connecting -> Connected -> Registered`,
//! con `Failed` como estado terminal. Toda llamada HTTP está acotada por
//! `response_wait`; la conexión inicial reintenta hasta `connect_time_limit`.

use std::time::{Duration, Instant};

use common::{
    BarrierRequest, BarrierResponse, HeartbeatRequest, RegisterRequest, RegisterResponse,
    StateRequest, WorkerId, WorkerInfo, WorkerListResponse, WorkerState,
};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const HEALTH_POLL: Duration = Duration::from_millis(50);
const CONNECT_LOG_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Registered(WorkerId),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInput {
    ConnectAttempt,
    ConnectRefused,
    ConnectSucceeded,
    Registered(WorkerId),
    RegistrationRejected,
    TimeLimitExceeded,
    Close,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no se pudo conectar al master en {url} tras {secs} s")]
    ConnectionRefused { url: String, secs: u64 },

    #[error("{what}: sin respuesta del master tras {secs} s")]
    Timeout { what: String, secs: u64 },

    #[error("el master rechazó el registro")]
    RegistrationRejected,

    #[error("error HTTP en {what}: {message}")]
    Http { what: String, message: String },

    #[error("{input:?} no es válido en {state:?}")]
    InvalidState {
        state: ClientState,
        input: ClientInput,
    },
}

/// Tabla de transiciones. `Close` vale desde cualquier estado.
pub fn transition(state: ClientState, input: ClientInput) -> Result<ClientState, ClientError> {
    use ClientInput as I;
    use ClientState as S;

    let next = match (state, input) {
        (_, I::Close) => S::Disconnected,
        (S::Disconnected, I::ConnectAttempt) => S::Connecting,
        (S::Connecting, I::ConnectRefused) => S::Connecting,
        (S::Connecting, I::ConnectSucceeded) => S::Connected,
        (S::Connecting, I::TimeLimitExceeded) => S::Failed,
        (S::Connected, I::Registered(id)) => S::Registered(id),
        (S::Connected, I::RegistrationRejected) => S::Failed,
        (state, input) => return Err(ClientError::InvalidState { state, input }),
    };
    Ok(next)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub master_url: String,
    pub connect_time_limit: Duration,
    pub response_wait: Duration,
    pub ping_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_url: "http://localhost:8080".to_string(),
            connect_time_limit: Duration::from_secs(100),
            response_wait: Duration::from_secs(10),
            ping_interval: Duration::from_secs(5),
        }
    }
}

pub struct JmClient {
    http: Client,
    config: ClientConfig,
    state: ClientState,
}

impl JmClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(config.response_wait)
            .build()
            .map_err(|e| ClientError::Http {
                what: "cliente".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            config,
            state: ClientState::Disconnected,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        match self.state {
            ClientState::Registered(id) => Some(id),
            _ => None,
        }
    }

    fn apply(&mut self, input: ClientInput) -> Result<(), ClientError> {
        let next = transition(self.state, input)?;
        if next != self.state {
            debug!("cliente JM: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.master_url.trim_end_matches('/'), path)
    }

    fn http_error(&self, what: &str, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout {
                what: what.to_string(),
                secs: self.config.response_wait.as_secs(),
            }
        } else {
            ClientError::Http {
                what: what.to_string(),
                message: e.to_string(),
            }
        }
    }

    fn registered_id(&self, input: ClientInput) -> Result<WorkerId, ClientError> {
        self.worker_id().ok_or(ClientError::InvalidState {
            state: self.state,
            input,
        })
    }

    /// Espera a que `/health` responda. Pasado `connect_time_limit` el cliente queda en `Failed`.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.apply(ClientInput::ConnectAttempt)?;
        let health = self.url("/health");
        let started = Instant::now();
        let mut last_log = started;

        loop {
            match self.http.get(&health).send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.apply(ClientInput::ConnectSucceeded)?;
                    info!("conectado al master en {}", self.config.master_url);
                    return Ok(());
                }
                Ok(resp) => debug!("health respondió {}", resp.status()),
                Err(e) => debug!("health falló: {}", e),
            }
            self.apply(ClientInput::ConnectRefused)?;

            if started.elapsed() >= self.config.connect_time_limit {
                self.apply(ClientInput::TimeLimitExceeded)?;
                return Err(ClientError::ConnectionRefused {
                    url: self.config.master_url.clone(),
                    secs: self.config.connect_time_limit.as_secs(),
                });
            }
            if last_log.elapsed() >= CONNECT_LOG_EVERY {
                info!(
                    "esperando al master en {} ({} s)",
                    self.config.master_url,
                    started.elapsed().as_secs()
                );
                last_log = Instant::now();
            }
            tokio::time::sleep(HEALTH_POLL).await;
        }
    }

    pub async fn register(&mut self, req: &RegisterRequest) -> Result<WorkerId, ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::InvalidState {
                state: self.state,
                input: ClientInput::Registered(0),
            });
        }
        let resp = self
            .http
            .post(self.url("/api/v1/workers/register"))
            .json(req)
            .send()
            .await
            .map_err(|e| self.http_error("registro", e))?;
        let body: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| self.http_error("registro", e))?;

        match body.worker_id {
            Some(id) if body.accepted => {
                self.apply(ClientInput::Registered(id))?;
                info!("registrado en el master con id {}", id);
                Ok(id)
            }
            _ => {
                self.apply(ClientInput::RegistrationRejected)?;
                Err(ClientError::RegistrationRejected)
            }
        }
    }

    /// Lista completa de workers. Reintenta mientras el master responda 503.
    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>, ClientError> {
        self.registered_id(ClientInput::ConnectSucceeded)?;
        let url = self.url("/api/v1/workers?wait_all=true");
        let started = Instant::now();

        loop {
            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| self.http_error("lista de workers", e))?;

            match resp.status() {
                StatusCode::SERVICE_UNAVAILABLE => {
                    if started.elapsed() >= self.config.connect_time_limit {
                        return Err(ClientError::Timeout {
                            what: "lista de workers".to_string(),
                            secs: self.config.connect_time_limit.as_secs(),
                        });
                    }
                    tokio::time::sleep(HEALTH_POLL).await;
                }
                status if status.is_success() => {
                    let list: WorkerListResponse = resp
                        .json()
                        .await
                        .map_err(|e| self.http_error("lista de workers", e))?;
                    return Ok(list.workers);
                }
                status => {
                    return Err(ClientError::Http {
                        what: "lista de workers".to_string(),
                        message: status.to_string(),
                    })
                }
            }
        }
    }

    /// Espera en la barrera `tag`; el master contesta 408 si no llegan todos.
    pub async fn barrier(&self, tag: &str) -> Result<(), ClientError> {
        let worker_id = self.registered_id(ClientInput::ConnectSucceeded)?;
        let what = format!("barrera '{tag}'");
        let resp = self
            .http
            .post(self.url("/api/v1/barrier"))
            .timeout(self.config.connect_time_limit)
            .json(&BarrierRequest {
                worker_id,
                tag: tag.to_string(),
            })
            .send()
            .await
            .map_err(|e| self.http_error(&what, e))?;

        match resp.status() {
            StatusCode::REQUEST_TIMEOUT => Err(ClientError::Timeout {
                what,
                secs: self.config.connect_time_limit.as_secs(),
            }),
            status if status.is_success() => {
                let body: BarrierResponse =
                    resp.json().await.map_err(|e| self.http_error(&what, e))?;
                debug!("barrera '{}' liberada={}", body.tag, body.released);
                Ok(())
            }
            status => Err(ClientError::Http {
                what,
                message: status.to_string(),
            }),
        }
    }

    pub async fn report_state(&self, state: WorkerState) -> Result<(), ClientError> {
        let worker_id = self.registered_id(ClientInput::ConnectSucceeded)?;
        let resp = self
            .http
            .post(self.url("/api/v1/workers/state"))
            .json(&StateRequest { worker_id, state })
            .send()
            .await
            .map_err(|e| self.http_error("cambio de estado", e))?;
        if !resp.status().is_success() {
            return Err(ClientError::Http {
                what: "cambio de estado".to_string(),
                message: resp.status().to_string(),
            });
        }
        info!("estado reportado: {:?}", state);
        Ok(())
    }

    /// Heartbeats periódicos mientras el worker está registrado.
    pub fn start_pinger(&self) -> Result<JoinHandle<()>, ClientError> {
        let worker_id = self.registered_id(ClientInput::ConnectSucceeded)?;
        let http = self.http.clone();
        let url = self.url("/api/v1/workers/heartbeat");
        let every = self.config.ping_interval;

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match http
                    .post(&url)
                    .json(&HeartbeatRequest { worker_id })
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!("heartbeat rechazado: {}", resp.status()),
                    Err(e) => warn!("heartbeat falló: {}", e),
                }
            }
        }))
    }

    pub fn close(&mut self) {
        // Close vale desde cualquier estado
        let _ = self.apply(ClientInput::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camino_feliz() {
        let mut s = ClientState::Disconnected;
        for input in [
            ClientInput::ConnectAttempt,
            ClientInput::ConnectRefused,
            ClientInput::ConnectRefused,
            ClientInput::ConnectSucceeded,
            ClientInput::Registered(3),
        ] {
            s = transition(s, input).unwrap();
        }
        assert_eq!(s, ClientState::Registered(3));
        assert_eq!(
            transition(s, ClientInput::Close).unwrap(),
            ClientState::Disconnected
        );
    }

    #[test]
    fn fallos_terminales() {
        assert_eq!(
            transition(ClientState::Connecting, ClientInput::TimeLimitExceeded).unwrap(),
            ClientState::Failed
        );
        assert_eq!(
            transition(ClientState::Connected, ClientInput::RegistrationRejected).unwrap(),
            ClientState::Failed
        );
    }

    #[test]
    fn transiciones_invalidas() {
        assert!(matches!(
            transition(ClientState::Disconnected, ClientInput::Registered(1)),
            Err(ClientError::InvalidState { .. })
        ));
        assert!(matches!(
            transition(ClientState::Failed, ClientInput::ConnectAttempt),
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn sin_master_agota_el_limite() {
        let mut client = JmClient::new(ClientConfig {
            master_url: "http://127.0.0.1:1".to_string(),
            connect_time_limit: Duration::from_millis(200),
            response_wait: Duration::from_millis(100),
            ping_interval: Duration::from_secs(1),
        })
        .unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionRefused { .. }));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[tokio::test]
    async fn registrar_sin_conectar_es_invalido() {
        let mut client = JmClient::new(ClientConfig::default()).unwrap();
        let req = RegisterRequest {
            host: "h".to_string(),
            port: 0,
            resource: common::Resource::ZERO,
        };
        assert!(matches!(
            client.register(&req).await,
            Err(ClientError::InvalidState { .. })
        ));
        assert!(client.list_workers().await.is_err());
    }
}
