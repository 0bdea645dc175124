use serde::Deserialize;
use std::time::Duration;

use crate::error::{CommsError, CommsResult};
use crate::frame::FRAME_HEADER_LEN;

const DEFAULT_BUFFER_SIZE: usize = 2048;
const DEFAULT_POOL_BUFFERS: usize = 64;
const DEFAULT_FAN_OUT: u32 = 2;
const DEFAULT_MAX_PENDING_SENDS: usize = 128;
const DEFAULT_BLOCKING_WAIT_MS: u64 = 50;

/// Parámetros del motor de comunicación de un contenedor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    /// Tamaño fijo de cada buffer de red (incluye el header del frame).
    pub buffer_size: usize,
    /// Buffers del pool de envío.
    pub send_buffers: usize,
    /// Buffers del pool de recepción.
    pub receive_buffers: usize,
    /// Hijos por nodo en los árboles de broadcast/reduce.
    pub fan_out: u32,
    /// Mensajes pendientes por operación antes de aplicar backpressure.
    pub max_pending_sends: usize,
    /// Espera máxima de la variante bloqueante de progress, en milisegundos.
    pub blocking_wait_ms: u64,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffers: DEFAULT_POOL_BUFFERS,
            receive_buffers: DEFAULT_POOL_BUFFERS,
            fan_out: DEFAULT_FAN_OUT,
            max_pending_sends: DEFAULT_MAX_PENDING_SENDS,
            blocking_wait_ms: DEFAULT_BLOCKING_WAIT_MS,
        }
    }
}

/// Lee una env var numérica; si no existe o no parsea se queda con el default.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

impl CommsConfig {
    /// Defaults sobreescritos con las env vars COMMS_*.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            buffer_size: env_or("COMMS_BUFFER_SIZE", d.buffer_size),
            send_buffers: env_or("COMMS_SEND_BUFFERS", d.send_buffers),
            receive_buffers: env_or("COMMS_RECEIVE_BUFFERS", d.receive_buffers),
            fan_out: env_or("COMMS_FAN_OUT", d.fan_out),
            max_pending_sends: env_or("COMMS_MAX_PENDING_SENDS", d.max_pending_sends),
            blocking_wait_ms: d.blocking_wait_ms,
        }
    }

    pub fn validate(&self) -> CommsResult<()> {
        // el primer buffer de un mensaje lleva header + prefijo de longitud total
        if self.buffer_size <= FRAME_HEADER_LEN + 4 {
            return Err(CommsError::InvalidConfig(format!(
                "buffer_size={} no alcanza para el header ({} bytes)",
                self.buffer_size,
                FRAME_HEADER_LEN + 4
            )));
        }
        if self.send_buffers == 0 || self.receive_buffers == 0 {
            return Err(CommsError::InvalidConfig(
                "los pools de buffers no pueden estar vacíos".to_string(),
            ));
        }
        if self.fan_out == 0 {
            return Err(CommsError::InvalidConfig("fan_out debe ser >= 1".to_string()));
        }
        if self.max_pending_sends == 0 {
            return Err(CommsError::InvalidConfig(
                "max_pending_sends debe ser >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn blocking_wait(&self) -> Duration {
        Duration::from_millis(self.blocking_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_es_valido() {
        assert!(CommsConfig::default().validate().is_ok());
    }

    #[test]
    fn buffer_demasiado_chico_es_invalido() {
        let cfg = CommsConfig {
            buffer_size: FRAME_HEADER_LEN + 4,
            ..CommsConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CommsError::InvalidConfig(_))));
    }

    #[test]
    fn fan_out_cero_es_invalido() {
        let cfg = CommsConfig {
            fan_out: 0,
            ..CommsConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_env_respeta_env_var() {
        std::env::set_var("COMMS_FAN_OUT", "4");
        assert_eq!(CommsConfig::from_env().fan_out, 4);
        std::env::set_var("COMMS_FAN_OUT", "no-es-numero");
        assert_eq!(CommsConfig::from_env().fan_out, DEFAULT_FAN_OUT);
        std::env::remove_var("COMMS_FAN_OUT");
    }

    #[test]
    fn deserializa_parcial_con_defaults() {
        let cfg: CommsConfig = serde_json::from_str(r#"{"buffer_size": 64}"#).unwrap();
        assert_eq!(cfg.buffer_size, 64);
        assert_eq!(cfg.fan_out, DEFAULT_FAN_OUT);
    }
}
