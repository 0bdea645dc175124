use common::TaskId;
use thiserror::Error;

use crate::packer::DataType;

pub type CommsResult<T> = Result<T, CommsError>;

/// Errores del motor de comunicación colectiva.
///
/// Todo es fatal salvo `BufferOverflow`: en ese caso el llamador reintenta
/// en el siguiente tick de `progress()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommsError {
    #[error("origen desconocido en la topología: {0}")]
    UnknownSource(TaskId),

    #[error("mensaje inesperado del origen {from} para el destino {destination}")]
    UnexpectedSource { from: TaskId, destination: TaskId },

    #[error("no hay espacio en el buffer: se necesitan {needed} bytes, quedan {remaining}")]
    BufferOverflow { needed: usize, remaining: usize },

    #[error("tipo de dato inesperado: se esperaba {expected:?}, llegó {found}")]
    SerializationTypeMismatch { expected: DataType, found: String },

    #[error("frame mal formado: {0}")]
    MalformedFrame(String),

    #[error("el destino {destination} ya terminó y recibió un mensaje de {from}")]
    MessageAfterFinish { from: TaskId, destination: TaskId },

    #[error("topología inválida: {0}")]
    InvalidTopology(String),

    #[error("configuración inválida: {0}")]
    InvalidConfig(String),

    #[error("edge desconocido: {0}")]
    UnknownEdge(u32),

    #[error("la tarea {0} no está asignada a ningún contenedor del plan")]
    UnplacedTask(TaskId),

    #[error("canal cerrado")]
    Closed,
}

impl CommsError {
    /// Los errores fatales abortan la operación (y el worker); el resto se reintenta.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CommsError::BufferOverflow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_buffer_overflow_es_transitorio() {
        let transient = CommsError::BufferOverflow {
            needed: 8,
            remaining: 4,
        };
        assert!(!transient.is_fatal());
        assert!(CommsError::UnknownSource(3).is_fatal());
        assert!(CommsError::UnexpectedSource {
            from: 1,
            destination: 2
        }
        .is_fatal());
        assert!(CommsError::Closed.is_fatal());
    }

    #[test]
    fn mensaje_nombra_origen_y_destino() {
        let err = CommsError::MessageAfterFinish {
            from: 4,
            destination: 7,
        };
        assert_eq!(
            err.to_string(),
            "el destino 7 ya terminó y recibió un mensaje de 4"
        );
    }
}
