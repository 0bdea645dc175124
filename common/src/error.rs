use thiserror::Error;

use crate::{ContainerId, TaskId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("el plan de workers está vacío")]
    NoWorkers,

    #[error("el vértice {0} tiene paralelismo 0")]
    ZeroParallelism(String),

    #[error("recurso negativo en {0}")]
    NegativeResource(String),

    #[error("ningún worker tiene lugar para la instancia {index} de {vertex}")]
    NoCapacity { vertex: String, index: u32 },

    #[error("la task {task} aparece en los contenedores {first} y {second}")]
    DuplicateTask {
        task: TaskId,
        first: ContainerId,
        second: ContainerId,
    },
}
