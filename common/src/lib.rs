pub mod error;
pub mod plan;
pub mod resource;
pub mod scheduler;
pub mod task;
pub mod worker;

/// Id global de una instancia de task.
pub type TaskId = u32;
/// Id que asigna el job master a cada worker, en orden de registro.
pub type WorkerId = u32;
/// Contenedor lógico del plan; en un despliegue normal coincide con el `WorkerId`.
pub type ContainerId = u32;

pub use error::ScheduleError;
pub use plan::{ContainerPlan, TaskInstancePlan, TaskSchedulePlan};
pub use resource::Resource;
pub use scheduler::{IdAllocator, RoundRobinScheduler, SchedulerConfig, WorkerPlan};
pub use task::TaskVertex;
pub use worker::*;
