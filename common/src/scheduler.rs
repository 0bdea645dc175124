//! Scheduler batch round-robin.
//!
//! Las instancias de todos los vértices se reparten en orden sobre los contenedores
//! (un contenedor por worker). Un worker que declaró su capacidad se saltea cuando
//! ya no le entra otra instancia. Los ids de task y de plan salen de un `IdAllocator`
//! que pertenece al contexto de construcción.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ScheduleError;
use crate::plan::{ContainerPlan, TaskInstancePlan, TaskSchedulePlan};
use crate::resource::Resource;
use crate::task::TaskVertex;
use crate::worker::WorkerInfo;
use crate::{ContainerId, TaskId, WorkerId};

const DEFAULT_INSTANCE_RAM: f64 = 512.0;
const DEFAULT_INSTANCE_CPU: f64 = 1.0;
const DEFAULT_INSTANCE_DISK: f64 = 1024.0;

fn env_or(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Recurso por instancia cuando el vértice no declara uno.
    pub instance: Resource,
    /// Lo que se suma a cada contenedor además de sus instancias.
    pub container_padding: Resource,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance: Resource::new(DEFAULT_INSTANCE_RAM, DEFAULT_INSTANCE_CPU, DEFAULT_INSTANCE_DISK),
            container_padding: Resource::ZERO,
        }
    }
}

impl SchedulerConfig {
    /// Defaults sobreescritos con SCHED_INSTANCE_{RAM,CPU,DISK} y SCHED_PADDING_{RAM,CPU,DISK}.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            instance: Resource::new(
                env_or("SCHED_INSTANCE_RAM", d.instance.ram),
                env_or("SCHED_INSTANCE_CPU", d.instance.cpu),
                env_or("SCHED_INSTANCE_DISK", d.instance.disk),
            ),
            container_padding: Resource::new(
                env_or("SCHED_PADDING_RAM", d.container_padding.ram),
                env_or("SCHED_PADDING_CPU", d.container_padding.cpu),
                env_or("SCHED_PADDING_DISK", d.container_padding.disk),
            ),
        }
    }
}

/// Contadores de ids del contexto de construcción.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_task: TaskId,
    next_plan: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_task(&mut self) -> TaskId {
        let id = self.next_task;
        self.next_task += 1;
        id
    }

    pub fn next_plan(&mut self) -> u32 {
        let id = self.next_plan;
        self.next_plan += 1;
        id
    }
}

/// Workers disponibles y lo que declaró cada uno.
#[derive(Debug, Clone, Default)]
pub struct WorkerPlan {
    workers: BTreeMap<WorkerId, Resource>,
}

impl WorkerPlan {
    pub fn new(workers: impl IntoIterator<Item = (WorkerId, Resource)>) -> Self {
        Self {
            workers: workers.into_iter().collect(),
        }
    }

    /// `n` workers sin recursos declarados (el contenedor se dimensiona por sus instancias).
    pub fn uniform(n: u32) -> Self {
        Self::new((0..n).map(|id| (id, Resource::ZERO)))
    }

    pub fn from_workers(workers: &[WorkerInfo]) -> Self {
        Self::new(workers.iter().map(|w| (w.id, w.resource)))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Resource> {
        self.workers.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.keys().copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoundRobinScheduler {
    config: SchedulerConfig,
}

impl RoundRobinScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn schedule_batch(
        &self,
        vertices: &[TaskVertex],
        workers: &WorkerPlan,
        ids: &mut IdAllocator,
    ) -> Result<TaskSchedulePlan, ScheduleError> {
        if workers.is_empty() {
            return Err(ScheduleError::NoWorkers);
        }
        self.config.instance.validate("instancia por defecto")?;
        self.config.container_padding.validate("padding de contenedor")?;

        let containers: Vec<ContainerId> = workers.ids().collect();
        let mut assigned: BTreeMap<ContainerId, Vec<TaskInstancePlan>> =
            containers.iter().map(|c| (*c, Vec::new())).collect();
        // RAM, CPU y disco se acumulan cada uno por su lado
        let mut load: BTreeMap<ContainerId, Resource> = containers
            .iter()
            .map(|c| (*c, self.config.container_padding))
            .collect();

        let mut cursor = 0usize;
        for vertex in vertices {
            if vertex.parallelism == 0 {
                return Err(ScheduleError::ZeroParallelism(vertex.name.clone()));
            }
            let resource = vertex.resource.unwrap_or(self.config.instance);
            resource.validate(&vertex.name)?;

            for index in 0..vertex.parallelism {
                // siguiente contenedor en orden que todavía tenga lugar
                let slot = (0..containers.len())
                    .map(|k| (cursor + k) % containers.len())
                    .find(|pos| {
                        let c = containers[*pos];
                        let next = load.get(&c).copied().unwrap_or_default() + resource;
                        match workers.worker(c) {
                            Some(declared) if declared.is_declared() => next.fits_within(declared),
                            _ => true,
                        }
                    })
                    .ok_or_else(|| ScheduleError::NoCapacity {
                        vertex: vertex.name.clone(),
                        index,
                    })?;
                let container = containers[slot];
                cursor = slot + 1;

                *load.entry(container).or_default() += resource;
                assigned.entry(container).or_default().push(TaskInstancePlan {
                    task_id: ids.next_task(),
                    vertex: vertex.name.clone(),
                    index,
                    resource,
                });
            }
        }

        let plans = assigned
            .into_iter()
            .map(|(id, instances)| {
                let computed = load.get(&id).copied().unwrap_or_default();
                let resource = match workers.worker(id) {
                    Some(declared) if declared.is_declared() => *declared,
                    _ => computed,
                };
                debug!(
                    "contenedor {}: {} instancias, ram={} cpu={} disk={}",
                    id,
                    instances.len(),
                    resource.ram,
                    resource.cpu,
                    resource.disk
                );
                ContainerPlan {
                    id,
                    instances,
                    resource,
                }
            })
            .collect();

        TaskSchedulePlan::new(ids.next_plan(), plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> RoundRobinScheduler {
        RoundRobinScheduler::new(SchedulerConfig {
            instance: Resource::new(100.0, 1.0, 10.0),
            container_padding: Resource::new(1.0, 0.5, 2.0),
        })
    }

    #[test]
    fn reparte_en_round_robin_entre_vertices() {
        let vertices = vec![TaskVertex::new("source", 4), TaskVertex::new("sink", 2)];
        let mut ids = IdAllocator::new();
        let plan = scheduler()
            .schedule_batch(&vertices, &WorkerPlan::uniform(3), &mut ids)
            .unwrap();

        // source 0..4 y sink 4..6, el cursor sigue entre vértices
        assert_eq!(plan.tasks_in(0), vec![0, 3]);
        assert_eq!(plan.tasks_in(1), vec![1, 4]);
        assert_eq!(plan.tasks_in(2), vec![2, 5]);
        assert_eq!(plan.tasks_of("sink"), vec![4, 5]);
        assert_eq!(plan.task_count(), 6);
    }

    #[test]
    fn cpu_se_acumula_aparte_del_disco() {
        let vertices = vec![TaskVertex::new("map", 2)];
        let mut ids = IdAllocator::new();
        let plan = scheduler()
            .schedule_batch(&vertices, &WorkerPlan::uniform(1), &mut ids)
            .unwrap();
        let c = plan.container(0).unwrap();
        assert_eq!(c.resource, Resource::new(201.0, 2.5, 22.0));
    }

    #[test]
    fn worker_con_recursos_declarados_manda() {
        let declared = Resource::new(4096.0, 8.0, 10_000.0);
        let workers = WorkerPlan::new([(0, declared), (1, Resource::new(1.0, 0.0, 1.0))]);
        let mut ids = IdAllocator::new();
        let plan = scheduler()
            .schedule_batch(&[TaskVertex::new("map", 2)], &workers, &mut ids)
            .unwrap();
        assert_eq!(plan.container(0).unwrap().resource, declared);
        // cpu 0: no cuenta como declarado
        assert_eq!(
            plan.container(1).unwrap().resource,
            Resource::new(101.0, 1.5, 12.0)
        );
        assert_eq!(plan.max_container_resources(), declared);
    }

    #[test]
    fn worker_lleno_se_saltea() {
        // entran dos instancias: 1 + 2 * 100 = 201 <= 250
        let workers = WorkerPlan::new([
            (0, Resource::new(250.0, 4.0, 100.0)),
            (1, Resource::ZERO),
        ]);
        let mut ids = IdAllocator::new();
        let plan = scheduler()
            .schedule_batch(&[TaskVertex::new("map", 6)], &workers, &mut ids)
            .unwrap();
        assert_eq!(plan.tasks_in(0), vec![0, 2]);
        assert_eq!(plan.tasks_in(1), vec![1, 3, 4, 5]);

        // sin recursos declarados el reparto es parejo
        let mut ids = IdAllocator::new();
        let uniform = scheduler()
            .schedule_batch(&[TaskVertex::new("map", 6)], &WorkerPlan::uniform(2), &mut ids)
            .unwrap();
        assert_eq!(uniform.tasks_in(0), vec![0, 2, 4]);
    }

    #[test]
    fn sin_lugar_en_ningun_worker() {
        let workers = WorkerPlan::new([(0, Resource::new(1.0, 1.0, 1.0))]);
        let mut ids = IdAllocator::new();
        assert_eq!(
            scheduler()
                .schedule_batch(&[TaskVertex::new("map", 1)], &workers, &mut ids)
                .unwrap_err(),
            ScheduleError::NoCapacity {
                vertex: "map".to_string(),
                index: 0
            }
        );
    }

    #[test]
    fn recurso_del_vertice_reemplaza_al_default() {
        let v = TaskVertex::new("heavy", 1).with_resource(Resource::new(1000.0, 4.0, 0.0));
        let mut ids = IdAllocator::new();
        let plan = scheduler()
            .schedule_batch(&[v], &WorkerPlan::uniform(1), &mut ids)
            .unwrap();
        assert_eq!(
            plan.container(0).unwrap().resource,
            Resource::new(1001.0, 4.5, 2.0)
        );
    }

    #[test]
    fn ids_siguen_entre_planes() {
        let mut ids = IdAllocator::new();
        let s = scheduler();
        let first = s
            .schedule_batch(&[TaskVertex::new("a", 2)], &WorkerPlan::uniform(2), &mut ids)
            .unwrap();
        let second = s
            .schedule_batch(&[TaskVertex::new("b", 2)], &WorkerPlan::uniform(2), &mut ids)
            .unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_eq!(second.tasks_of("b"), vec![2, 3]);
    }

    #[test]
    fn errores_de_entrada() {
        let mut ids = IdAllocator::new();
        let s = scheduler();
        assert_eq!(
            s.schedule_batch(&[TaskVertex::new("a", 1)], &WorkerPlan::default(), &mut ids)
                .unwrap_err(),
            ScheduleError::NoWorkers
        );
        assert_eq!(
            s.schedule_batch(&[TaskVertex::new("a", 0)], &WorkerPlan::uniform(1), &mut ids)
                .unwrap_err(),
            ScheduleError::ZeroParallelism("a".to_string())
        );
        let negative = TaskVertex::new("neg", 1).with_resource(Resource::new(-1.0, 1.0, 1.0));
        assert!(matches!(
            s.schedule_batch(&[negative], &WorkerPlan::uniform(1), &mut ids),
            Err(ScheduleError::NegativeResource(_))
        ));
    }
}
