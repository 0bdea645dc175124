//! Salida del scheduler: qué instancia vive en qué contenedor y con qué recursos.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::ScheduleError;
use crate::resource::Resource;
use crate::{ContainerId, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInstancePlan {
    pub task_id: TaskId,
    /// Nombre del vértice al que pertenece la instancia.
    pub vertex: String,
    /// Índice de la instancia dentro del vértice.
    pub index: u32,
    pub resource: Resource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerPlan {
    pub id: ContainerId,
    pub instances: Vec<TaskInstancePlan>,
    pub resource: Resource,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSchedulePlan {
    pub id: u32,
    containers: BTreeMap<ContainerId, ContainerPlan>,
    #[serde(skip)]
    by_task: BTreeMap<TaskId, ContainerId>,
}

impl TaskSchedulePlan {
    /// Cada instancia tiene que aparecer en un único contenedor.
    pub fn new(id: u32, containers: Vec<ContainerPlan>) -> Result<Self, ScheduleError> {
        let mut by_task = BTreeMap::new();
        let mut map = BTreeMap::new();
        for container in containers {
            for instance in &container.instances {
                if let Some(first) = by_task.insert(instance.task_id, container.id) {
                    return Err(ScheduleError::DuplicateTask {
                        task: instance.task_id,
                        first,
                        second: container.id,
                    });
                }
            }
            map.insert(container.id, container);
        }
        Ok(Self {
            id,
            containers: map,
            by_task,
        })
    }

    pub fn container_of(&self, task: TaskId) -> Option<ContainerId> {
        self.by_task.get(&task).copied()
    }

    pub fn tasks_in(&self, container: ContainerId) -> Vec<TaskId> {
        self.containers
            .get(&container)
            .map(|c| c.instances.iter().map(|i| i.task_id).collect())
            .unwrap_or_default()
    }

    /// Instancias de un vértice, en orden de índice.
    pub fn tasks_of(&self, vertex: &str) -> Vec<TaskId> {
        let mut instances: Vec<&TaskInstancePlan> = self
            .containers
            .values()
            .flat_map(|c| c.instances.iter())
            .filter(|i| i.vertex == vertex)
            .collect();
        instances.sort_by_key(|i| i.index);
        instances.iter().map(|i| i.task_id).collect()
    }

    pub fn task_counts(&self) -> BTreeMap<ContainerId, usize> {
        self.containers
            .iter()
            .map(|(id, c)| (*id, c.instances.len()))
            .collect()
    }

    pub fn max_container_resources(&self) -> Resource {
        self.containers
            .values()
            .fold(Resource::ZERO, |acc, c| acc.max(&c.resource))
    }

    pub fn container(&self, id: ContainerId) -> Option<&ContainerPlan> {
        self.containers.get(&id)
    }

    pub fn containers(&self) -> impl Iterator<Item = &ContainerPlan> {
        self.containers.values()
    }

    pub fn task_count(&self) -> usize {
        self.by_task.len()
    }
}
