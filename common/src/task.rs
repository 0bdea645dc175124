use serde::{Deserialize, Serialize};

use crate::resource::Resource;

/// Vértice del grafo de tasks: una computación lógica con `parallelism` instancias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskVertex {
    pub name: String,
    pub parallelism: u32,
    /// Recurso por instancia; si falta se usa el default del scheduler.
    #[serde(default)]
    pub resource: Option<Resource>,
}

impl TaskVertex {
    pub fn new(name: impl Into<String>, parallelism: u32) -> Self {
        Self {
            name: name.into(),
            parallelism,
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }
}
