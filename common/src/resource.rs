use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

use crate::error::ScheduleError;

/// Cuota de RAM (MB), CPU (cores) y disco (MB).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub ram: f64,
    pub cpu: f64,
    pub disk: f64,
}

impl Resource {
    pub const ZERO: Resource = Resource {
        ram: 0.0,
        cpu: 0.0,
        disk: 0.0,
    };

    pub fn new(ram: f64, cpu: f64, disk: f64) -> Self {
        Self { ram, cpu, disk }
    }

    pub fn validate(&self, what: &str) -> Result<(), ScheduleError> {
        if self.ram < 0.0 || self.cpu < 0.0 || self.disk < 0.0 {
            return Err(ScheduleError::NegativeResource(what.to_string()));
        }
        Ok(())
    }

    /// Los tres valores > 0: un worker así declara su propia capacidad.
    pub fn is_declared(&self) -> bool {
        self.ram > 0.0 && self.cpu > 0.0 && self.disk > 0.0
    }

    /// Máximo componente a componente.
    pub fn max(&self, other: &Resource) -> Resource {
        Resource {
            ram: self.ram.max(other.ram),
            cpu: self.cpu.max(other.cpu),
            disk: self.disk.max(other.disk),
        }
    }

    pub fn fits_within(&self, capacity: &Resource) -> bool {
        self.ram <= capacity.ram && self.cpu <= capacity.cpu && self.disk <= capacity.disk
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        Resource {
            ram: self.ram + rhs.ram,
            cpu: self.cpu + rhs.cpu,
            disk: self.disk + rhs.disk,
        }
    }
}

impl AddAssign for Resource {
    fn add_assign(&mut self, rhs: Resource) {
        *self = *self + rhs;
    }
}
