//! Punto de entrada del motor para un contenedor: un canal, el registro de packers
//! y las operaciones registradas, todo movido por un único hilo de progreso.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use common::plan::TaskSchedulePlan;
use common::{ContainerId, TaskId};
use tracing::{debug, info};

use crate::channel::{Channel, EdgeId};
use crate::config::CommsConfig;
use crate::error::{CommsError, CommsResult};
use crate::operation::{Operation, OperationKind, OperationPlan, Sink};
use crate::packer::{KeyValue, PackerRegistry, Value};

pub struct Communicator<C: Channel> {
    channel: C,
    plan: Arc<TaskSchedulePlan>,
    config: CommsConfig,
    registry: PackerRegistry,
    ops: BTreeMap<EdgeId, Operation>,
}

impl<C: Channel> Communicator<C> {
    pub fn new(channel: C, plan: Arc<TaskSchedulePlan>, config: CommsConfig) -> CommsResult<Self> {
        config.validate()?;
        Ok(Self {
            channel,
            plan,
            config,
            registry: PackerRegistry::new(),
            ops: BTreeMap::new(),
        })
    }

    pub fn container(&self) -> ContainerId {
        self.channel.container()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    /// Tasks del plan que viven en este contenedor.
    pub fn local_tasks(&self) -> Vec<TaskId> {
        self.plan.tasks_in(self.container())
    }

    /// Registra la operación en este contenedor. Todas sus tasks tienen que estar ubicadas.
    pub fn register(&mut self, plan: &OperationPlan, sink: Box<dyn Sink>) -> CommsResult<EdgeId> {
        let edge = plan.edge();
        if self.ops.contains_key(&edge) {
            return Err(CommsError::InvalidConfig(format!("edge {edge} ya registrado")));
        }
        let mut placement = BTreeMap::new();
        for task in plan.spec.all_tasks() {
            let container = self
                .plan
                .container_of(task)
                .ok_or(CommsError::UnplacedTask(task))?;
            placement.insert(task, container);
        }
        let op = Operation::new(
            plan,
            &placement,
            self.container(),
            self.registry,
            self.config.max_pending_sends,
            sink,
        )?;
        debug!(
            "contenedor {} registró {:?} en el edge {}",
            self.container(),
            plan.spec.kind,
            edge
        );
        self.ops.insert(edge, op);
        Ok(edge)
    }

    fn op(&mut self, edge: EdgeId) -> CommsResult<&mut Operation> {
        self.ops.get_mut(&edge).ok_or(CommsError::UnknownEdge(edge))
    }

    pub fn kind(&self, edge: EdgeId) -> CommsResult<OperationKind> {
        self.ops
            .get(&edge)
            .map(Operation::kind)
            .ok_or(CommsError::UnknownEdge(edge))
    }

    /// `Ok(false)`: sin lugar en la cola, llamar a `progress` y reintentar.
    pub fn send(&mut self, edge: EdgeId, source: TaskId, value: Value) -> CommsResult<bool> {
        self.op(edge)?.send(source, value)
    }

    pub fn send_keyed(&mut self, edge: EdgeId, source: TaskId, pair: KeyValue) -> CommsResult<bool> {
        self.op(edge)?.send_keyed(source, pair)
    }

    pub fn send_to(
        &mut self,
        edge: EdgeId,
        source: TaskId,
        destination: TaskId,
        value: Value,
    ) -> CommsResult<bool> {
        self.op(edge)?.send_to(source, destination, value)
    }

    pub fn finish(&mut self, edge: EdgeId, source: TaskId) -> CommsResult<()> {
        self.op(edge)?.finish(source)
    }

    /// Un tick sin bloquear. Devuelve si alguna operación hizo algo.
    pub fn progress(&mut self) -> CommsResult<bool> {
        let mut did_work = false;
        for op in self.ops.values_mut() {
            did_work |= op.progress(&mut self.channel)?;
        }
        self.channel.progress()?;
        Ok(did_work)
    }

    pub fn is_complete(&self, edge: EdgeId) -> CommsResult<bool> {
        self.ops
            .get(&edge)
            .map(Operation::is_complete)
            .ok_or(CommsError::UnknownEdge(edge))
    }

    pub fn all_complete(&self) -> bool {
        self.ops.values().all(Operation::is_complete)
    }

    /// Variante bloqueante: progresa hasta que `done` se cumple o vence `deadline`.
    /// Cuando no hay trabajo espera en el canal; `wakeup`/`close` la interrumpen.
    pub fn progress_until(
        &mut self,
        mut done: impl FnMut(&Self) -> bool,
        deadline: Instant,
    ) -> CommsResult<bool> {
        loop {
            let did_work = self.progress()?;
            if done(self) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if !did_work {
                let wait = self.config.blocking_wait().min(deadline - now);
                self.channel.wait(wait)?;
            }
        }
    }

    /// Cierra el canal y descarta lo que estaba a medio llegar.
    pub fn close(&mut self) -> usize {
        let mut dropped = 0;
        for op in self.ops.values_mut() {
            dropped += op.drop_incomplete(&mut self.channel);
        }
        self.channel.close();
        info!(
            "contenedor {} cerrado ({} mensajes incompletos descartados)",
            self.container(),
            dropped
        );
        dropped
    }
}
