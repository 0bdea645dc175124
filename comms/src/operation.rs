//! Operaciones colectivas.
//!
//! Cada operación arma uno o dos `Stage`, cada uno sobre su propio edge: router,
//! receivers de las tasks locales, ensamblador y cola de salida. Las compuestas
//! (all-reduce, all-gather) encadenan el segundo stage desde la raíz del primero.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use common::{ContainerId, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::assembler::{decode_payload, Assembler, OutMessage, Payload, PayloadShape};
use crate::buffer::DataBuffer;
use crate::channel::{Channel, EdgeId};
use crate::error::{CommsError, CommsResult};
use crate::packer::{DataType, KeyValue, PackerRegistry, Value};
use crate::receiver::{CombinePolicy, Delivery, Mode, Receiver, ReceiverEvent, Reducer};
use crate::router::{Router, RouterKind, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Broadcast,
    Reduce,
    Gather,
    Partition,
    KeyedReduce,
    AllReduce,
    AllGather,
}

impl OperationKind {
    pub fn edges(self) -> usize {
        match self {
            OperationKind::AllReduce | OperationKind::AllGather => 2,
            _ => 1,
        }
    }

    fn needs_reducer(self) -> bool {
        matches!(
            self,
            OperationKind::Reduce | OperationKind::AllReduce | OperationKind::KeyedReduce
        )
    }
}

impl FromStr for OperationKind {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "broadcast" => Ok(OperationKind::Broadcast),
            "reduce" => Ok(OperationKind::Reduce),
            "gather" => Ok(OperationKind::Gather),
            "partition" => Ok(OperationKind::Partition),
            "keyed_reduce" => Ok(OperationKind::KeyedReduce),
            "allreduce" | "all_reduce" => Ok(OperationKind::AllReduce),
            "allgather" | "all_gather" => Ok(OperationKind::AllGather),
            other => Err(CommsError::InvalidConfig(format!(
                "operación desconocida: {other}"
            ))),
        }
    }
}

/* =========================
   Descripción de la operación
   ========================= */

#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub kind: OperationKind,
    pub sources: BTreeSet<TaskId>,
    pub destinations: BTreeSet<TaskId>,
    pub mode: Mode,
    pub data_type: DataType,
    /// Solo keyed-reduce.
    pub key_type: Option<DataType>,
    pub reducer: Option<Reducer>,
    pub fan_out: u32,
}

impl OperationSpec {
    pub fn new(
        kind: OperationKind,
        sources: impl IntoIterator<Item = TaskId>,
        destinations: impl IntoIterator<Item = TaskId>,
        data_type: DataType,
    ) -> Self {
        Self {
            kind,
            sources: sources.into_iter().collect(),
            destinations: destinations.into_iter().collect(),
            mode: Mode::Streaming,
            data_type,
            key_type: None,
            reducer: None,
            fan_out: 2,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_reducer(mut self, reducer: impl Into<Reducer>) -> Self {
        self.reducer = Some(reducer.into());
        self
    }

    pub fn with_key_type(mut self, key_type: DataType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    pub fn with_fan_out(mut self, fan_out: u32) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn all_tasks(&self) -> BTreeSet<TaskId> {
        self.sources.union(&self.destinations).copied().collect()
    }

    fn validate(&self) -> CommsResult<()> {
        if self.kind.needs_reducer() && self.reducer.is_none() {
            return Err(CommsError::InvalidConfig(format!(
                "{:?} necesita una función de reducción",
                self.kind
            )));
        }
        if self.kind == OperationKind::KeyedReduce && self.key_type.is_none() {
            return Err(CommsError::InvalidConfig(
                "keyed-reduce necesita el tipo de la clave".to_string(),
            ));
        }
        if self.kind == OperationKind::Reduce && self.destinations.len() != 1 {
            return Err(CommsError::InvalidConfig(format!(
                "reduce admite un único destino, hay {}",
                self.destinations.len()
            )));
        }
        if self.kind == OperationKind::Broadcast && self.sources.len() != 1 {
            return Err(CommsError::InvalidConfig(format!(
                "broadcast admite un único origen, hay {}",
                self.sources.len()
            )));
        }
        // arma la topología solo para validar vacíos y fan-out
        Topology::new(
            self.sources.iter().copied(),
            self.destinations.iter().copied(),
            self.fan_out,
        )?;
        Ok(())
    }
}

/// Operación ya validada con sus edges asignados; la comparten todos los contenedores.
#[derive(Debug, Clone)]
pub struct OperationPlan {
    pub spec: OperationSpec,
    pub edges: Vec<EdgeId>,
}

impl OperationPlan {
    /// Edge principal, con el que se identifica la operación.
    pub fn edge(&self) -> EdgeId {
        self.edges[0]
    }
}

/// Contexto de construcción: reparte los ids de edge.
#[derive(Debug, Default)]
pub struct OperationBuilder {
    next_edge: EdgeId,
}

impl OperationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&mut self, spec: OperationSpec) -> CommsResult<OperationPlan> {
        spec.validate()?;
        let edges = (0..spec.kind.edges())
            .map(|_| {
                let edge = self.next_edge;
                self.next_edge += 1;
                edge
            })
            .collect();
        Ok(OperationPlan { spec, edges })
    }
}

/* =========================
   Sink
   ========================= */

/// Consumidor de lo que produce una operación en las tasks destino locales.
pub trait Sink: Send {
    fn on_round_complete(&mut self, destination: TaskId, delivery: Delivery);

    fn on_sync(&mut self, destination: TaskId);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Round { destination: TaskId, delivery: Delivery },
    Sync { destination: TaskId },
}

/// Sink que guarda todo lo que recibe; se puede clonar y leer desde otro hilo.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn deliveries_for(&self, destination: TaskId) -> Vec<Delivery> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Round {
                    destination: d,
                    delivery,
                } if d == destination => Some(delivery),
                _ => None,
            })
            .collect()
    }

    pub fn syncs_for(&self, destination: TaskId) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Sync { destination: d } if *d == destination))
            .count()
    }

    fn push(&self, event: SinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Sink for CollectingSink {
    fn on_round_complete(&mut self, destination: TaskId, delivery: Delivery) {
        self.push(SinkEvent::Round {
            destination,
            delivery,
        });
    }

    fn on_sync(&mut self, destination: TaskId) {
        self.push(SinkEvent::Sync { destination });
    }
}

/* =========================
   Stage: un edge
   ========================= */

#[derive(Debug, Clone)]
enum Msg {
    Data(Payload),
    Sync,
}

#[derive(Debug, Clone, Copy)]
enum Route {
    /// Envío original de una task origen.
    Origin,
    /// Reenvío por el árbol (broadcast hacia hijos, parciales hacia el padre).
    Forward,
    /// Destino elegido por el llamador (partition, keyed).
    To(TaskId),
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Local(TaskId),
    Remote(TaskId),
}

#[derive(Debug)]
struct Pending {
    container: ContainerId,
    out: OutMessage,
}

type Work = VecDeque<(usize, TaskId, ReceiverEvent)>;

struct Stage {
    edge: EdgeId,
    router: Router,
    shape: PayloadShape,
    sources: BTreeSet<TaskId>,
    receivers: BTreeMap<TaskId, Receiver>,
    placement: BTreeMap<TaskId, ContainerId>,
    assembler: Assembler,
    outbound: VecDeque<Pending>,
    held: Option<(ContainerId, DataBuffer)>,
}

impl Stage {
    #[allow(clippy::too_many_arguments)]
    fn new(
        edge: EdgeId,
        router: Router,
        shape: PayloadShape,
        sources: BTreeSet<TaskId>,
        mode: Mode,
        policy: CombinePolicy,
        registry: PackerRegistry,
        placement: &BTreeMap<TaskId, ContainerId>,
        container: ContainerId,
    ) -> CommsResult<Self> {
        let mut receivers = BTreeMap::new();
        for (task, expected) in router.expected_ids() {
            if placement.get(task) == Some(&container) {
                receivers.insert(
                    *task,
                    Receiver::new(*task, expected.clone(), mode, policy.clone(), registry)?,
                );
            }
        }
        Ok(Self {
            edge,
            router,
            shape,
            sources,
            receivers,
            placement: placement.clone(),
            assembler: Assembler::new(),
            outbound: VecDeque::new(),
            held: None,
        })
    }

    fn container_of(&self, task: TaskId) -> CommsResult<ContainerId> {
        self.placement
            .get(&task)
            .copied()
            .ok_or(CommsError::UnplacedTask(task))
    }

    fn targets(&self, from: TaskId, route: Route) -> CommsResult<Vec<Target>> {
        let has_own_receiver = self.router.expected_ids().contains_key(&from);
        let remote = |set: &BTreeSet<TaskId>| set.iter().map(|d| Target::Remote(*d)).collect::<Vec<_>>();
        let targets = match route {
            Route::Forward => remote(self.router.downstream_of(from)?),
            Route::To(d) => {
                if !self.router.is_destination(d) {
                    return Err(CommsError::InvalidTopology(format!(
                        "{d} no es destino del edge {}",
                        self.edge
                    )));
                }
                if d == from {
                    vec![Target::Local(d)]
                } else {
                    vec![Target::Remote(d)]
                }
            }
            Route::Origin => match self.router.kind() {
                RouterKind::InvertedTree if has_own_receiver => vec![Target::Local(from)],
                RouterKind::InvertedTree => remote(self.router.downstream_of(from)?),
                RouterKind::Tree | RouterKind::Flat => {
                    let mut t = remote(self.router.downstream_of(from)?);
                    if has_own_receiver && self.router.is_destination(from) {
                        t.push(Target::Local(from));
                    }
                    t
                }
            },
        };
        Ok(targets)
    }

    fn route(
        &mut self,
        index: usize,
        registry: &PackerRegistry,
        from: TaskId,
        route: Route,
        msg: &Msg,
        work: &mut Work,
    ) -> CommsResult<()> {
        for target in self.targets(from, route)? {
            match target {
                Target::Local(d) => {
                    let rx = self.receivers.get_mut(&d).ok_or_else(|| {
                        CommsError::InvalidTopology(format!("{d} no tiene receiver en este contenedor"))
                    })?;
                    let events = match msg {
                        Msg::Data(p) => rx.on_message(from, p.clone())?,
                        Msg::Sync => rx.on_sync(from)?,
                    };
                    work.extend(events.into_iter().map(|e| (index, d, e)));
                }
                Target::Remote(d) => {
                    let container = self.container_of(d)?;
                    let out = match msg {
                        Msg::Data(p) => OutMessage::data(registry, self.shape, from, d, p)?,
                        Msg::Sync => OutMessage::sync(from, d),
                    };
                    self.outbound.push_back(Pending { container, out });
                }
            }
        }
        Ok(())
    }

    /// Levanta los buffers del edge y pasa los mensajes completos a los receivers.
    fn poll_inbound(
        &mut self,
        index: usize,
        registry: &PackerRegistry,
        channel: &mut dyn Channel,
        work: &mut Work,
    ) -> CommsResult<usize> {
        let mut messages = 0;
        while let Some(buf) = channel.receive(self.edge) {
            let Some(msg) = self.assembler.on_buffer(buf, channel.receive_pool())? else {
                continue;
            };
            messages += 1;
            let header = msg.header;
            let rx = self.receivers.get_mut(&header.destination).ok_or_else(|| {
                CommsError::InvalidTopology(format!(
                    "mensaje para {} que no recibe en este contenedor (edge {})",
                    header.destination, self.edge
                ))
            })?;
            let events = if header.is_sync() {
                rx.on_sync(header.source)?
            } else {
                let payload = decode_payload(registry, self.shape, &msg.payload)?;
                rx.on_message(header.source, payload)?
            };
            work.extend(events.into_iter().map(|e| (index, header.destination, e)));
        }
        Ok(messages)
    }

    /// Vuelca la cola de salida en buffers hasta que se acaban los buffers o el canal
    /// deja de aceptar. La cola es FIFO estricta.
    fn flush(&mut self, channel: &mut dyn Channel) -> CommsResult<usize> {
        let mut sent = 0;
        if let Some((to, buf)) = self.held.take() {
            if let Err(buf) = channel.send(self.edge, to, buf) {
                self.held = Some((to, buf));
                return Ok(0);
            }
            sent += 1;
        }
        while let Some(pending) = self.outbound.front_mut() {
            let Some(mut buf) = channel.send_pool().acquire() else {
                trace!("edge {}: sin buffers de envío, se reintenta", self.edge);
                break;
            };
            if let Err(e) = pending.out.fill_next(&mut buf) {
                channel.send_pool().release(buf);
                return Err(e);
            }
            let to = pending.container;
            if pending.out.is_done() {
                self.outbound.pop_front();
            }
            if let Err(buf) = channel.send(self.edge, to, buf) {
                self.held = Some((to, buf));
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    fn is_idle(&self) -> bool {
        self.outbound.is_empty() && self.held.is_none()
    }

    fn receivers_finished(&self) -> bool {
        self.receivers.values().all(Receiver::is_finished)
    }
}

/* =========================
   Operation
   ========================= */

/// Una operación colectiva vista desde un contenedor.
pub struct Operation {
    kind: OperationKind,
    container: ContainerId,
    stages: Vec<Stage>,
    sink: Box<dyn Sink>,
    registry: PackerRegistry,
    local_sources: BTreeSet<TaskId>,
    finished_sources: BTreeSet<TaskId>,
    max_pending: usize,
    root: Option<TaskId>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("container", &self.container)
            .field("edges", &self.edges())
            .field("finished_sources", &self.finished_sources)
            .finish()
    }
}

impl Operation {
    pub fn new(
        plan: &OperationPlan,
        placement: &BTreeMap<TaskId, ContainerId>,
        container: ContainerId,
        registry: PackerRegistry,
        max_pending: usize,
        sink: Box<dyn Sink>,
    ) -> CommsResult<Self> {
        let spec = &plan.spec;
        spec.validate()?;
        if plan.edges.len() != spec.kind.edges() {
            return Err(CommsError::InvalidConfig(format!(
                "{:?} usa {} edges, el plan trae {}",
                spec.kind,
                spec.kind.edges(),
                plan.edges.len()
            )));
        }

        let topology = Topology::new(
            spec.sources.iter().copied(),
            spec.destinations.iter().copied(),
            spec.fan_out,
        )?;
        let single = PayloadShape::Single(spec.data_type);
        let fold = || CombinePolicy::Fold(spec.reducer.clone().unwrap_or(Reducer::Op(crate::receiver::ReduceOp::Sum)));
        // raíz de las compuestas: el menor destino
        let root = spec.destinations.iter().next().copied();

        let stage = |edge: EdgeId,
                     router: Router,
                     shape: PayloadShape,
                     sources: BTreeSet<TaskId>,
                     policy: CombinePolicy| {
            Stage::new(
                edge, router, shape, sources, spec.mode, policy, registry, placement, container,
            )
        };

        let stages = match spec.kind {
            OperationKind::Broadcast => vec![stage(
                plan.edges[0],
                Router::tree(&topology)?,
                single,
                spec.sources.clone(),
                CombinePolicy::PassThrough,
            )?],
            OperationKind::Reduce => vec![stage(
                plan.edges[0],
                Router::inverted_tree(&topology)?,
                single,
                spec.sources.clone(),
                fold(),
            )?],
            OperationKind::Gather => vec![stage(
                plan.edges[0],
                Router::flat(&topology),
                single,
                spec.sources.clone(),
                CombinePolicy::Collect,
            )?],
            OperationKind::Partition => vec![stage(
                plan.edges[0],
                Router::flat(&topology),
                single,
                spec.sources.clone(),
                CombinePolicy::PassThrough,
            )?],
            OperationKind::KeyedReduce => {
                let key = spec.key_type.unwrap_or(DataType::Bytes);
                let reducer = spec
                    .reducer
                    .clone()
                    .unwrap_or(Reducer::Op(crate::receiver::ReduceOp::Sum));
                vec![stage(
                    plan.edges[0],
                    Router::flat(&topology),
                    PayloadShape::Keyed {
                        key,
                        data: spec.data_type,
                    },
                    spec.sources.clone(),
                    CombinePolicy::KeyedFold(reducer),
                )?]
            }
            OperationKind::AllReduce | OperationKind::AllGather => {
                let root = root.ok_or_else(|| CommsError::InvalidTopology("sin destinos".into()))?;
                let up = Topology::new(spec.sources.iter().copied(), [root], spec.fan_out)?;
                let down = Topology::new([root], spec.destinations.iter().copied(), spec.fan_out)?;
                let (router, policy, down_shape) = if spec.kind == OperationKind::AllReduce {
                    (Router::inverted_tree(&up)?, fold(), single)
                } else {
                    (
                        Router::flat(&up),
                        CombinePolicy::Collect,
                        PayloadShape::Gathered(spec.data_type),
                    )
                };
                vec![
                    stage(plan.edges[0], router, single, spec.sources.clone(), policy)?,
                    stage(
                        plan.edges[1],
                        Router::tree(&down)?,
                        down_shape,
                        BTreeSet::from([root]),
                        CombinePolicy::PassThrough,
                    )?,
                ]
            }
        };

        let local_sources = spec
            .sources
            .iter()
            .copied()
            .filter(|s| placement.get(s) == Some(&container))
            .collect();

        debug!(
            "contenedor {}: {:?} sobre edges {:?} ({} receivers locales)",
            container,
            spec.kind,
            plan.edges,
            stages.iter().map(|s| s.receivers.len()).sum::<usize>()
        );

        Ok(Self {
            kind: spec.kind,
            container,
            stages,
            sink,
            registry,
            local_sources,
            finished_sources: BTreeSet::new(),
            max_pending: max_pending.max(1),
            root: match spec.kind {
                OperationKind::Broadcast => spec.sources.iter().next().copied(),
                _ => root,
            },
        })
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn edges(&self) -> Vec<EdgeId> {
        self.stages.iter().map(|s| s.edge).collect()
    }

    fn check_source(&self, source: TaskId) -> CommsResult<()> {
        if !self.stages[0].sources.contains(&source) {
            return Err(CommsError::UnknownSource(source));
        }
        if !self.local_sources.contains(&source) {
            return Err(CommsError::InvalidTopology(format!(
                "la task {source} no vive en el contenedor {}",
                self.container
            )));
        }
        if self.finished_sources.contains(&source) {
            return Err(CommsError::MessageAfterFinish {
                from: source,
                destination: source,
            });
        }
        Ok(())
    }

    fn check_shape(&self, payload: &Payload) -> CommsResult<()> {
        let shape = self.stages[0].shape;
        let ok = match (shape, payload) {
            (PayloadShape::Single(t), Payload::Single(v)) => v.data_type() == t,
            (PayloadShape::Keyed { key, data }, Payload::Keyed(kv)) => {
                kv.key.data_type() == key && kv.value.data_type() == data
            }
            _ => false,
        };
        if ok {
            return Ok(());
        }
        let found = match payload {
            Payload::Single(v) => format!("{:?}", v.data_type()),
            Payload::Keyed(kv) => format!("({:?}, {:?})", kv.key.data_type(), kv.value.data_type()),
            Payload::Gathered(_) => "Gathered".to_string(),
        };
        let expected = match shape {
            PayloadShape::Single(t) | PayloadShape::Gathered(t) => t,
            PayloadShape::Keyed { data, .. } => data,
        };
        Err(CommsError::SerializationTypeMismatch { expected, found })
    }

    /// Destino por hash entre los destinos ordenados.
    fn pick_destination(&self, hash: u64) -> CommsResult<TaskId> {
        let destinations = self.stages[0].router.destinations();
        let n = destinations.len() as u64;
        if n == 0 {
            return Err(CommsError::InvalidTopology("sin destinos".to_string()));
        }
        destinations
            .iter()
            .nth((hash % n) as usize)
            .copied()
            .ok_or_else(|| CommsError::InvalidTopology("sin destinos".to_string()))
    }

    fn start(&mut self, source: TaskId, route: Route, payload: Payload) -> CommsResult<bool> {
        self.check_source(source)?;
        self.check_shape(&payload)?;
        if self.stages[0].outbound.len() >= self.max_pending {
            return Ok(false);
        }
        let mut work = Work::new();
        let registry = self.registry;
        self.stages[0].route(0, &registry, source, route, &Msg::Data(payload), &mut work)?;
        self.dispatch(work)?;
        Ok(true)
    }

    /// Entrega un valor de `source`. `Ok(false)` = cola llena, reintentar después de progress.
    pub fn send(&mut self, source: TaskId, value: Value) -> CommsResult<bool> {
        match self.kind {
            OperationKind::Partition => {
                let d = self.pick_destination(value.partition_hash())?;
                self.start(source, Route::To(d), Payload::Single(value))
            }
            OperationKind::KeyedReduce => Err(CommsError::InvalidConfig(
                "keyed-reduce recibe pares clave/valor".to_string(),
            )),
            _ => self.start(source, Route::Origin, Payload::Single(value)),
        }
    }

    pub fn send_keyed(&mut self, source: TaskId, pair: KeyValue) -> CommsResult<bool> {
        if self.kind != OperationKind::KeyedReduce {
            return Err(CommsError::InvalidConfig(format!(
                "{:?} no recibe pares clave/valor",
                self.kind
            )));
        }
        let d = self.pick_destination(pair.key.partition_hash())?;
        self.start(source, Route::To(d), Payload::Keyed(pair))
    }

    pub fn send_to(&mut self, source: TaskId, destination: TaskId, value: Value) -> CommsResult<bool> {
        if self.kind != OperationKind::Partition {
            return Err(CommsError::InvalidConfig(format!(
                "{:?} no admite destino explícito",
                self.kind
            )));
        }
        self.start(source, Route::To(destination), Payload::Single(value))
    }

    /// `source` no manda más datos: se propaga el sync.
    pub fn finish(&mut self, source: TaskId) -> CommsResult<()> {
        self.check_source(source)?;
        self.finished_sources.insert(source);
        let mut work = Work::new();
        let registry = self.registry;
        self.stages[0].route(0, &registry, source, Route::Origin, &Msg::Sync, &mut work)?;
        self.dispatch(work)
    }

    /// Un tick: entrada de todos los edges y después la salida. Devuelve si hubo trabajo.
    pub fn progress(&mut self, channel: &mut dyn Channel) -> CommsResult<bool> {
        let registry = self.registry;
        let mut did_work = false;
        for i in 0..self.stages.len() {
            let mut work = Work::new();
            let received = self.stages[i].poll_inbound(i, &registry, channel, &mut work)?;
            did_work |= received > 0;
            self.dispatch(work)?;
        }
        for stage in &mut self.stages {
            did_work |= stage.flush(channel)? > 0;
        }
        Ok(did_work)
    }

    /// Todas las tasks locales terminaron y no queda nada por salir.
    pub fn is_complete(&self) -> bool {
        self.finished_sources.len() == self.local_sources.len()
            && self
                .stages
                .iter()
                .all(|s| s.is_idle() && s.receivers_finished())
    }

    /// Cierre: los mensajes a medio llegar se descartan.
    pub fn drop_incomplete(&mut self, channel: &mut dyn Channel) -> usize {
        let mut dropped = 0;
        for stage in &mut self.stages {
            dropped += stage.assembler.drop_incomplete();
            stage.outbound.clear();
            if let Some((_, buf)) = stage.held.take() {
                channel.send_pool().release(buf);
            }
        }
        if dropped > 0 {
            warn!(
                "contenedor {}: {:?} descartó {} mensajes incompletos",
                self.container, self.kind, dropped
            );
        }
        dropped
    }

    fn dispatch(&mut self, mut work: Work) -> CommsResult<()> {
        let registry = self.registry;
        while let Some((i, task, event)) = work.pop_front() {
            let kind = self.stages[i].router.kind();
            let is_root = self.stages[i].router.root() == Some(task);
            match (kind, event) {
                (RouterKind::Tree, ReceiverEvent::RoundComplete(delivery)) => {
                    let payload = match delivery {
                        Delivery::Item { payload, .. } => payload,
                        other => {
                            return Err(CommsError::InvalidConfig(format!(
                                "broadcast no combina: {other:?}"
                            )))
                        }
                    };
                    // la raíz ya mandó a sus hijos al originar
                    if !is_root {
                        self.stages[i].route(i, &registry, task, Route::Forward, &Msg::Data(payload.clone()), &mut work)?;
                    }
                    if self.stages[i].router.is_destination(task) {
                        self.finalize(i, task, ReceiverEvent::RoundComplete(Delivery::Item {
                            source: task,
                            payload,
                        }), &mut work)?;
                    }
                }
                (RouterKind::Tree, ReceiverEvent::Sync) => {
                    if !is_root {
                        self.stages[i].route(i, &registry, task, Route::Forward, &Msg::Sync, &mut work)?;
                    }
                    if self.stages[i].router.is_destination(task) {
                        self.finalize(i, task, ReceiverEvent::Sync, &mut work)?;
                    }
                }
                (RouterKind::InvertedTree, ReceiverEvent::RoundComplete(delivery)) if !is_root => {
                    let value = match delivery {
                        Delivery::Reduced(v) => v,
                        other => {
                            return Err(CommsError::InvalidConfig(format!(
                                "parcial inesperado: {other:?}"
                            )))
                        }
                    };
                    trace!("parcial de {} hacia su padre", task);
                    self.stages[i].route(i, &registry, task, Route::Forward, &Msg::Data(Payload::Single(value)), &mut work)?;
                }
                (RouterKind::InvertedTree, ReceiverEvent::Sync) if !is_root => {
                    self.stages[i].route(i, &registry, task, Route::Forward, &Msg::Sync, &mut work)?;
                }
                (_, event) => self.finalize(i, task, event, &mut work)?,
            }
        }
        Ok(())
    }

    /// Resultado final de un stage: pasa al siguiente stage desde la raíz, o al sink.
    fn finalize(
        &mut self,
        i: usize,
        task: TaskId,
        event: ReceiverEvent,
        work: &mut Work,
    ) -> CommsResult<()> {
        let registry = self.registry;
        if i + 1 < self.stages.len() {
            let msg = match event {
                ReceiverEvent::RoundComplete(Delivery::Reduced(v)) => Msg::Data(Payload::Single(v)),
                ReceiverEvent::RoundComplete(Delivery::Gathered(items)) => {
                    Msg::Data(Payload::Gathered(items))
                }
                ReceiverEvent::RoundComplete(other) => {
                    return Err(CommsError::InvalidConfig(format!(
                        "no se puede encadenar {other:?}"
                    )))
                }
                ReceiverEvent::Sync => Msg::Sync,
            };
            return self.stages[i + 1].route(i + 1, &registry, task, Route::Origin, &msg, work);
        }

        match event {
            ReceiverEvent::RoundComplete(delivery) => {
                let delivery = self.final_delivery(delivery);
                self.sink.on_round_complete(task, delivery);
            }
            ReceiverEvent::Sync => self.sink.on_sync(task),
        }
        Ok(())
    }

    fn final_delivery(&self, delivery: Delivery) -> Delivery {
        match (self.kind, delivery) {
            (OperationKind::AllReduce, Delivery::Item { payload: Payload::Single(v), .. }) => {
                Delivery::Reduced(v)
            }
            (OperationKind::AllGather, Delivery::Item { payload: Payload::Gathered(items), .. }) => {
                Delivery::Gathered(items)
            }
            (OperationKind::Broadcast, Delivery::Item { payload, .. }) => Delivery::Item {
                source: self.root.unwrap_or_default(),
                payload,
            },
            (_, other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalChannel, LocalFabric};
    use crate::config::CommsConfig;
    use crate::receiver::ReduceOp;

    /// Arma un contenedor por task, todos sobre el mismo fabric.
    struct Cluster {
        channels: BTreeMap<ContainerId, LocalChannel>,
        ops: BTreeMap<ContainerId, Operation>,
        sink: CollectingSink,
    }

    impl Cluster {
        fn new(spec: OperationSpec, config: CommsConfig) -> Self {
            let fabric = LocalFabric::new();
            let plan = OperationBuilder::new().plan(spec).unwrap();
            let tasks = plan.spec.all_tasks();
            let placement: BTreeMap<TaskId, ContainerId> =
                tasks.iter().map(|t| (*t, *t)).collect();
            let sink = CollectingSink::new();
            let mut channels = BTreeMap::new();
            let mut ops = BTreeMap::new();
            for t in &tasks {
                channels.insert(*t, fabric.channel(*t, &config));
                let op = Operation::new(
                    &plan,
                    &placement,
                    *t,
                    PackerRegistry::new(),
                    config.max_pending_sends,
                    Box::new(sink.clone()),
                )
                .unwrap();
                ops.insert(*t, op);
            }
            Self { channels, ops, sink }
        }

        fn op(&mut self, task: TaskId) -> &mut Operation {
            self.ops.get_mut(&task).unwrap()
        }

        fn run(&mut self) {
            for _ in 0..500 {
                for (c, op) in self.ops.iter_mut() {
                    let ch = self.channels.get_mut(c).unwrap();
                    op.progress(ch).unwrap();
                    ch.progress().unwrap();
                }
                if self.ops.values().all(Operation::is_complete) {
                    return;
                }
            }
            panic!("la operación no terminó");
        }
    }

    #[test]
    fn reduce_por_arbol_suma_todo_en_la_raiz() {
        let spec = OperationSpec::new(OperationKind::Reduce, 0..4, [10], DataType::Integer)
            .with_reducer(ReduceOp::Sum)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        for s in 0..4 {
            assert!(cluster.op(s).send(s, Value::Integer(s as i32 + 1)).unwrap());
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        assert_eq!(
            cluster.sink.deliveries_for(10),
            vec![Delivery::Reduced(Value::Integer(10))]
        );
        assert_eq!(cluster.sink.syncs_for(10), 1);
    }

    #[test]
    fn reduce_streaming_cierra_una_ronda_por_iteracion() {
        let spec = OperationSpec::new(OperationKind::Reduce, 0..5, [0], DataType::Long)
            .with_reducer(ReduceOp::Max);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        for round in 0..3i64 {
            for s in 0..5 {
                cluster.op(s).send(s, Value::Long(round * 10 + s as i64)).unwrap();
            }
        }
        for s in 0..5 {
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        assert_eq!(
            cluster.sink.deliveries_for(0),
            vec![
                Delivery::Reduced(Value::Long(4)),
                Delivery::Reduced(Value::Long(14)),
                Delivery::Reduced(Value::Long(24)),
            ]
        );
    }

    #[test]
    fn broadcast_de_tres_nodos_lleva_el_sync_una_vez_a_cada_hoja() {
        let spec = OperationSpec::new(OperationKind::Broadcast, [0], [1, 2], DataType::Text);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        cluster.op(0).send(0, Value::Text("hola".into())).unwrap();
        cluster.op(0).finish(0).unwrap();
        cluster.run();
        for leaf in [1, 2] {
            assert_eq!(cluster.sink.syncs_for(leaf), 1);
            assert_eq!(
                cluster.sink.deliveries_for(leaf),
                vec![Delivery::Item {
                    source: 0,
                    payload: Payload::Single(Value::Text("hola".into()))
                }]
            );
        }
        assert_eq!(cluster.sink.syncs_for(0), 0);
    }

    #[test]
    fn broadcast_profundo_reenvia_por_los_nodos_internos() {
        let spec = OperationSpec::new(OperationKind::Broadcast, [0], 0..9, DataType::Long)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        cluster.op(0).send(0, Value::Long(7)).unwrap();
        cluster.op(0).finish(0).unwrap();
        cluster.run();
        for d in 0..9 {
            assert_eq!(cluster.sink.deliveries_for(d).len(), 1, "destino {d}");
            assert_eq!(cluster.sink.syncs_for(d), 1, "destino {d}");
        }
    }

    #[test]
    fn gather_junta_tres_valores() {
        let spec = OperationSpec::new(OperationKind::Gather, [1, 2, 3], [0], DataType::Integer)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        for s in [3, 1, 2] {
            cluster.op(s).send(s, Value::Integer(s as i32 * 100)).unwrap();
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        match cluster.sink.deliveries_for(0).as_slice() {
            [Delivery::Gathered(items)] => assert_eq!(items.len(), 3),
            other => panic!("esperaba un gather, llegó {other:?}"),
        }
    }

    #[test]
    fn mensaje_grande_viaja_en_varios_buffers() {
        let config = CommsConfig {
            buffer_size: 64,
            ..CommsConfig::default()
        };
        let spec = OperationSpec::new(OperationKind::Gather, [1], [0], DataType::LongArray)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, config);
        let big: Vec<i64> = (0..100).collect();
        cluster.op(1).send(1, Value::LongArray(big.clone())).unwrap();
        cluster.op(1).finish(1).unwrap();
        cluster.run();
        assert_eq!(
            cluster.sink.deliveries_for(0),
            vec![Delivery::Gathered(vec![(1, Value::LongArray(big))])]
        );
    }

    #[test]
    fn mensaje_mas_grande_que_el_pool_de_recepcion() {
        let config = CommsConfig {
            buffer_size: 64,
            send_buffers: 4,
            receive_buffers: 4,
            ..CommsConfig::default()
        };
        let spec = OperationSpec::new(OperationKind::Gather, [1], [0], DataType::LongArray)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, config);
        // 1604 bytes: unos 30 frames contra 4 buffers de recepción
        let big: Vec<i64> = (0..200).collect();
        cluster.op(1).send(1, Value::LongArray(big.clone())).unwrap();
        cluster.op(1).finish(1).unwrap();
        cluster.run();
        assert_eq!(
            cluster.sink.deliveries_for(0),
            vec![Delivery::Gathered(vec![(1, Value::LongArray(big))])]
        );
        let rx = cluster.channels.get_mut(&0).unwrap();
        assert_eq!(rx.receive_pool().available(), 4);
    }

    #[test]
    fn reduce_con_fan_out_tres() {
        let spec = OperationSpec::new(OperationKind::Reduce, 0..8, [20], DataType::Long)
            .with_reducer(ReduceOp::Sum)
            .with_mode(Mode::Batch)
            .with_fan_out(3);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        for s in 0..8 {
            cluster.op(s).send(s, Value::Long(s as i64 + 1)).unwrap();
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        assert_eq!(
            cluster.sink.deliveries_for(20),
            vec![Delivery::Reduced(Value::Long(36))]
        );
        assert_eq!(cluster.sink.syncs_for(20), 1);
    }

    #[test]
    fn all_reduce_entrega_la_suma_en_cada_destino() {
        let spec = OperationSpec::new(OperationKind::AllReduce, 0..4, 0..4, DataType::DoubleArray)
            .with_reducer(ReduceOp::Sum)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        for s in 0..4 {
            cluster.op(s).send(s, Value::DoubleArray(vec![1.0, s as f64])).unwrap();
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        for d in 0..4 {
            assert_eq!(
                cluster.sink.deliveries_for(d),
                vec![Delivery::Reduced(Value::DoubleArray(vec![4.0, 6.0]))],
                "destino {d}"
            );
            assert_eq!(cluster.sink.syncs_for(d), 1);
        }
    }

    #[test]
    fn all_gather_reparte_la_lista_completa() {
        let spec = OperationSpec::new(OperationKind::AllGather, 0..3, 0..3, DataType::Integer)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        for s in 0..3 {
            cluster.op(s).send(s, Value::Integer(s as i32)).unwrap();
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        let expected = vec![
            (0, Value::Integer(0)),
            (1, Value::Integer(1)),
            (2, Value::Integer(2)),
        ];
        for d in 0..3 {
            assert_eq!(
                cluster.sink.deliveries_for(d),
                vec![Delivery::Gathered(expected.clone())]
            );
        }
    }

    #[test]
    fn partition_respeta_el_destino_explicito() {
        let spec = OperationSpec::new(OperationKind::Partition, [0, 1], [2, 3], DataType::Integer);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        cluster.op(0).send_to(0, 3, Value::Integer(5)).unwrap();
        cluster.op(1).send_to(1, 2, Value::Integer(6)).unwrap();
        // por hash: 7 % 2 = 1 -> segundo destino
        cluster.op(1).send(1, Value::Integer(7)).unwrap();
        for s in [0, 1] {
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        assert_eq!(cluster.sink.deliveries_for(3).len(), 2);
        assert_eq!(
            cluster.sink.deliveries_for(2),
            vec![Delivery::Item {
                source: 1,
                payload: Payload::Single(Value::Integer(6))
            }]
        );
        assert_eq!(cluster.sink.syncs_for(2), 1);
        assert_eq!(cluster.sink.syncs_for(3), 1);
    }

    #[test]
    fn keyed_reduce_agrupa_por_clave_en_el_destino_del_hash() {
        let spec = OperationSpec::new(OperationKind::KeyedReduce, [0, 1], [5, 6], DataType::Long)
            .with_key_type(DataType::Integer)
            .with_reducer(ReduceOp::Sum)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        for s in [0, 1] {
            for key in 0..4 {
                let pair = KeyValue::new(Value::Integer(key), Value::Long(1));
                cluster.op(s).send_keyed(s, pair).unwrap();
            }
            cluster.op(s).finish(s).unwrap();
        }
        cluster.run();
        // claves pares al 5, impares al 6
        let keys_at = |d: TaskId| match cluster.sink.deliveries_for(d).as_slice() {
            [Delivery::Keyed(pairs)] => pairs
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect::<Vec<_>>(),
            other => panic!("esperaba pares, llegó {other:?}"),
        };
        assert_eq!(
            keys_at(5),
            vec![
                (Value::Integer(0), Value::Long(2)),
                (Value::Integer(2), Value::Long(2))
            ]
        );
        assert_eq!(
            keys_at(6),
            vec![
                (Value::Integer(1), Value::Long(2)),
                (Value::Integer(3), Value::Long(2))
            ]
        );
    }

    #[test]
    fn cola_llena_aplica_backpressure() {
        let config = CommsConfig {
            max_pending_sends: 2,
            ..CommsConfig::default()
        };
        let spec = OperationSpec::new(OperationKind::Gather, [1], [0], DataType::Integer)
            .with_mode(Mode::Batch);
        let mut cluster = Cluster::new(spec, config);
        assert!(cluster.op(1).send(1, Value::Integer(1)).unwrap());
        assert!(cluster.op(1).send(1, Value::Integer(2)).unwrap());
        assert!(!cluster.op(1).send(1, Value::Integer(3)).unwrap());
        cluster.op(1).finish(1).unwrap();
        cluster.run();
        match cluster.sink.deliveries_for(0).as_slice() {
            [Delivery::Gathered(items)] => assert_eq!(items.len(), 2),
            other => panic!("esperaba un gather, llegó {other:?}"),
        }
    }

    #[test]
    fn errores_de_uso() {
        let spec = OperationSpec::new(OperationKind::Gather, [1], [0], DataType::Integer);
        let mut cluster = Cluster::new(spec, CommsConfig::default());
        assert_eq!(
            cluster.op(1).send(9, Value::Integer(1)),
            Err(CommsError::UnknownSource(9))
        );
        assert!(matches!(
            cluster.op(1).send(1, Value::Long(1)),
            Err(CommsError::SerializationTypeMismatch { .. })
        ));
        assert!(cluster.op(1).send_to(1, 0, Value::Integer(1)).is_err());
        cluster.op(1).finish(1).unwrap();
        assert!(matches!(
            cluster.op(1).send(1, Value::Integer(1)),
            Err(CommsError::MessageAfterFinish { .. })
        ));
    }

    #[test]
    fn spec_invalida_no_se_planifica() {
        let mut builder = OperationBuilder::new();
        let sin_reducer = OperationSpec::new(OperationKind::Reduce, [0, 1], [0], DataType::Integer);
        assert!(builder.plan(sin_reducer).is_err());
        let dos_destinos = OperationSpec::new(OperationKind::Reduce, [0, 1], [0, 1], DataType::Integer)
            .with_reducer(ReduceOp::Sum);
        assert!(builder.plan(dos_destinos).is_err());
        let ok = OperationSpec::new(OperationKind::AllReduce, [0, 1], [0, 1], DataType::Integer)
            .with_reducer(ReduceOp::Sum);
        let plan = builder.plan(ok).unwrap();
        assert_eq!(plan.edges, vec![0, 1]);
        let next = builder
            .plan(OperationSpec::new(OperationKind::Gather, [0], [1], DataType::Byte))
            .unwrap();
        assert_eq!(next.edge(), 2);
    }

    #[test]
    fn nombres_de_operacion_y_modo() {
        assert_eq!("all-reduce".parse::<OperationKind>().unwrap(), OperationKind::AllReduce);
        assert_eq!("keyed_reduce".parse::<OperationKind>().unwrap(), OperationKind::KeyedReduce);
        assert_eq!("Batch".parse::<Mode>().unwrap(), Mode::Batch);
        assert!(matches!(
            "scatter".parse::<OperationKind>(),
            Err(CommsError::InvalidConfig(_))
        ));
    }
}
