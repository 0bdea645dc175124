//! Máquina de estados de recepción, una por destino.
//!
//! `INIT -> COLLECTING -> ROUND_COMPLETE -> (COLLECTING | FINISHED)`.
//! La política de combinación decide qué se hace con cada mensaje completo;
//! el modo decide cuándo se cierra una ronda.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use common::TaskId;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::assembler::Payload;
use crate::error::{CommsError, CommsResult};
use crate::packer::{KeyValue, PackerRegistry, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Una ronda = un mensaje de cada id esperado.
    Streaming,
    /// Todo lo que llegue hasta el sync se combina y se entrega una vez.
    Batch,
}

impl std::str::FromStr for Mode {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "streaming" => Ok(Mode::Streaming),
            "batch" => Ok(Mode::Batch),
            other => Err(CommsError::InvalidConfig(format!("modo desconocido: {other}"))),
        }
    }
}

/* =========================
   Funciones de reducción
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
}

impl ReduceOp {
    fn int(self, x: i64, y: i64) -> i64 {
        match self {
            ReduceOp::Sum => x.wrapping_add(y),
            ReduceOp::Product => x.wrapping_mul(y),
            ReduceOp::Min => x.min(y),
            ReduceOp::Max => x.max(y),
        }
    }

    fn float(self, x: f64, y: f64) -> f64 {
        match self {
            ReduceOp::Sum => x + y,
            ReduceOp::Product => x * y,
            ReduceOp::Min => x.min(y),
            ReduceOp::Max => x.max(y),
        }
    }

    fn zip<T: Copy>(
        self,
        a: &[T],
        b: &[T],
        f: impl Fn(T, T) -> T,
    ) -> CommsResult<Vec<T>> {
        if a.len() != b.len() {
            return Err(CommsError::InvalidConfig(format!(
                "{:?} sobre arrays de largo distinto ({} y {})",
                self,
                a.len(),
                b.len()
            )));
        }
        Ok(a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect())
    }

    /// Escalares numéricos del mismo tipo, o arrays numéricos elemento a elemento.
    pub fn apply(self, a: &Value, b: &Value) -> CommsResult<Value> {
        use Value::*;
        let v = match (a, b) {
            (Byte(x), Byte(y)) => Byte(self.int(*x as i64, *y as i64) as u8),
            (Short(x), Short(y)) => Short(self.int(*x as i64, *y as i64) as i16),
            (Integer(x), Integer(y)) => Integer(self.int(*x as i64, *y as i64) as i32),
            (Long(x), Long(y)) => Long(self.int(*x, *y)),
            (Double(x), Double(y)) => Double(self.float(*x, *y)),
            (IntegerArray(x), IntegerArray(y)) => {
                IntegerArray(self.zip(x.as_slice(), y.as_slice(), |p, q| {
                    self.int(p as i64, q as i64) as i32
                })?)
            }
            (LongArray(x), LongArray(y)) => {
                LongArray(self.zip(x.as_slice(), y.as_slice(), |p, q| self.int(p, q))?)
            }
            (DoubleArray(x), DoubleArray(y)) => {
                DoubleArray(self.zip(x.as_slice(), y.as_slice(), |p, q| self.float(p, q))?)
            }
            (x, y) if x.data_type() != y.data_type() => {
                return Err(CommsError::SerializationTypeMismatch {
                    expected: x.data_type(),
                    found: format!("{:?}", y.data_type()),
                })
            }
            (x, _) => {
                return Err(CommsError::InvalidConfig(format!(
                    "{:?} no está definido para {:?}",
                    self,
                    x.data_type()
                )))
            }
        };
        Ok(v)
    }
}

pub type ReduceFn = Arc<dyn Fn(&Value, &Value) -> CommsResult<Value> + Send + Sync>;

/// Función asociativa y conmutativa que combina dos valores.
#[derive(Clone)]
pub enum Reducer {
    Op(ReduceOp),
    Custom(ReduceFn),
}

impl Reducer {
    pub fn custom(f: impl Fn(&Value, &Value) -> CommsResult<Value> + Send + Sync + 'static) -> Self {
        Reducer::Custom(Arc::new(f))
    }

    pub fn apply(&self, a: &Value, b: &Value) -> CommsResult<Value> {
        match self {
            Reducer::Op(op) => op.apply(a, b),
            Reducer::Custom(f) => f(a, b),
        }
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Op(op) => write!(f, "Op({op:?})"),
            Reducer::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl From<ReduceOp> for Reducer {
    fn from(op: ReduceOp) -> Self {
        Reducer::Op(op)
    }
}

#[derive(Debug, Clone)]
pub enum CombinePolicy {
    /// reduce / all-reduce
    Fold(Reducer),
    /// gather / all-gather
    Collect,
    /// broadcast / partition
    PassThrough,
    /// keyed-reduce: un acumulador por clave
    KeyedFold(Reducer),
}

/* =========================
   Eventos
   ========================= */

/// Lo que recibe el sink cuando se cierra una ronda.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Reduced(Value),
    /// Ordenado por origen ascendente.
    Gathered(Vec<(TaskId, Value)>),
    /// Ordenado por clave empaquetada.
    Keyed(Vec<KeyValue>),
    Item { source: TaskId, payload: Payload },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    RoundComplete(Delivery),
    /// Llegó el sync de todos los ids esperados.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Init,
    Collecting,
    RoundComplete,
    Finished,
}

/* =========================
   Receiver
   ========================= */

#[derive(Debug)]
pub struct Receiver {
    destination: TaskId,
    expected: BTreeSet<TaskId>,
    mode: Mode,
    policy: CombinePolicy,
    registry: PackerRegistry,
    state: ReceiverState,
    // streaming: mensajes pendientes por origen, en orden de llegada
    queues: BTreeMap<TaskId, VecDeque<Payload>>,
    accumulator: Option<Value>,
    collected: Vec<(TaskId, Value)>,
    keyed: BTreeMap<Vec<u8>, KeyValue>,
    synced: BTreeSet<TaskId>,
    rounds: u64,
}

impl Receiver {
    pub fn new(
        destination: TaskId,
        expected: BTreeSet<TaskId>,
        mode: Mode,
        policy: CombinePolicy,
        registry: PackerRegistry,
    ) -> CommsResult<Self> {
        if expected.is_empty() {
            return Err(CommsError::InvalidTopology(format!(
                "el destino {destination} no espera a nadie"
            )));
        }
        Ok(Self {
            destination,
            expected,
            mode,
            policy,
            registry,
            state: ReceiverState::Init,
            queues: BTreeMap::new(),
            accumulator: None,
            collected: Vec::new(),
            keyed: BTreeMap::new(),
            synced: BTreeSet::new(),
            rounds: 0,
        })
    }

    pub fn destination(&self) -> TaskId {
        self.destination
    }

    pub fn expected(&self) -> &BTreeSet<TaskId> {
        &self.expected
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds
    }

    pub fn is_finished(&self) -> bool {
        self.state == ReceiverState::Finished
    }

    fn check_source(&self, source: TaskId) -> CommsResult<()> {
        if !self.expected.contains(&source) {
            return Err(CommsError::UnexpectedSource {
                from: source,
                destination: self.destination,
            });
        }
        if self.state == ReceiverState::Finished || self.synced.contains(&source) {
            return Err(CommsError::MessageAfterFinish {
                from: source,
                destination: self.destination,
            });
        }
        Ok(())
    }

    fn begin(&mut self) {
        if matches!(self.state, ReceiverState::Init | ReceiverState::RoundComplete) {
            self.state = ReceiverState::Collecting;
        }
    }

    fn complete(&mut self, delivery: Delivery) -> ReceiverEvent {
        self.rounds += 1;
        self.state = ReceiverState::RoundComplete;
        trace!("destino {} cerró la ronda {}", self.destination, self.rounds);
        ReceiverEvent::RoundComplete(delivery)
    }

    /// Mensaje de datos completo desde `source`.
    pub fn on_message(&mut self, source: TaskId, payload: Payload) -> CommsResult<Vec<ReceiverEvent>> {
        self.check_source(source)?;
        self.begin();

        let policy = self.policy.clone();
        match (policy, self.mode) {
            (CombinePolicy::PassThrough, _) => {
                Ok(vec![self.complete(Delivery::Item { source, payload })])
            }
            (CombinePolicy::KeyedFold(reducer), mode) => {
                let kv = expect_keyed(payload)?;
                let current = self.fold_key(&reducer, kv)?;
                match mode {
                    Mode::Streaming => Ok(vec![self.complete(Delivery::Keyed(vec![current]))]),
                    Mode::Batch => Ok(Vec::new()),
                }
            }
            (policy, Mode::Streaming) => {
                self.queues.entry(source).or_default().push_back(payload);
                self.drain_rounds(&policy)
            }
            (CombinePolicy::Fold(reducer), Mode::Batch) => {
                let value = expect_single(payload)?;
                self.accumulator = Some(match self.accumulator.take() {
                    Some(acc) => reducer.apply(&acc, &value)?,
                    None => value,
                });
                Ok(Vec::new())
            }
            (CombinePolicy::Collect, Mode::Batch) => {
                collect_into(&mut self.collected, source, payload)?;
                Ok(Vec::new())
            }
        }
    }

    /// Token de sincronización desde `source`.
    pub fn on_sync(&mut self, source: TaskId) -> CommsResult<Vec<ReceiverEvent>> {
        self.check_source(source)?;
        self.begin();
        self.synced.insert(source);
        if self.synced != self.expected {
            debug!(
                "destino {}: sync de {} ({}/{})",
                self.destination,
                source,
                self.synced.len(),
                self.expected.len()
            );
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        match self.mode {
            Mode::Batch => {
                if let Some(delivery) = self.take_batch() {
                    events.push(self.complete(delivery));
                }
            }
            Mode::Streaming => {
                let leftover: usize = self.queues.values().map(|q| q.len()).sum();
                if leftover > 0 {
                    warn!(
                        "destino {}: descartando {} mensajes de rondas incompletas",
                        self.destination, leftover
                    );
                }
                self.queues.clear();
            }
        }
        self.state = ReceiverState::Finished;
        events.push(ReceiverEvent::Sync);
        Ok(events)
    }

    fn drain_rounds(&mut self, policy: &CombinePolicy) -> CommsResult<Vec<ReceiverEvent>> {
        let mut events = Vec::new();
        loop {
            let ready = self
                .expected
                .iter()
                .all(|id| self.queues.get(id).map_or(false, |q| !q.is_empty()));
            if !ready {
                return Ok(events);
            }
            let mut round = Vec::with_capacity(self.expected.len());
            for id in &self.expected {
                if let Some(payload) = self.queues.get_mut(id).and_then(|q| q.pop_front()) {
                    round.push((*id, payload));
                }
            }
            let delivery = match policy {
                CombinePolicy::Fold(reducer) => {
                    let mut acc: Option<Value> = None;
                    for (_, payload) in round {
                        let value = expect_single(payload)?;
                        acc = Some(match acc {
                            Some(a) => reducer.apply(&a, &value)?,
                            None => value,
                        });
                    }
                    match acc {
                        Some(v) => Delivery::Reduced(v),
                        None => return Ok(events),
                    }
                }
                CombinePolicy::Collect => {
                    let mut items = Vec::with_capacity(round.len());
                    for (source, payload) in round {
                        collect_into(&mut items, source, payload)?;
                    }
                    Delivery::Gathered(items)
                }
                other => {
                    return Err(CommsError::InvalidConfig(format!(
                        "{other:?} no arma rondas"
                    )))
                }
            };
            events.push(self.complete(delivery));
        }
    }

    fn take_batch(&mut self) -> Option<Delivery> {
        match &self.policy {
            CombinePolicy::Fold(_) => self.accumulator.take().map(Delivery::Reduced),
            CombinePolicy::Collect => {
                if self.collected.is_empty() {
                    return None;
                }
                let mut items = std::mem::take(&mut self.collected);
                // estable: dentro de un origen se respeta el orden de llegada
                items.sort_by_key(|(source, _)| *source);
                Some(Delivery::Gathered(items))
            }
            CombinePolicy::KeyedFold(_) => {
                if self.keyed.is_empty() {
                    return None;
                }
                let map = std::mem::take(&mut self.keyed);
                Some(Delivery::Keyed(map.into_values().collect()))
            }
            CombinePolicy::PassThrough => None,
        }
    }

    fn fold_key(&mut self, reducer: &Reducer, kv: KeyValue) -> CommsResult<KeyValue> {
        let mut packed = BytesMut::new();
        self.registry.pack_value(&kv.key, &mut packed)?;
        let slot = packed.to_vec();
        let folded = match self.keyed.remove(&slot) {
            Some(existing) => KeyValue::new(kv.key, reducer.apply(&existing.value, &kv.value)?),
            None => kv,
        };
        self.keyed.insert(slot, folded.clone());
        Ok(folded)
    }
}

fn expect_single(payload: Payload) -> CommsResult<Value> {
    match payload {
        Payload::Single(v) => Ok(v),
        other => Err(CommsError::SerializationTypeMismatch {
            expected: first_type(&other),
            found: "payload no escalar".to_string(),
        }),
    }
}

fn expect_keyed(payload: Payload) -> CommsResult<KeyValue> {
    match payload {
        Payload::Keyed(kv) => Ok(kv),
        other => Err(CommsError::SerializationTypeMismatch {
            expected: first_type(&other),
            found: "payload sin clave".to_string(),
        }),
    }
}

fn first_type(payload: &Payload) -> crate::packer::DataType {
    match payload {
        Payload::Single(v) => v.data_type(),
        Payload::Keyed(kv) => kv.value.data_type(),
        Payload::Gathered(items) => items
            .first()
            .map(|(_, v)| v.data_type())
            .unwrap_or(crate::packer::DataType::Bytes),
    }
}

fn collect_into(
    items: &mut Vec<(TaskId, Value)>,
    source: TaskId,
    payload: Payload,
) -> CommsResult<()> {
    match payload {
        Payload::Single(v) => items.push((source, v)),
        Payload::Gathered(list) => items.extend(list),
        Payload::Keyed(kv) => {
            return Err(CommsError::SerializationTypeMismatch {
                expected: kv.value.data_type(),
                found: "payload keyed en un gather".to_string(),
            })
        }
    }
    Ok(())
}
