//! Canal sobre el transporte físico.
//!
//! `LocalFabric` conecta contenedores dentro del mismo proceso: cada contenedor
//! tiene un buzón FIFO de frames. Por par (origen, destino) el orden se respeta;
//! entre orígenes distintos no hay orden garantizado.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use common::ContainerId;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferPool, DataBuffer};
use crate::config::CommsConfig;
use crate::error::{CommsError, CommsResult};

pub type EdgeId = u32;

pub trait Channel: Send {
    fn container(&self) -> ContainerId;

    /// Encola un buffer hacia `to`. Si no hay lugar devuelve el buffer para reintentar
    /// en el próximo tick.
    fn send(&mut self, edge: EdgeId, to: ContainerId, buf: DataBuffer) -> Result<(), DataBuffer>;

    /// Próximo buffer recibido completo para `edge`.
    fn receive(&mut self, edge: EdgeId) -> Option<DataBuffer>;

    /// E/S sin bloquear: transmite lo encolado y levanta lo que llegó.
    fn progress(&mut self) -> CommsResult<()>;

    /// Bloquea hasta que llegue algo, se llame a `wakeup`/`close` o venza `timeout`.
    fn wait(&mut self, timeout: Duration) -> CommsResult<()>;

    fn send_pool(&mut self) -> &mut BufferPool;

    fn receive_pool(&mut self) -> &mut BufferPool;

    /// Cierra el canal: lo que estaba por llegar se descarta, no se entrega a medias.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Frame en tránsito; `edge` y `from` hacen de tag del transporte.
#[derive(Debug, Clone)]
struct Envelope {
    edge: EdgeId,
    from: ContainerId,
    frame: Bytes,
}

#[derive(Debug, Default)]
struct Mailboxes {
    queues: HashMap<ContainerId, VecDeque<Envelope>>,
    closed: HashSet<ContainerId>,
    wakeups: HashMap<ContainerId, u64>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<Mailboxes>,
    arrived: Condvar,
}

impl Shared {
    fn lock(&self) -> CommsResult<MutexGuard<'_, Mailboxes>> {
        // un lock envenenado significa que otro hilo del progreso entró en pánico
        self.state.lock().map_err(|_| CommsError::Closed)
    }
}

/// Red en memoria que comparten todos los contenedores de un proceso.
#[derive(Debug, Clone, Default)]
pub struct LocalFabric {
    shared: Arc<Shared>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, container: ContainerId, config: &CommsConfig) -> LocalChannel {
        LocalChannel {
            container,
            shared: self.shared.clone(),
            outgoing: VecDeque::new(),
            max_outgoing: config.send_buffers,
            inbound: HashMap::new(),
            send_pool: BufferPool::new(config.buffer_size, config.send_buffers),
            receive_pool: BufferPool::new(config.buffer_size, config.receive_buffers),
            seen_wakeups: 0,
        }
    }

    /// Frames que esperan en el buzón de un contenedor.
    pub fn pending_for(&self, container: ContainerId) -> usize {
        self.shared
            .lock()
            .map(|m| m.queues.get(&container).map(|q| q.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Handle para despertar o cerrar un canal desde otro hilo.
#[derive(Debug, Clone)]
pub struct WakeHandle {
    container: ContainerId,
    shared: Arc<Shared>,
}

impl WakeHandle {
    pub fn wakeup(&self) {
        if let Ok(mut m) = self.shared.lock() {
            *m.wakeups.entry(self.container).or_insert(0) += 1;
        }
        self.shared.arrived.notify_all();
    }

    pub fn close(&self) {
        if let Ok(mut m) = self.shared.lock() {
            m.closed.insert(self.container);
        }
        self.shared.arrived.notify_all();
    }
}

pub struct LocalChannel {
    container: ContainerId,
    shared: Arc<Shared>,
    outgoing: VecDeque<(EdgeId, ContainerId, DataBuffer)>,
    max_outgoing: usize,
    inbound: HashMap<EdgeId, VecDeque<DataBuffer>>,
    send_pool: BufferPool,
    receive_pool: BufferPool,
    seen_wakeups: u64,
}

impl LocalChannel {
    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle {
            container: self.container,
            shared: self.shared.clone(),
        }
    }

    fn transmit(&mut self) -> CommsResult<usize> {
        if self.outgoing.is_empty() {
            return Ok(0);
        }
        let mut sent = 0;
        {
            let mut boxes = self.shared.lock()?;
            for (edge, to, buf) in self.outgoing.drain(..) {
                let frame = Bytes::copy_from_slice(buf.as_slice());
                boxes.queues.entry(to).or_default().push_back(Envelope {
                    edge,
                    from: self.container,
                    frame,
                });
                self.send_pool.release(buf);
                sent += 1;
            }
        }
        self.shared.arrived.notify_all();
        trace!("contenedor {} transmitió {} buffers", self.container, sent);
        Ok(sent)
    }

    fn collect(&mut self) -> CommsResult<usize> {
        let mut boxes = self.shared.lock()?;
        let Some(queue) = boxes.queues.get_mut(&self.container) else {
            return Ok(0);
        };
        let mut received = 0;
        while self.receive_pool.available() > 0 {
            let Some(env) = queue.pop_front() else {
                break;
            };
            let Some(mut buf) = self.receive_pool.acquire() else {
                queue.push_front(env);
                break;
            };
            if !buf.write(&env.frame) {
                self.receive_pool.release(buf);
                return Err(CommsError::MalformedFrame(format!(
                    "frame de {} bytes desde el contenedor {} excede el buffer",
                    env.frame.len(),
                    env.from
                )));
            }
            self.inbound.entry(env.edge).or_default().push_back(buf);
            received += 1;
        }
        if received > 0 && !queue.is_empty() {
            debug!(
                "contenedor {}: pool de recepción agotado, quedan {} frames en espera",
                self.container,
                queue.len()
            );
        }
        Ok(received)
    }
}

impl Channel for LocalChannel {
    fn container(&self) -> ContainerId {
        self.container
    }

    fn send(&mut self, edge: EdgeId, to: ContainerId, buf: DataBuffer) -> Result<(), DataBuffer> {
        if self.outgoing.len() >= self.max_outgoing || self.is_closed() {
            return Err(buf);
        }
        self.outgoing.push_back((edge, to, buf));
        Ok(())
    }

    fn receive(&mut self, edge: EdgeId) -> Option<DataBuffer> {
        self.inbound.get_mut(&edge)?.pop_front()
    }

    fn progress(&mut self) -> CommsResult<()> {
        if self.is_closed() {
            return Err(CommsError::Closed);
        }
        self.transmit()?;
        self.collect()?;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> CommsResult<()> {
        let shared = self.shared.clone();
        let mut boxes = shared.lock()?;
        loop {
            if boxes.closed.contains(&self.container) {
                return Err(CommsError::Closed);
            }
            let wakeups = boxes.wakeups.get(&self.container).copied().unwrap_or(0);
            if wakeups != self.seen_wakeups {
                self.seen_wakeups = wakeups;
                return Ok(());
            }
            let has_frames = boxes
                .queues
                .get(&self.container)
                .map(|q| !q.is_empty())
                .unwrap_or(false);
            if has_frames {
                return Ok(());
            }
            let (guard, result) = shared
                .arrived
                .wait_timeout(boxes, timeout)
                .map_err(|_| CommsError::Closed)?;
            boxes = guard;
            if result.timed_out() {
                return Ok(());
            }
        }
    }

    fn send_pool(&mut self) -> &mut BufferPool {
        &mut self.send_pool
    }

    fn receive_pool(&mut self) -> &mut BufferPool {
        &mut self.receive_pool
    }

    fn close(&mut self) {
        self.wake_handle().close();
        for (_, _, buf) in self.outgoing.drain(..) {
            self.send_pool.release(buf);
        }
        for (_, queue) in self.inbound.drain() {
            for buf in queue {
                self.receive_pool.release(buf);
            }
        }
        debug!("canal del contenedor {} cerrado", self.container);
    }

    fn is_closed(&self) -> bool {
        match self.shared.lock() {
            Ok(boxes) => boxes.closed.contains(&self.container),
            Err(_) => {
                warn!("lock del fabric envenenado en el contenedor {}", self.container);
                true
            }
        }
    }
}
