//! Paso de valores tipados a buffers (envío) y de buffers a valores (recepción).

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::TaskId;
use tracing::trace;

use crate::buffer::{BufferPool, DataBuffer};
use crate::error::{CommsError, CommsResult};
use crate::frame::{Flags, FrameHeader, MessageHeader, FRAME_HEADER_LEN, MESSAGE_LENGTH_PREFIX};
use crate::packer::{DataType, KeyValue, PackerRegistry, SerializeState, Value};

/// Forma del payload que viaja por un edge; la fija la operación al construirse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Single(DataType),
    Keyed { key: DataType, data: DataType },
    /// Lista `(origen, valor)` que arma un gather y redistribuye el broadcast del all-gather.
    Gathered(DataType),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Value),
    Keyed(KeyValue),
    Gathered(Vec<(TaskId, Value)>),
}

impl Payload {
    fn describe(&self) -> String {
        match self {
            Payload::Single(v) => format!("{:?}", v.data_type()),
            Payload::Keyed(kv) => format!("({:?}, {:?})", kv.key.data_type(), kv.value.data_type()),
            Payload::Gathered(_) => "Gathered".to_string(),
        }
    }
}

fn shape_mismatch(shape: PayloadShape, payload: &Payload) -> CommsError {
    let expected = match shape {
        PayloadShape::Single(t) | PayloadShape::Gathered(t) => t,
        PayloadShape::Keyed { data, .. } => data,
    };
    CommsError::SerializationTypeMismatch {
        expected,
        found: payload.describe(),
    }
}

pub fn encode_payload(
    registry: &PackerRegistry,
    shape: PayloadShape,
    payload: &Payload,
    state: &mut SerializeState,
) -> CommsResult<usize> {
    match (shape, payload) {
        (PayloadShape::Single(ty), Payload::Single(v)) => registry.packer(ty).pack(v, state),
        (PayloadShape::Keyed { key, data }, Payload::Keyed(kv)) => {
            registry.pack_keyed(key, data, kv, state)
        }
        (PayloadShape::Gathered(ty), Payload::Gathered(items)) => {
            let packer = registry.packer(ty);
            state.encoded.put_u32(items.len() as u32);
            let mut written = 4;
            for (source, value) in items {
                state.encoded.put_u32(*source);
                written += 4 + packer.pack(value, state)?;
            }
            Ok(written)
        }
        (shape, payload) => Err(shape_mismatch(shape, payload)),
    }
}

pub fn decode_payload(
    registry: &PackerRegistry,
    shape: PayloadShape,
    bytes: &[u8],
) -> CommsResult<Payload> {
    let (payload, consumed) = match shape {
        PayloadShape::Single(ty) => {
            let (v, n) = registry.packer(ty).unpack(bytes, 0)?;
            (Payload::Single(v), n)
        }
        PayloadShape::Keyed { key, data } => {
            let (kv, n) = registry.unpack_keyed(key, data, bytes, 0)?;
            (Payload::Keyed(kv), n)
        }
        PayloadShape::Gathered(ty) => {
            if bytes.len() < 4 {
                return Err(CommsError::MalformedFrame("gather sin contador".to_string()));
            }
            let packer = registry.packer(ty);
            let count = (&bytes[..4]).get_u32() as usize;
            let mut offset = 4;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                if bytes.len() < offset + 4 {
                    return Err(CommsError::MalformedFrame("gather truncado".to_string()));
                }
                let source = (&bytes[offset..offset + 4]).get_u32();
                let (v, n) = packer.unpack(bytes, offset + 4)?;
                items.push((source, v));
                offset += 4 + n;
            }
            (Payload::Gathered(items), offset)
        }
    };
    if consumed != bytes.len() {
        return Err(CommsError::MalformedFrame(format!(
            "sobran {} bytes después del payload",
            bytes.len() - consumed
        )));
    }
    Ok(payload)
}

/* =========================
   Envío
   ========================= */

/// Mensaje saliente ya empaquetado, que se va volcando en buffers de a uno.
#[derive(Debug)]
pub struct OutMessage {
    pub header: MessageHeader,
    state: SerializeState,
    started: bool,
}

impl OutMessage {
    pub fn data(
        registry: &PackerRegistry,
        shape: PayloadShape,
        source: TaskId,
        destination: TaskId,
        payload: &Payload,
    ) -> CommsResult<Self> {
        let mut state = SerializeState::default();
        let length = encode_payload(registry, shape, payload, &mut state)?;
        Ok(Self {
            header: MessageHeader::data(source, destination, length as u32),
            state,
            started: false,
        })
    }

    pub fn sync(source: TaskId, destination: TaskId) -> Self {
        Self {
            header: MessageHeader::sync(source, destination),
            state: SerializeState::default(),
            started: false,
        }
    }

    /// Vuelca en `buf` todo lo que entra. Devuelve `Ok(true)` si este fue el último buffer.
    pub fn fill_next(&mut self, buf: &mut DataBuffer) -> CommsResult<bool> {
        let prefix = if self.started { 0 } else { MESSAGE_LENGTH_PREFIX };
        let overhead = FRAME_HEADER_LEN + prefix;
        if buf.remaining() < overhead {
            return Err(CommsError::BufferOverflow {
                needed: overhead,
                remaining: buf.remaining(),
            });
        }

        let room = buf.remaining() - overhead;
        let pending = self.state.total_bytes() - self.state.bytes_written;
        let chunk = pending.min(room);
        let last = chunk == pending;

        let flags = if last {
            self.header.flags.with(Flags::LAST)
        } else {
            self.header.flags.with(Flags::HAS_MORE)
        };

        let start = buf.write_pos();
        let frame = FrameHeader {
            source: self.header.source,
            destination: self.header.destination,
            flags,
            payload_length: (prefix + chunk) as u32,
        };
        frame.write(buf);
        self.state.current_header_length = FRAME_HEADER_LEN;
        if !self.started {
            buf.write_u32(self.header.length);
            self.state.current_header_length += MESSAGE_LENGTH_PREFIX;
            self.started = true;
        }
        let from = self.state.bytes_written;
        buf.write(&self.state.encoded[from..from + chunk]);
        self.state.bytes_written += chunk;
        FrameHeader::patch_payload_length(buf, start);

        trace!(
            "buffer {}->{} con {} bytes (hasMore={})",
            self.header.source,
            self.header.destination,
            chunk,
            !last
        );
        Ok(last)
    }

    pub fn is_done(&self) -> bool {
        self.started && self.state.is_done()
    }
}

/* =========================
   Recepción
   ========================= */

/// Mensaje recibido entero, todavía sin decodificar.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

/// Mensaje a medio llegar. Los bytes se copian al llegar cada frame y el buffer
/// vuelve al pool enseguida, así un mensaje puede ocupar más que el pool entero.
#[derive(Debug)]
struct InFlightMessage {
    header: MessageHeader,
    payload: BytesMut,
}

impl InFlightMessage {
    fn received(&self) -> usize {
        self.payload.len()
    }

    fn is_complete(&self) -> bool {
        self.received() == self.header.length as usize
    }
}

/// Rearma mensajes a partir de buffers, uno en vuelo por par (origen, destino).
#[derive(Debug, Default)]
pub struct Assembler {
    in_flight: HashMap<(TaskId, TaskId), InFlightMessage>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega un buffer recibido y lo devuelve al pool. Cuando el mensaje queda
    /// completo devuelve sus bytes.
    pub fn on_buffer(
        &mut self,
        mut buf: DataBuffer,
        pool: &mut BufferPool,
    ) -> CommsResult<Option<ReceivedMessage>> {
        let frame = match FrameHeader::read(&mut buf) {
            Ok(frame) => frame,
            Err(e) => {
                pool.release(buf);
                return Err(e);
            }
        };
        let key = (frame.source, frame.destination);

        if !self.in_flight.contains_key(&key) {
            let Some(length) = buf.read_u32() else {
                pool.release(buf);
                return Err(CommsError::MalformedFrame(
                    "primer buffer sin longitud de mensaje".to_string(),
                ));
            };
            let header = MessageHeader {
                source: frame.source,
                destination: frame.destination,
                flags: frame.flags.without(Flags::HAS_MORE).without(Flags::LAST),
                length,
            };
            self.in_flight.insert(
                key,
                InFlightMessage {
                    header,
                    payload: BytesMut::with_capacity(length as usize),
                },
            );
        }

        let Some(msg) = self.in_flight.get_mut(&key) else {
            pool.release(buf);
            return Ok(None);
        };
        msg.payload.put_slice(buf.unread());
        pool.release(buf);

        let declared = msg.header.length as usize;
        let has_more = frame.flags.contains(Flags::HAS_MORE);
        let broken = msg.received() > declared
            || (msg.is_complete() && has_more)
            || (!msg.is_complete() && !has_more);

        if broken {
            let received = self.remove(key).map(|m| m.received()).unwrap_or(0);
            return Err(CommsError::MalformedFrame(format!(
                "mensaje {}->{}: declarados {} bytes, recibidos {} (hasMore={})",
                key.0, key.1, declared, received, has_more
            )));
        }

        if !msg.is_complete() {
            return Ok(None);
        }

        let Some(msg) = self.remove(key) else {
            return Ok(None);
        };
        Ok(Some(ReceivedMessage {
            header: msg.header,
            payload: msg.payload.freeze(),
        }))
    }

    fn remove(&mut self, key: (TaskId, TaskId)) -> Option<InFlightMessage> {
        self.in_flight.remove(&key)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Descarta los mensajes incompletos (cierre): no se entregan a medias.
    pub fn drop_incomplete(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        dropped
    }
}
