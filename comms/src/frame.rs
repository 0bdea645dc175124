//! Formato de frame en el cable.
//!
//! Cada buffer arranca con `[source:4][destination:4][flags:1][payloadLength:4]`
//! (big-endian). El primer buffer de un mensaje además empieza su payload con
//! `[messageLength:4]`, el total de bytes del mensaje sin contar ese prefijo.

use common::TaskId;

use crate::buffer::DataBuffer;
use crate::error::{CommsError, CommsResult};

pub const FRAME_HEADER_LEN: usize = 13;
pub const MESSAGE_LENGTH_PREFIX: usize = 4;

/// Offset de `payloadLength` dentro del header.
const PAYLOAD_LENGTH_OFFSET: usize = 9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// El mensaje sigue en otro buffer.
    pub const HAS_MORE: Flags = Flags(0x01);
    /// Token de sincronización: sin datos, marca fin de datos en el edge.
    pub const SYNC: Flags = Flags(0x02);
    /// Último buffer del mensaje.
    pub const LAST: Flags = Flags(0x04);

    pub fn empty() -> Self {
        Flags(0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> CommsResult<Self> {
        if bits & !0x07 != 0 {
            return Err(CommsError::MalformedFrame(format!("flags desconocidos: {bits:#04x}")));
        }
        Ok(Flags(bits))
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }

    pub fn without(self, other: Flags) -> Self {
        Flags(self.0 & !other.0)
    }
}

/// Header lógico de un mensaje completo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub source: TaskId,
    pub destination: TaskId,
    pub flags: Flags,
    /// Bytes totales del mensaje repartidos entre todos sus buffers.
    pub length: u32,
}

impl MessageHeader {
    pub fn data(source: TaskId, destination: TaskId, length: u32) -> Self {
        Self {
            source,
            destination,
            flags: Flags::empty(),
            length,
        }
    }

    pub fn sync(source: TaskId, destination: TaskId) -> Self {
        Self {
            source,
            destination,
            flags: Flags::SYNC,
            length: 0,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(Flags::SYNC)
    }
}

/// Header por buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub source: TaskId,
    pub destination: TaskId,
    pub flags: Flags,
    pub payload_length: u32,
}

impl FrameHeader {
    /// Escribe el header con `payload_length` tal cual; se corrige con `patch_payload_length`.
    pub fn write(&self, buf: &mut DataBuffer) -> bool {
        if buf.remaining() < FRAME_HEADER_LEN {
            return false;
        }
        buf.write_u32(self.source)
            && buf.write_u32(self.destination)
            && buf.write_u8(self.flags.bits())
            && buf.write_u32(self.payload_length)
    }

    pub fn read(buf: &mut DataBuffer) -> CommsResult<FrameHeader> {
        if buf.readable() < FRAME_HEADER_LEN {
            return Err(CommsError::MalformedFrame(format!(
                "buffer de {} bytes no alcanza para el header",
                buf.readable()
            )));
        }
        let malformed = || CommsError::MalformedFrame("header truncado".to_string());
        let source = buf.read_u32().ok_or_else(malformed)?;
        let destination = buf.read_u32().ok_or_else(malformed)?;
        let flags = Flags::from_bits(buf.read_u8().ok_or_else(malformed)?)?;
        let payload_length = buf.read_u32().ok_or_else(malformed)?;
        if payload_length as usize != buf.readable() {
            return Err(CommsError::MalformedFrame(format!(
                "payloadLength={} pero el buffer trae {} bytes",
                payload_length,
                buf.readable()
            )));
        }
        Ok(FrameHeader {
            source,
            destination,
            flags,
            payload_length,
        })
    }

    /// Ajusta `payloadLength` del header que empieza en `start` según lo escrito después.
    pub fn patch_payload_length(buf: &mut DataBuffer, start: usize) -> bool {
        let payload = buf.write_pos() - (start + FRAME_HEADER_LEN);
        buf.put_u32_at(start + PAYLOAD_LENGTH_OFFSET, payload as u32)
    }
}
