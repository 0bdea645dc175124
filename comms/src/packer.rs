//! Empaquetado de valores tipados sobre bytes.
//!
//! Cada `DataType` se resuelve a un packer sin estado a través de
//! [`PackerRegistry`], que se construye una vez y se comparte por referencia.
//! Los tipos de ancho fijo se escriben tal cual (big-endian); los de longitud
//! variable llevan un prefijo `[len:4]` con los bytes del payload.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CommsError, CommsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Byte,
    Short,
    Integer,
    Long,
    Double,
    Bytes,
    Text,
    IntegerArray,
    LongArray,
    DoubleArray,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
    Text(String),
    IntegerArray(Vec<i32>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Byte(_) => DataType::Byte,
            Value::Short(_) => DataType::Short,
            Value::Integer(_) => DataType::Integer,
            Value::Long(_) => DataType::Long,
            Value::Double(_) => DataType::Double,
            Value::Bytes(_) => DataType::Bytes,
            Value::Text(_) => DataType::Text,
            Value::IntegerArray(_) => DataType::IntegerArray,
            Value::LongArray(_) => DataType::LongArray,
            Value::DoubleArray(_) => DataType::DoubleArray,
        }
    }

    /// Hash estable para particionar por clave. Los enteros se hashean a su
    /// propio valor, así la clave `k` cae en el destino `k % n`.
    pub fn partition_hash(&self) -> u64 {
        match self {
            Value::Byte(v) => *v as u64,
            Value::Short(v) => (*v as i64).rem_euclid(i64::MAX) as u64,
            Value::Integer(v) => (*v as i64).rem_euclid(i64::MAX) as u64,
            Value::Long(v) => v.rem_euclid(i64::MAX) as u64,
            other => {
                // FNV-1a sobre la representación empaquetada
                let mut out = BytesMut::new();
                let _ = PackerRegistry::new().pack_value(other, &mut out);
                out.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
                    (h ^ *b as u64).wrapping_mul(0x0100_0000_01b3)
                })
            }
        }
    }
}

/// Par clave/valor de las operaciones keyed; clave y valor se empaquetan por separado.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: Value,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: Value, value: Value) -> Self {
        Self { key, value }
    }
}

/// Progreso de serialización de un valor lógico hacia uno o más buffers.
#[derive(Debug, Default)]
pub struct SerializeState {
    /// Bytes del valor ya copiados a buffers.
    pub bytes_written: usize,
    /// Bytes de header escritos en el buffer actual.
    pub current_header_length: usize,
    /// Tamaño empaquetado de la clave (0 si no es keyed).
    pub key_size: usize,
    /// Representación empaquetada completa del valor.
    pub encoded: BytesMut,
}

impl SerializeState {
    pub fn total_bytes(&self) -> usize {
        self.encoded.len()
    }

    pub fn pending(&self) -> &[u8] {
        &self.encoded[self.bytes_written..]
    }

    pub fn is_done(&self) -> bool {
        self.bytes_written >= self.encoded.len()
    }
}

pub trait DataPacker: Send + Sync {
    fn data_type(&self) -> DataType;

    /// `Some` para tipos de ancho fijo, `None` para longitud variable.
    fn unit_size(&self) -> Option<usize>;

    /// Agrega el valor empaquetado a `state.encoded`; devuelve los bytes escritos.
    fn pack(&self, value: &Value, state: &mut SerializeState) -> CommsResult<usize>;

    /// Lee un valor desde `bytes[offset..]`; devuelve el valor y los bytes consumidos.
    fn unpack(&self, bytes: &[u8], offset: usize) -> CommsResult<(Value, usize)>;
}

fn mismatch(expected: DataType, found: &Value) -> CommsError {
    CommsError::SerializationTypeMismatch {
        expected,
        found: format!("{:?}", found.data_type()),
    }
}

fn short_read(ty: DataType, needed: usize, available: usize) -> CommsError {
    CommsError::MalformedFrame(format!(
        "{:?}: se necesitan {} bytes, hay {}",
        ty, needed, available
    ))
}

/* =========================
   Packers de ancho fijo
   ========================= */

macro_rules! fixed_packer {
    ($name:ident, $variant:ident, $size:expr, $put:ident, $get:ident) => {
        pub struct $name;

        impl DataPacker for $name {
            fn data_type(&self) -> DataType {
                DataType::$variant
            }

            fn unit_size(&self) -> Option<usize> {
                Some($size)
            }

            fn pack(&self, value: &Value, state: &mut SerializeState) -> CommsResult<usize> {
                match value {
                    Value::$variant(v) => {
                        state.encoded.$put(*v);
                        Ok($size)
                    }
                    other => Err(mismatch(DataType::$variant, other)),
                }
            }

            fn unpack(&self, bytes: &[u8], offset: usize) -> CommsResult<(Value, usize)> {
                let available = bytes.len().saturating_sub(offset);
                if available < $size {
                    return Err(short_read(DataType::$variant, $size, available));
                }
                let mut cur = &bytes[offset..];
                Ok((Value::$variant(cur.$get()), $size))
            }
        }
    };
}

fixed_packer!(BytePacker, Byte, 1, put_u8, get_u8);
fixed_packer!(ShortPacker, Short, 2, put_i16, get_i16);
fixed_packer!(IntegerPacker, Integer, 4, put_i32, get_i32);
fixed_packer!(LongPacker, Long, 8, put_i64, get_i64);
fixed_packer!(DoublePacker, Double, 8, put_f64, get_f64);

/* =========================
   Packers de longitud variable
   ========================= */

/// Lee el prefijo de longitud y devuelve el rango del payload.
fn read_prefixed(ty: DataType, bytes: &[u8], offset: usize) -> CommsResult<&[u8]> {
    let available = bytes.len().saturating_sub(offset);
    if available < 4 {
        return Err(short_read(ty, 4, available));
    }
    let mut cur = &bytes[offset..];
    let len = cur.get_u32() as usize;
    if cur.len() < len {
        return Err(short_read(ty, len, cur.len()));
    }
    Ok(&cur[..len])
}

pub struct BytesPacker;

impl DataPacker for BytesPacker {
    fn data_type(&self) -> DataType {
        DataType::Bytes
    }

    fn unit_size(&self) -> Option<usize> {
        None
    }

    fn pack(&self, value: &Value, state: &mut SerializeState) -> CommsResult<usize> {
        match value {
            Value::Bytes(v) => {
                state.encoded.put_u32(v.len() as u32);
                state.encoded.put_slice(v);
                Ok(4 + v.len())
            }
            other => Err(mismatch(DataType::Bytes, other)),
        }
    }

    fn unpack(&self, bytes: &[u8], offset: usize) -> CommsResult<(Value, usize)> {
        let payload = read_prefixed(DataType::Bytes, bytes, offset)?;
        Ok((Value::Bytes(payload.to_vec()), 4 + payload.len()))
    }
}

pub struct TextPacker;

impl DataPacker for TextPacker {
    fn data_type(&self) -> DataType {
        DataType::Text
    }

    fn unit_size(&self) -> Option<usize> {
        None
    }

    fn pack(&self, value: &Value, state: &mut SerializeState) -> CommsResult<usize> {
        match value {
            Value::Text(s) => {
                state.encoded.put_u32(s.len() as u32);
                state.encoded.put_slice(s.as_bytes());
                Ok(4 + s.len())
            }
            other => Err(mismatch(DataType::Text, other)),
        }
    }

    fn unpack(&self, bytes: &[u8], offset: usize) -> CommsResult<(Value, usize)> {
        let payload = read_prefixed(DataType::Text, bytes, offset)?;
        let text = std::str::from_utf8(payload)
            .map_err(|e| CommsError::MalformedFrame(format!("texto no UTF-8: {e}")))?;
        Ok((Value::Text(text.to_string()), 4 + payload.len()))
    }
}

macro_rules! array_packer {
    ($name:ident, $variant:ident, $elem:expr, $put:ident, $get:ident) => {
        pub struct $name;

        impl DataPacker for $name {
            fn data_type(&self) -> DataType {
                DataType::$variant
            }

            fn unit_size(&self) -> Option<usize> {
                None
            }

            fn pack(&self, value: &Value, state: &mut SerializeState) -> CommsResult<usize> {
                match value {
                    Value::$variant(items) => {
                        let len = items.len() * $elem;
                        state.encoded.put_u32(len as u32);
                        for item in items {
                            state.encoded.$put(*item);
                        }
                        Ok(4 + len)
                    }
                    other => Err(mismatch(DataType::$variant, other)),
                }
            }

            fn unpack(&self, bytes: &[u8], offset: usize) -> CommsResult<(Value, usize)> {
                let mut payload = read_prefixed(DataType::$variant, bytes, offset)?;
                if payload.len() % $elem != 0 {
                    return Err(CommsError::MalformedFrame(format!(
                        "{:?}: longitud {} no es múltiplo de {}",
                        DataType::$variant,
                        payload.len(),
                        $elem
                    )));
                }
                let consumed = 4 + payload.len();
                let mut items = Vec::with_capacity(payload.len() / $elem);
                while payload.has_remaining() {
                    items.push(payload.$get());
                }
                Ok((Value::$variant(items), consumed))
            }
        }
    };
}

array_packer!(IntegerArrayPacker, IntegerArray, 4, put_i32, get_i32);
array_packer!(LongArrayPacker, LongArray, 8, put_i64, get_i64);
array_packer!(DoubleArrayPacker, DoubleArray, 8, put_f64, get_f64);

/* =========================
   Registro
   ========================= */

static BYTE: BytePacker = BytePacker;
static SHORT: ShortPacker = ShortPacker;
static INTEGER: IntegerPacker = IntegerPacker;
static LONG: LongPacker = LongPacker;
static DOUBLE: DoublePacker = DoublePacker;
static BYTES: BytesPacker = BytesPacker;
static TEXT: TextPacker = TextPacker;
static INTEGER_ARRAY: IntegerArrayPacker = IntegerArrayPacker;
static LONG_ARRAY: LongArrayPacker = LongArrayPacker;
static DOUBLE_ARRAY: DoubleArrayPacker = DoubleArrayPacker;

/// Tabla `DataType -> packer`. Sin estado mutable: se arma una vez y se pasa por referencia.
#[derive(Clone, Copy)]
pub struct PackerRegistry {
    packers: [&'static dyn DataPacker; 10],
}

impl fmt::Debug for PackerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.packers.iter().map(|p| p.data_type()))
            .finish()
    }
}

impl Default for PackerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PackerRegistry {
    pub fn new() -> Self {
        Self {
            packers: [
                &BYTE,
                &SHORT,
                &INTEGER,
                &LONG,
                &DOUBLE,
                &BYTES,
                &TEXT,
                &INTEGER_ARRAY,
                &LONG_ARRAY,
                &DOUBLE_ARRAY,
            ],
        }
    }

    pub fn packer(&self, ty: DataType) -> &'static dyn DataPacker {
        self.packers[ty as usize]
    }

    /// Empaqueta un valor con el packer de su propio tipo.
    pub fn pack_value(&self, value: &Value, out: &mut BytesMut) -> CommsResult<usize> {
        let mut state = SerializeState {
            encoded: std::mem::take(out),
            ..SerializeState::default()
        };
        let n = self.packer(value.data_type()).pack(value, &mut state);
        *out = state.encoded;
        n
    }

    /// Empaqueta clave y valor uno detrás del otro; registra el tamaño de la clave.
    pub fn pack_keyed(
        &self,
        key_type: DataType,
        data_type: DataType,
        kv: &KeyValue,
        state: &mut SerializeState,
    ) -> CommsResult<usize> {
        let key_size = self.packer(key_type).pack(&kv.key, state)?;
        state.key_size = key_size;
        let value_size = self.packer(data_type).pack(&kv.value, state)?;
        Ok(key_size + value_size)
    }

    pub fn unpack_keyed(
        &self,
        key_type: DataType,
        data_type: DataType,
        bytes: &[u8],
        offset: usize,
    ) -> CommsResult<(KeyValue, usize)> {
        let (key, key_size) = self.packer(key_type).unpack(bytes, offset)?;
        let (value, value_size) = self.packer(data_type).unpack(bytes, offset + key_size)?;
        Ok((KeyValue { key, value }, key_size + value_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let registry = PackerRegistry::new();
        let packer = registry.packer(value.data_type());
        let mut state = SerializeState::default();
        let written = packer.pack(&value, &mut state).unwrap();
        assert_eq!(written, state.total_bytes());
        if let Some(unit) = packer.unit_size() {
            assert_eq!(written, unit);
        }

        let (back, consumed) = packer.unpack(&state.encoded, 0).unwrap();
        assert_eq!(back, value);
        assert_eq!(consumed, written);
    }

    #[test]
    fn roundtrip_de_cada_tipo_soportado() {
        roundtrip(Value::Byte(0xAB));
        roundtrip(Value::Short(-1234));
        roundtrip(Value::Integer(i32::MIN));
        roundtrip(Value::Long(i64::MAX));
        roundtrip(Value::Double(-0.125));
        roundtrip(Value::Bytes(vec![1, 2, 3]));
        roundtrip(Value::Text("hola mundo".to_string()));
        roundtrip(Value::IntegerArray(vec![1, -2, 3]));
        roundtrip(Value::LongArray(vec![]));
        roundtrip(Value::DoubleArray(vec![1.5, 2.5]));
    }

    #[test]
    fn packer_con_tipo_equivocado_falla() {
        let registry = PackerRegistry::new();
        let mut state = SerializeState::default();
        let err = registry
            .packer(DataType::Long)
            .pack(&Value::Text("x".into()), &mut state)
            .unwrap_err();
        assert!(matches!(
            err,
            CommsError::SerializationTypeMismatch {
                expected: DataType::Long,
                ..
            }
        ));
        assert_eq!(state.total_bytes(), 0);
    }

    #[test]
    fn unpack_con_offset_y_datos_cortos() {
        let registry = PackerRegistry::new();
        let mut state = SerializeState::default();
        registry
            .packer(DataType::Integer)
            .pack(&Value::Integer(7), &mut state)
            .unwrap();
        registry
            .packer(DataType::Integer)
            .pack(&Value::Integer(9), &mut state)
            .unwrap();

        let (v, n) = registry
            .packer(DataType::Integer)
            .unpack(&state.encoded, 4)
            .unwrap();
        assert_eq!((v, n), (Value::Integer(9), 4));

        assert!(registry
            .packer(DataType::Long)
            .unpack(&state.encoded, 4)
            .is_err());
    }

    #[test]
    fn keyed_registra_tamano_de_clave() {
        let registry = PackerRegistry::new();
        let kv = KeyValue::new(Value::Text("abc".into()), Value::IntegerArray(vec![1, 2]));
        let mut state = SerializeState::default();
        let total = registry
            .pack_keyed(DataType::Text, DataType::IntegerArray, &kv, &mut state)
            .unwrap();
        assert_eq!(state.key_size, 7);
        assert_eq!(total, 7 + 12);

        let (back, consumed) = registry
            .unpack_keyed(DataType::Text, DataType::IntegerArray, &state.encoded, 0)
            .unwrap();
        assert_eq!(back, kv);
        assert_eq!(consumed, total);
    }

    #[test]
    fn array_con_longitud_rota_es_malformado() {
        let mut raw = BytesMut::new();
        raw.put_u32(3);
        raw.put_slice(&[0, 0, 0]);
        let err = IntegerArrayPacker.unpack(&raw, 0).unwrap_err();
        assert!(matches!(err, CommsError::MalformedFrame(_)));
    }

    #[test]
    fn hash_de_enteros_es_su_valor() {
        assert_eq!(Value::Integer(5).partition_hash(), 5);
        assert_eq!(Value::Long(12).partition_hash() % 4, 0);
        let a = Value::Text("k".into()).partition_hash();
        let b = Value::Text("k".into()).partition_hash();
        assert_eq!(a, b);
    }
}
