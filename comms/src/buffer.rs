use tracing::warn;

/// Buffer de bytes de capacidad fija: la unidad de E/S de red.
///
/// `read_pos <= write_pos <= capacity` siempre. Las escrituras son todo o nada:
/// si no entra, `write` devuelve false y no toca el contenido.
#[derive(Debug)]
pub struct DataBuffer {
    data: Box<[u8]>,
    write_pos: usize,
    read_pos: usize,
}

impl DataBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes libres para escribir.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.write_pos
    }

    /// Bytes escritos que todavía no se leyeron.
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if self.remaining() < bytes.len() {
            return false;
        }
        let end = self.write_pos + bytes.len();
        self.data[self.write_pos..end].copy_from_slice(bytes);
        self.write_pos = end;
        true
    }

    pub fn write_u8(&mut self, v: u8) -> bool {
        self.write(&[v])
    }

    pub fn write_u32(&mut self, v: u32) -> bool {
        self.write(&v.to_be_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> bool {
        self.write(&v.to_be_bytes())
    }

    /// Sobrescribe 4 bytes ya escritos (p.ej. la longitud del payload del frame).
    pub fn put_u32_at(&mut self, pos: usize, v: u32) -> bool {
        if pos + 4 > self.write_pos {
            return false;
        }
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
        true
    }

    pub fn read(&mut self, n: usize) -> Option<&[u8]> {
        if self.readable() < n {
            return None;
        }
        let start = self.read_pos;
        self.read_pos += n;
        Some(&self.data[start..start + n])
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Some(u32::from_be_bytes(raw))
    }

    /// Lo escrito hasta ahora.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.write_pos]
    }

    /// Lo que queda por leer, sin avanzar `read_pos`.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0;
    }
}

/// Pool de buffers de tamaño fijo. Un buffer fuera del pool tiene un único dueño
/// (el mensaje en vuelo que lo usa) y vuelve con `release`.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<DataBuffer>,
    buffer_size: usize,
    total: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, count: usize) -> Self {
        let free = (0..count).map(|_| DataBuffer::new(buffer_size)).collect();
        Self {
            free,
            buffer_size,
            total: count,
        }
    }

    pub fn acquire(&mut self) -> Option<DataBuffer> {
        self.free.pop()
    }

    pub fn release(&mut self, mut buffer: DataBuffer) {
        if buffer.capacity() != self.buffer_size || self.free.len() >= self.total {
            warn!(
                "buffer ajeno devuelto al pool (capacidad {}), se descarta",
                buffer.capacity()
            );
            return;
        }
        buffer.clear();
        self.free.push(buffer);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
