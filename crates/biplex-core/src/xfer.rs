//! Transfer pipe: ordered byte transforms applied to the serialized body.
//!
//! Filters are registered globally under a single-byte id. A message's
//! pipe applies its filters left-to-right when packing and in reverse when
//! unpacking; the id list travels on the wire so the receiver can mirror
//! the order.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::status::Status;

/// Hard cap on a decompressed body, aligned with the frame size limit to
/// keep decompression bombs from allocating unbounded memory.
pub const MAX_UNPACK_SIZE: usize = crate::proto::MAX_MESSAGE_SIZE;

/// A single byte transform (compression, encryption, checksum).
pub trait XferFilter: Send + Sync + 'static {
    /// The wire id.
    fn id(&self) -> u8;
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;
    /// Transforms the body on the send path.
    fn pack(&self, data: &[u8]) -> Result<Vec<u8>, Status>;
    /// Reverses [`XferFilter::pack`] on the receive path.
    fn unpack(&self, data: &[u8]) -> Result<Vec<u8>, Status>;
}

fn registry() -> &'static RwLock<HashMap<u8, Arc<dyn XferFilter>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<u8, Arc<dyn XferFilter>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<u8, Arc<dyn XferFilter>> = HashMap::new();
        let lz4: Arc<dyn XferFilter> = Arc::new(Lz4Filter);
        let zstd: Arc<dyn XferFilter> = Arc::new(ZstdFilter::default());
        map.insert(lz4.id(), lz4);
        map.insert(zstd.id(), zstd);
        RwLock::new(map)
    })
}

/// Registers a filter. Re-registering an id replaces the previous filter.
pub fn register(filter: Arc<dyn XferFilter>) {
    let id = filter.id();
    let prev = registry().write().insert(id, filter);
    if prev.is_some() {
        tracing::warn!(id, "transfer filter id re-registered");
    }
}

/// Looks a filter up by id.
pub fn get(id: u8) -> Option<Arc<dyn XferFilter>> {
    registry().read().get(&id).cloned()
}

/// An ordered list of transfer filter ids attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XferPipe {
    ids: Vec<u8>,
}

impl XferPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends filter ids, rejecting any id with no registered filter.
    pub fn append(&mut self, ids: &[u8]) -> Result<(), Status> {
        for &id in ids {
            if get(id).is_none() {
                return Err(Status::bad_message(format!(
                    "unknown transfer filter id: {id}"
                )));
            }
            self.ids.push(id);
        }
        Ok(())
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn reset(&mut self) {
        self.ids.clear();
    }

    /// Restores a pipe from wire ids, validating each one.
    pub fn from_wire(ids: &[u8]) -> Result<Self, Status> {
        let mut pipe = Self::new();
        pipe.append(ids)?;
        Ok(pipe)
    }

    /// Applies the filters left-to-right.
    pub fn on_pack(&self, body: Vec<u8>) -> Result<Vec<u8>, Status> {
        let mut data = body;
        for &id in &self.ids {
            let filter =
                get(id).ok_or_else(|| Status::bad_message(format!("unknown transfer filter id: {id}")))?;
            data = filter.pack(&data)?;
        }
        Ok(data)
    }

    /// Applies the filters right-to-left, mirroring [`XferPipe::on_pack`].
    pub fn on_unpack(&self, body: Vec<u8>) -> Result<Vec<u8>, Status> {
        let mut data = body;
        for &id in self.ids.iter().rev() {
            let filter =
                get(id).ok_or_else(|| Status::bad_message(format!("unknown transfer filter id: {id}")))?;
            data = filter.unpack(&data)?;
        }
        Ok(data)
    }
}

/// LZ4 block compression with a length prefix.
pub struct Lz4Filter;

impl XferFilter for Lz4Filter {
    fn id(&self) -> u8 {
        b'l'
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn pack(&self, data: &[u8]) -> Result<Vec<u8>, Status> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn unpack(&self, data: &[u8]) -> Result<Vec<u8>, Status> {
        if data.len() < 4 {
            return Err(Status::bad_message("lz4 body shorter than size prefix"));
        }
        // The claimed size is validated before lz4 allocates for it.
        let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if claimed > MAX_UNPACK_SIZE {
            return Err(Status::bad_message(format!(
                "lz4 body claims {claimed} bytes, limit is {MAX_UNPACK_SIZE}"
            )));
        }
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Status::bad_message(format!("lz4 unpack: {e}")))
    }
}

/// Zstd streaming compression.
pub struct ZstdFilter {
    level: i32,
}

impl ZstdFilter {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdFilter {
    fn default() -> Self {
        Self { level: 1 }
    }
}

impl XferFilter for ZstdFilter {
    fn id(&self) -> u8 {
        b'z'
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn pack(&self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut out = Vec::new();
        zstd::stream::copy_encode(data, &mut out, self.level)
            .map_err(|e| Status::bad_message(format!("zstd pack: {e}")))?;
        Ok(out)
    }

    fn unpack(&self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut decoder = zstd::stream::Decoder::new(data)
            .map_err(|e| Status::bad_message(format!("zstd unpack: {e}")))?;
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        // Chunked reads so the output cap applies before allocation.
        loop {
            match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    if out.len() > MAX_UNPACK_SIZE {
                        return Err(Status::bad_message(format!(
                            "zstd body exceeds the {MAX_UNPACK_SIZE} byte limit"
                        )));
                    }
                }
                Err(e) => return Err(Status::bad_message(format!("zstd unpack: {e}"))),
            }
        }
        Ok(out)
    }
}
