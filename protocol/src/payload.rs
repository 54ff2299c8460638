//! Random chunk payloads
//!
//! Throughput phases move incompressible random data so that no link-level
//! compression inflates the measured rate.

use bytes::Bytes;
use rand::RngCore;

/// Generate one random chunk of `size` bytes
pub fn random_chunk(size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// Pool of pre-generated random data that hands out chunks by slicing
///
/// Random data is generated once per pool rather than per stream. Handing a
/// chunk to a WebSocket still copies it, since each frame owns a `Vec<u8>`.
#[derive(Debug, Clone)]
pub struct PayloadPool {
    data: Bytes,
}

impl PayloadPool {
    /// Generate a pool holding `capacity` random bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: random_chunk(capacity),
        }
    }

    /// Largest chunk this pool can serve
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Chunk of `size` bytes, or `None` if it exceeds the pool capacity
    pub fn chunk(&self, size: usize) -> Option<Bytes> {
        if size > self.data.len() {
            return None;
        }
        Some(self.data.slice(0..size))
    }
}
