//! Size-bucketed scratch pool for per-block working state.
//!
//! Block work units are bounded (area at most 4096) but numerous, so the
//! per-coefficient state arrays are recycled through a pool keyed by buffer
//! length. Buffers are loaned out through [`ScratchBuf`], return on drop,
//! and are zeroed lazily on the next acquire. Each bucket caps its cache so
//! a burst of odd-sized blocks cannot pin memory.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

const MAX_CACHED_PER_BUCKET: usize = 8;

/// Shared pool of recycled byte buffers, keyed by length.
#[derive(Debug, Clone, Default)]
pub struct ScratchPool {
    buckets: Arc<Mutex<HashMap<usize, Vec<Vec<u8>>>>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loan a zeroed buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> ScratchBuf {
        let recycled = self
            .buckets
            .lock()
            .ok()
            .and_then(|mut map| map.get_mut(&len).and_then(Vec::pop));
        let buf = match recycled {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; len],
        };
        ScratchBuf {
            buf,
            pool: Some(self.clone()),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        if let Ok(mut map) = self.buckets.lock() {
            let bucket = map.entry(buf.len()).or_default();
            if bucket.len() < MAX_CACHED_PER_BUCKET {
                bucket.push(buf);
            }
        }
    }

    /// Number of buffers currently cached for `len`.
    pub fn cached(&self, len: usize) -> usize {
        self.buckets
            .lock()
            .ok()
            .map_or(0, |map| map.get(&len).map_or(0, Vec::len))
    }
}

/// An exclusive loan of a pool buffer; returns to its pool on drop.
#[derive(Debug)]
pub struct ScratchBuf {
    buf: Vec<u8>,
    pool: Option<ScratchPool>,
}

impl ScratchBuf {
    /// A plain zeroed buffer that belongs to no pool.
    pub fn detached(len: usize) -> Self {
        Self {
            buf: vec![0u8; len],
            pool: None,
        }
    }
}

impl Deref for ScratchBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for ScratchBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}
