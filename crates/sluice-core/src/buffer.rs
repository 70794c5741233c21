//! Growable byte storage as a queue of fixed-size chunks.
//!
//! Bytes are appended at `write_index` in the tail chunk and consumed from
//! `read_index` in the head chunk. A head chunk is retired only once fully
//! consumed; retired chunks are kept in a small spare pool and handed back
//! out by later writes, so a buffer that cycles through the same amount of
//! data stops allocating.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Default chunk capacity in bytes.
pub const CHUNK_SIZE: usize = 8192;

/// Retired chunks kept for reuse. Extra chunks are freed.
const MAX_SPARE_CHUNKS: usize = 8;

#[derive(Debug)]
pub struct ChunkedBuffer {
    chunk_size: usize,
    chunks: VecDeque<Box<[u8]>>,
    spare: Vec<Box<[u8]>>,
    /// Offset of the next unread byte in the head chunk.
    read_index: usize,
    /// Offset of the next free byte in the tail chunk.
    write_index: usize,
}

impl ChunkedBuffer {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        let mut chunks = VecDeque::new();
        chunks.push_back(vec![0u8; chunk_size].into_boxed_slice());
        Self {
            chunk_size,
            chunks,
            spare: Vec::new(),
            read_index: 0,
            write_index: 0,
        }
    }

    /// Number of readable bytes.
    pub fn count(&self) -> usize {
        (self.chunks.len() - 1) * self.chunk_size + self.write_index - self.read_index
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Live chunks, including a partially filled tail.
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Append `data`, taking a new chunk whenever the tail fills.
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.write_index == self.chunk_size {
                let chunk = self
                    .spare
                    .pop()
                    .unwrap_or_else(|| vec![0u8; self.chunk_size].into_boxed_slice());
                self.chunks.push_back(chunk);
                self.write_index = 0;
            }
            let n = (self.chunk_size - self.write_index).min(data.len());
            let tail = self.chunks.len() - 1;
            self.chunks[tail][self.write_index..self.write_index + n].copy_from_slice(&data[..n]);
            self.write_index += n;
            data = &data[n..];
        }
    }

    /// Copy exactly `dst.len()` bytes out of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is empty or longer than [`count`](Self::count).
    /// Either one means the caller lost track of how much it buffered.
    pub fn read_into(&mut self, dst: &mut [u8]) {
        assert!(!dst.is_empty(), "ChunkedBuffer: zero-length read");
        assert!(
            dst.len() <= self.count(),
            "ChunkedBuffer underflow: requested {} bytes, {} available",
            dst.len(),
            self.count()
        );

        let mut done = 0;
        while done < dst.len() {
            if self.read_index == self.chunk_size {
                self.retire_head();
            }
            let end = if self.chunks.len() == 1 { self.write_index } else { self.chunk_size };
            let n = (end - self.read_index).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&self.chunks[0][self.read_index..self.read_index + n]);
            self.read_index += n;
            done += n;
        }

        if self.read_index == self.chunk_size && self.chunks.len() > 1 {
            self.retire_head();
        }
        if self.chunks.len() == 1 && self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        }
    }

    /// Read `n` bytes into a fresh `Bytes`.
    ///
    /// # Panics
    ///
    /// Same contract as [`read_into`](Self::read_into).
    pub fn read(&mut self, n: usize) -> Bytes {
        let mut out = BytesMut::zeroed(n);
        self.read_into(&mut out);
        out.freeze()
    }

    fn retire_head(&mut self) {
        if let Some(chunk) = self.chunks.pop_front() {
            if self.spare.len() < MAX_SPARE_CHUNKS {
                self.spare.push(chunk);
            }
        }
        self.read_index = 0;
    }
}

impl Default for ChunkedBuffer {
    fn default() -> Self {
        Self::new()
    }
}
