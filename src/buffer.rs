//! Chunked byte buffers for socket I/O.
//!
//! [`ChunkBuffer`] is a deque of [`Bytes`] chunks with a cached total
//! length: appends never move existing data, prefix removal advances chunk
//! views, and the chunk list maps directly onto the `iovec` arrays used by
//! scatter-gather writes. A `Bytes` chunk carries its own drop, so buffers
//! can adopt externally allocated blocks without copying.

use std::collections::VecDeque;

use bytes::Bytes;

/// Upper bound on iovec entries handed to a single `writev`.
pub const MAX_IOVECS: usize = 1024;

/// A byte sequence stored as a list of chunks.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkBuffer {
    pub fn new() -> ChunkBuffer {
        ChunkBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a copy of `data`.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_back(Bytes::copy_from_slice(data));
    }

    /// Adopts a chunk without copying; the chunk's own drop reclaims it.
    pub fn append_bytes(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Moves all chunks of `other` to the end of this buffer.
    pub fn append_buffer(&mut self, mut other: ChunkBuffer) {
        self.len += other.len;
        self.chunks.append(&mut other.chunks);
        other.len = 0;
    }

    /// Drops the first `n` bytes. Removing more than the buffer holds
    /// empties it.
    pub fn remove_prefix(&mut self, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;
        while n > 0 {
            let front_len = self.chunks[0].len();
            if front_len <= n {
                self.chunks.pop_front();
                n -= front_len;
            } else {
                let front = &mut self.chunks[0];
                *front = front.slice(n..);
                n = 0;
            }
        }
    }

    /// Takes the whole content, leaving this buffer empty.
    pub fn take_all(&mut self) -> ChunkBuffer {
        std::mem::take(self)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Iterates the chunks as byte slices.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|c| c.as_ref())
    }

    pub fn first_chunk(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| c.as_ref())
    }

    /// Copies the content into a single contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// The number of bytes a write pass should cover: the buffer size clamped
/// to the optional cap.
pub fn size_to_write(buf: &ChunkBuffer, cap: Option<usize>) -> usize {
    match cap {
        Some(cap) => cap.min(buf.len()),
        None => buf.len(),
    }
}

/// Builds an iovec view over the buffer, clamped to `cap` bytes, emitting
/// whole or truncated chunks and stopping at the cap. Returns the vector
/// and the number of bytes it covers.
///
/// The iovec entries borrow the buffer's chunks; they must be consumed
/// (passed to `writev`) before the buffer is mutated.
pub fn to_iovec(buf: &ChunkBuffer, cap: usize) -> (Vec<libc::iovec>, usize) {
    let mut iovecs = Vec::new();
    let mut covered = 0usize;
    for chunk in buf.chunks() {
        if covered >= cap || iovecs.len() >= MAX_IOVECS {
            break;
        }
        let take = chunk.len().min(cap - covered);
        iovecs.push(libc::iovec {
            iov_base: chunk.as_ptr() as *mut libc::c_void,
            iov_len: take,
        });
        covered += take;
    }
    (iovecs, covered)
}
