//! Reference-counted payload buffers.
//!
//! A [`PacketBuffer`] is a shared mutable byte region with a logical size
//! and a chunk-rounded capacity. Clones share the same storage; the last
//! holder frees it. The pipeline stages cipher payloads in place through
//! the same region the user filled, so a buffer handed to `push` must not
//! be reused by the sender afterwards.

use std::sync::{Arc, RwLock, RwLockWriteGuard};

/// Allocation granule. Capacities round up to a multiple of this, which is
/// itself a multiple of the cipher block size, so in-place padding never
/// reallocates.
pub const CHUNK_SIZE: usize = 2048;

/// Storage plus logical length. Exposed crate-internally so the pipeline
/// stages can cipher the region in place and adjust the length.
pub(crate) struct RawBuffer {
    pub(crate) data: Box<[u8]>,
    pub(crate) len: usize,
}

/// A reference-counted mutable byte region.
#[derive(Clone)]
pub struct PacketBuffer {
    inner: Arc<RwLock<RawBuffer>>,
}

impl PacketBuffer {
    /// Allocate a buffer with logical size `size` and capacity rounded up
    /// to the next [`CHUNK_SIZE`] multiple.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RawBuffer {
                data: vec![0u8; chunk_rounded(size)].into_boxed_slice(),
                len: size,
            })),
        }
    }

    /// Allocate a buffer holding a copy of `src`.
    #[must_use]
    pub fn from_slice(src: &[u8]) -> Self {
        let buffer = Self::new(src.len());
        buffer.write(src, 0);
        buffer
    }

    /// Logical size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.read().expect("buffer lock poisoned").len
    }

    /// Reserved capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.read().expect("buffer lock poisoned").data.len()
    }

    /// Change the logical size.
    ///
    /// Within the current capacity this only adjusts the length. Growing
    /// past the capacity allocates a fresh chunk-rounded region and does
    /// **not** preserve the old contents.
    pub fn resize(&self, new_size: usize) {
        let mut raw = self.inner.write().expect("buffer lock poisoned");
        if new_size <= raw.data.len() {
            raw.len = new_size;
        } else {
            raw.data = vec![0u8; chunk_rounded(new_size)].into_boxed_slice();
            raw.len = new_size;
        }
    }

    /// Copy `dst.len()` bytes out of the buffer starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + dst.len()` exceeds the logical size.
    pub fn read(&self, dst: &mut [u8], offset: usize) {
        let raw = self.inner.read().expect("buffer lock poisoned");
        assert!(
            offset + dst.len() <= raw.len,
            "read of {} bytes at {offset} exceeds buffer size {}",
            dst.len(),
            raw.len
        );
        dst.copy_from_slice(&raw.data[offset..offset + dst.len()]);
    }

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + src.len()` exceeds the logical size.
    pub fn write(&self, src: &[u8], offset: usize) {
        let mut raw = self.inner.write().expect("buffer lock poisoned");
        assert!(
            offset + src.len() <= raw.len,
            "write of {} bytes at {offset} exceeds buffer size {}",
            src.len(),
            raw.len
        );
        raw.data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copy the logical contents out as a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let raw = self.inner.read().expect("buffer lock poisoned");
        raw.data[..raw.len].to_vec()
    }

    /// Exclusive access to the full capacity region for in-place cipher
    /// work.
    pub(crate) fn raw(&self) -> RwLockWriteGuard<'_, RawBuffer> {
        self.inner.write().expect("buffer lock poisoned")
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn chunk_rounded(size: usize) -> usize {
    size.div_ceil(CHUNK_SIZE) * CHUNK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_chunks() {
        assert_eq!(PacketBuffer::new(0).capacity(), 0);
        assert_eq!(PacketBuffer::new(1).capacity(), CHUNK_SIZE);
        assert_eq!(PacketBuffer::new(CHUNK_SIZE).capacity(), CHUNK_SIZE);
        assert_eq!(PacketBuffer::new(CHUNK_SIZE + 1).capacity(), 2 * CHUNK_SIZE);
    }

    #[test]
    fn read_write_round_trip() {
        let buffer = PacketBuffer::new(16);
        buffer.write(b"0123456789abcdef", 0);

        let mut out = [0u8; 6];
        buffer.read(&mut out, 10);
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn resize_within_capacity_is_non_destructive() {
        let buffer = PacketBuffer::from_slice(b"payload");
        buffer.resize(4);
        assert_eq!(buffer.size(), 4);
        assert_eq!(buffer.capacity(), CHUNK_SIZE);

        buffer.resize(7);
        assert_eq!(buffer.to_vec(), b"payload");
    }

    #[test]
    fn growth_reallocates_without_preserving() {
        let buffer = PacketBuffer::from_slice(b"gone");
        buffer.resize(CHUNK_SIZE + 1);
        assert_eq!(buffer.size(), CHUNK_SIZE + 1);
        assert_eq!(buffer.capacity(), 2 * CHUNK_SIZE);
        assert_eq!(&buffer.to_vec()[..4], &[0u8; 4]);
    }

    #[test]
    fn clones_share_storage() {
        let buffer = PacketBuffer::new(8);
        let alias = buffer.clone();
        alias.write(b"shared!!", 0);
        assert_eq!(buffer.to_vec(), b"shared!!");
    }

    #[test]
    #[should_panic(expected = "exceeds buffer size")]
    fn out_of_range_read_panics() {
        let buffer = PacketBuffer::new(4);
        let mut out = [0u8; 8];
        buffer.read(&mut out, 0);
    }
}
