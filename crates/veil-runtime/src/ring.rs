//! Bounded blocking byte ring for single-producer / single-consumer pipes.
//!
//! Reads and writes are byte-granular and blocking: `read(out)` waits until
//! at least `out.len()` bytes are buffered, `write(src)` waits until at
//! least `src.len()` bytes of space are free. Each side is serialized by its
//! own gate mutex, so one slow reader blocks other readers (but never the
//! writer, and vice versa).

use std::sync::{Condvar, Mutex, MutexGuard};

/// Offsets and storage, guarded by one mutex shared with the condvar.
struct RingState {
    buffer: Box<[u8]>,
    read_offset: usize,
    write_offset: usize,
    /// Bytes currently readable. Tracked explicitly so a completely full
    /// ring (`read_offset == write_offset`) is distinguishable from an
    /// empty one.
    available: usize,
}

/// A fixed-capacity blocking byte ring buffer.
///
/// # Example
///
/// ```
/// use veil_runtime::ByteRing;
/// use std::sync::Arc;
///
/// let ring = Arc::new(ByteRing::new(64));
/// let writer = ring.clone();
/// let handle = std::thread::spawn(move || {
///     writer.write(b"hello");
/// });
///
/// let mut out = [0u8; 5];
/// ring.read(&mut out);
/// assert_eq!(&out, b"hello");
/// handle.join().unwrap();
/// ```
pub struct ByteRing {
    read_gate: Mutex<()>,
    write_gate: Mutex<()>,
    state: Mutex<RingState>,
    space_changed: Condvar,
}

impl ByteRing {
    /// Create a ring holding up to `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            read_gate: Mutex::new(()),
            write_gate: Mutex::new(()),
            state: Mutex::new(RingState {
                buffer: vec![0u8; capacity].into_boxed_slice(),
                read_offset: 0,
                write_offset: 0,
                available: 0,
            }),
            space_changed: Condvar::new(),
        }
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().expect("ring state poisoned").buffer.len()
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn readable(&self) -> usize {
        self.state.lock().expect("ring state poisoned").available
    }

    /// Free space in bytes.
    #[must_use]
    pub fn writable(&self) -> usize {
        let state = self.state.lock().expect("ring state poisoned");
        state.buffer.len() - state.available
    }

    /// Read exactly `out.len()` bytes, blocking until they are available.
    ///
    /// Readers serialize on a gate mutex held across the wait; a blocked
    /// reader therefore stalls later readers until its request is satisfied.
    ///
    /// # Panics
    ///
    /// Panics if `out.len()` exceeds the ring capacity, since the request could
    /// never be satisfied.
    pub fn read(&self, out: &mut [u8]) {
        let _gate = self.read_gate.lock().expect("read gate poisoned");
        let mut state = self.state.lock().expect("ring state poisoned");
        assert!(
            out.len() <= state.buffer.len(),
            "read of {} bytes exceeds ring capacity {}",
            out.len(),
            state.buffer.len()
        );

        while state.available < out.len() {
            state = self
                .space_changed
                .wait(state)
                .expect("ring state poisoned");
        }

        copy_out(&mut state, out);
        drop(state);
        self.space_changed.notify_all();
    }

    /// Write all of `src`, blocking until enough space is free.
    ///
    /// # Panics
    ///
    /// Panics if `src.len()` exceeds the ring capacity.
    pub fn write(&self, src: &[u8]) {
        let _gate = self.write_gate.lock().expect("write gate poisoned");
        let mut state = self.state.lock().expect("ring state poisoned");
        assert!(
            src.len() <= state.buffer.len(),
            "write of {} bytes exceeds ring capacity {}",
            src.len(),
            state.buffer.len()
        );

        while state.buffer.len() - state.available < src.len() {
            state = self
                .space_changed
                .wait(state)
                .expect("ring state poisoned");
        }

        copy_in(&mut state, src);
        drop(state);
        self.space_changed.notify_all();
    }
}

/// Copy out of the ring, splitting at the wraparound point when needed.
fn copy_out(state: &mut MutexGuard<'_, RingState>, out: &mut [u8]) {
    let capacity = state.buffer.len();
    let tail_len = (capacity - state.read_offset).min(out.len());
    let read_offset = state.read_offset;
    out[..tail_len].copy_from_slice(&state.buffer[read_offset..read_offset + tail_len]);
    if tail_len < out.len() {
        let rest = out.len() - tail_len;
        out[tail_len..].copy_from_slice(&state.buffer[..rest]);
    }
    state.read_offset = (state.read_offset + out.len()) % capacity;
    state.available -= out.len();
}

/// Copy into the ring, splitting at the wraparound point when needed.
fn copy_in(state: &mut MutexGuard<'_, RingState>, src: &[u8]) {
    let capacity = state.buffer.len();
    let tail_len = (capacity - state.write_offset).min(src.len());
    let write_offset = state.write_offset;
    state.buffer[write_offset..write_offset + tail_len].copy_from_slice(&src[..tail_len]);
    if tail_len < src.len() {
        let rest = src.len() - tail_len;
        state.buffer[..rest].copy_from_slice(&src[tail_len..]);
    }
    state.write_offset = (state.write_offset + src.len()) % capacity;
    state.available += src.len();
}
