//! Byte and operation counters for a transport.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Thread-safe transfer counters, exposed read-only on the transport.
///
/// `avg_read_speed` is externally settable: the transport cannot know the
/// consumer's pacing, so higher layers that measure it (for example a bulk
/// receiver timing its pulls) publish the figure here.
#[derive(Debug, Default)]
pub struct DataMetrics {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    /// Bits of an `f32`, in bytes per second.
    avg_read_speed: AtomicU32,
}

impl DataMetrics {
    /// Record one raw read of `n` bytes.
    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one raw write of `n` bytes.
    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes read since the last [`reset`](Self::reset).
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written since the last [`reset`](Self::reset).
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Number of raw read operations.
    #[must_use]
    pub fn read_ops(&self) -> u64 {
        self.read_ops.load(Ordering::Relaxed)
    }

    /// Number of raw write operations.
    #[must_use]
    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Relaxed)
    }

    /// Publish an externally measured average read speed in bytes/second.
    pub fn set_avg_read_speed(&self, speed: f32) {
        self.avg_read_speed.store(speed.to_bits(), Ordering::Relaxed);
    }

    /// Last published average read speed in bytes/second.
    #[must_use]
    pub fn avg_read_speed(&self) -> f32 {
        f32::from_bits(self.avg_read_speed.load(Ordering::Relaxed))
    }

    /// Zero the byte counters. Operation counters and the published read
    /// speed are left untouched.
    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}
