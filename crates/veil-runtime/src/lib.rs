//! # VEIL Runtime
//!
//! Threading primitives shared by the VEIL transport stack.
//!
//! This crate provides:
//! - [`WorkerPool`]: a fixed-size pool of worker threads draining a FIFO of
//!   queued jobs, with ticket-based completion waits
//! - [`ByteRing`]: a bounded, blocking, byte-granular ring buffer for
//!   single-producer / single-consumer pipelines
//!
//! Both primitives coordinate through condition variables rather than async
//! tasks: the transport's pipeline stages are long-running jobs that block on
//! socket I/O, so plain threads are the natural substrate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod pool;
pub mod ring;

pub use pool::{Ticket, WorkerPool};
pub use ring::ByteRing;
