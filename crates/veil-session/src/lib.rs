//! # VEIL Session
//!
//! Typed, length-prefixed packet sessions over the secure transport.
//!
//! This crate provides:
//! - [`Session`]: the managed packet engine with pipelined send/receive
//!   stages, per-type receive queues with callback dispatch, ordered
//!   send-completion tracking, and a built-in keep-alive reply
//! - [`Packet`], [`PacketHeader`], [`PacketFlags`]: the 16-byte framed
//!   wire unit
//! - [`PacketBuffer`]: the reference-counted payload region the pipeline
//!   stages share
//!
//! ## Architecture
//!
//! ```text
//! push ─► [crypt stage] ─► [send stage] ─► transport ─► TCP
//!                                             │
//!             TCP ─► transport ─► [recv stage]┴─► [crypt stage]
//!                                     │                 │
//!             [callback stage] ◄──────┴── type queues ◄─┘
//!                                              │
//!                                     pull / pullable
//! ```
//!
//! Each stage is a single-worker pool, which is what gives the engine its
//! per-session ordering guarantees.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod packet;
pub mod session;

pub use buffer::{PacketBuffer, CHUNK_SIZE};
pub use packet::{packet_type, Packet, PacketFlags, PacketHeader, PacketId, PacketType};
pub use session::{RecvCallback, SentCallback, Session};
