//! # VEIL Transport
//!
//! Byte-oriented encrypted transport over TCP.
//!
//! This crate provides:
//! - [`SecureTransport`]: a blocking TCP stream with block-cipher framed
//!   `read_secure` / `write_secure` on top of raw counted I/O
//! - The session handshake state machine (version/magic exchange plus the
//!   hybrid RSA/AES key setup)
//! - [`Acceptor`]: a listener that runs the server handshake and hands
//!   established transports to a user session function
//! - [`DataMetrics`]: byte and operation counters per transport
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Acceptor                         │
//! │   (listener, long-lived keypair, session threads)     │
//! ├───────────────────────────────────────────────────────┤
//! │                   SecureTransport                     │
//! │   (counted raw I/O + in-place block-cipher framing)   │
//! ├───────────────────────────────────────────────────────┤
//! │                        TCP                            │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! A session key lives for the whole connection and frames are encrypted
//! block-by-block without authentication. That is the wire contract this crate
//! implements, not a general security recommendation.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod acceptor;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod secure;

pub use acceptor::{Acceptor, AcceptorConfig, SessionErrorHandler, SessionHandler};
pub use error::{HandshakeError, TransportError};
pub use handshake::{SessionHello, SessionHelloReply, ECHO_LEN, HANDSHAKE_MAGIC};
pub use metrics::DataMetrics;
pub use secure::SecureTransport;
