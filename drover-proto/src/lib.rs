//! # drover-proto
//!
//! Wire protocol implementation for drover.
//!
//! This crate provides:
//! - The box message type (a flat string-keyed, byte-valued mapping)
//! - Binary framing with big-endian length prefixes
//! - Transport abstraction over TCP sockets and in-process duplex pipes
//! - A buffered box-level channel (`Wire`) plus a spooled variant with a
//!   background reader task
//! - Ask-token RPC correlation on top of the wire

pub mod error;
pub mod frame;
pub mod message;
pub mod rpc;
pub mod spool;
pub mod transport;
pub mod wire;

pub use error::{ErrTag, ProtocolError};
pub use message::Message;
pub use rpc::{CallError, CallTable, RemoteFault, Rpc};
pub use spool::SpooledWire;
pub use transport::{local_pair, BoxedTransport, Transport};
pub use wire::Wire;

/// Protocol version announced by slaves during registration.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port the master listens on.
pub const DEFAULT_PORT: u16 = 7511;

/// Maximum length of a box key in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Maximum length of a box value in bytes.
pub const MAX_VALUE_LEN: usize = 65535;

/// Chunk size used by streaming operations (one value per box).
pub const CHUNK_SIZE: usize = MAX_VALUE_LEN;
