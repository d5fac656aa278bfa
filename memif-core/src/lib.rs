//! # memif-core
//!
//! Wire-level layer for the memif shared-memory packet transport.
//!
//! This crate is OS-free and owns everything two peers must agree on
//! byte-for-byte:
//! - [`ring`] - ring header and descriptor layouts in shared memory
//! - [`control`] - the fixed 128-byte control message codec
//! - [`types`] - protocol version, cookie, defaults, memory layout math
//! - [`error`] - the protocol error taxonomy with stable reason strings
//!
//! The transport itself (sockets, shared memory, the reactor) lives in
//! the `memif` crate.

pub mod control;
pub mod error;
pub mod ring;
pub mod types;

pub use control::{ControlMsg, MsgKind, MSG_SIZE};
pub use error::{Error, Result};
pub use ring::{Desc, RingHdr, DESC_FLAG_NEXT, DESC_SIZE, RING_FLAG_MASK_INT, RING_HDR_SIZE};
pub use types::{
    MemoryConfig, PortMode, RingDirection, Secret, COOKIE, DEFAULT_SOCKET_PATH, VERSION,
};
