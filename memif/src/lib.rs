//! # memif
//!
//! Shared-memory packet transport between two processes on the same
//! host. Peers rendezvous over a sequenced-packet unix socket, hand a
//! sealed anonymous memory region and event descriptors across with
//! SCM_RIGHTS, and from then on exchange packets entirely in user
//! space: producers and consumers advance head/tail indices in shared
//! memory rings.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use memif::{FnPortHandler, PortConfig, Socket};
//!
//! let socket = Socket::new("echo-server", None)?;
//! let handler = Arc::new(FnPortHandler::new(
//!     |port| {
//!         println!("connected:\n{port}");
//!         Ok(())
//!     },
//!     |_port| Ok(()),
//! ));
//! let _port = socket.add_port(PortConfig::new(0, "memif0", handler).server(true))?;
//! socket.start_polling();
//! ```
//!
//! After the connected callback runs, grab queues with
//! [`Port::rx_queue`] / [`Port::tx_queue`] and move packets with
//! [`Queue::read_packet`] / [`Queue::write_packet`]. Queue operations
//! never block: back-pressure reads or writes return 0 and may raise
//! the peer's interrupt descriptor instead.
//!
//! ## Crate layout
//!
//! - [`Socket`] - rendezvous endpoint, reactor thread, port registry
//! - [`Port`] - one logical interface with connect/disconnect callbacks
//! - [`Queue`] - the packet fast path over one ring
//! - wire-level layouts and the control codec live in [`memif_core`]

mod control;
mod error;
mod port;
mod queue;
mod region;
mod ring;
mod socket;
mod sys;

pub use error::{MemifError, Result};
pub use port::{role_to_string, FnPortHandler, Port, PortConfig, PortEventHandler};
pub use queue::Queue;
pub use socket::Socket;

pub use memif_core::{MemoryConfig, Secret, DEFAULT_SOCKET_PATH, VERSION};

/// Wire-level layer: ring layouts, control codec, protocol errors.
pub mod core {
    pub use memif_core::*;
}
