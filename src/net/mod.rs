//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound peer connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (server handshake, inside the per-connection task)
//!     → framed.rs (length-prefixed messages, idle supervision)
//!     → MessageHandler (peer dispatcher)
//!
//! Outbound peer connection
//!     → pool.rs (lookup by host:port, lazy eviction)
//!     → tls.rs (client handshake, shared-CA verification)
//!     → framed.rs
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection owns its own state; nothing is shared between sockets
//! - TLS is optional and handled transparently

pub mod connection;
pub mod framed;
pub mod listener;
pub mod pool;
pub mod tls;

pub use connection::{ConnectionId, ConnectionTracker};
pub use framed::{CloseReason, ConnectionError, FrameOptions, FramedConnection, MessageHandler};
pub use listener::{ListenerError, RelayListener};
pub use pool::{ConnectionPool, PeerConnector, PoolError};
