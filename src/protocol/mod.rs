//! Wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Message (typed)
//!     → codec.rs encode (protobuf payload)
//!     → codec.rs frame  (4-byte big-endian length + payload)
//!     → socket
//!
//! socket
//!     → 4-byte header → N payload bytes
//!     → codec.rs decode (protobuf parse + variant validation)
//!     → Message (typed)
//! ```
//!
//! # Design Decisions
//! - No magic number or version byte; both ends share the schema in message.rs
//! - The message type table is a compile-time constant, not discovered at startup
//! - The same `Message` doubles as the browser JSON shape via serde

pub mod codec;
pub mod message;

pub use codec::{DecodeError, FrameError};
pub use message::{message_types_json, ExecuteCode, Message, MessageType, Output};
