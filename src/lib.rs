//! Execution relay library.
//!
//! Bridges browser sessions and compute workers over a length-prefixed
//! protobuf protocol, and meshes relay instances to each other over TLS.

pub mod browser;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod relay;

pub use config::schema::RelayConfig;
pub use lifecycle::Shutdown;
pub use protocol::Message;
pub use relay::{Relay, RelayError};
