//! Browser-facing session types.
//!
//! The transport (websocket today) lives in the HTTP layer; this module only
//! defines what the gateway needs from a session and how sessions are tracked.

pub mod registry;
pub mod scheme;
pub mod session;

pub use registry::SessionRegistry;
pub use scheme::{OriginSchemeInference, SchemeInference};
pub use session::{BrowserSession, ChannelSession, SessionClosed};
