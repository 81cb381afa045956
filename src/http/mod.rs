//! Browser-facing HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP request
//!     → server.rs (Axum router, tracing layer)
//!     → /alive, /message/types          (static replies)
//!     → /ws → websocket.rs              (browser session ↔ gateway)
//!     → /test/peer-message (debug only) (connection pool → peer relay)
//! ```

pub mod server;
pub mod websocket;

pub use server::{build_router, AppState, HttpServer};
