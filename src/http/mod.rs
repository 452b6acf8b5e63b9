//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! client TCP connection
//!     → server.rs (keep-alive loop, limits, request ID, target URI)
//!     → conn.rs (request heads in, framed responses out, hijack)
//!     → forwarding layer
//!         → transport.rs (pooled upstream client for plain HTTP)
//!         → codec.rs (raw request out, bounded response capture in)
//! ```

pub mod codec;
pub mod conn;
pub mod request;
pub mod server;
pub mod sink;
pub mod transport;

pub use request::X_REQUEST_ID;
pub use server::{HttpServer, ServerError};
pub use sink::ResponseSink;
