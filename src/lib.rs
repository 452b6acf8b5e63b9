//! Forwarding layer for a reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ http::server ──▶ forward::Forwarder
//!                                                     │
//!                        ┌────────────────────────────┴─────────────┐
//!                        ▼                                          ▼
//!               forward::http                              forward::websocket
//!          (Transport round trip,                    (dial, hijack, raw handshake,
//!           flushed body copy)                        101 check, byte relay)
//!                        │                                          │
//!                        ▼                                          ▼
//!               http::transport ──▶ target ◀── net::dial / forward::redirect
//! ```
//!
//! Cross-cutting: `config` (TOML + validation), `observability` (tracing,
//! Prometheus metrics), `lifecycle` (signals, graceful shutdown).

pub mod config;
pub mod forward;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use forward::{ForwardError, Forwarder, ForwarderOptions};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
