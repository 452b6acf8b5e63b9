//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound:
//!     listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking for graceful shutdown)
//!     → hand off to the HTTP layer
//!
//! Outbound:
//!     dial.rs (raw dials and request-writing dials toward the target)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each client connection tracked for graceful shutdown
//! - Outbound connections are boxed byte streams so tests can dial in-memory pipes

pub mod connection;
pub mod dial;
pub mod listener;
