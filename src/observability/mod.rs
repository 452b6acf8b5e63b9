//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! forward paths, server, connector produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through log fields
//! - Metric updates are cheap and no-ops until an exporter is installed

pub mod logging;
pub mod metrics;
