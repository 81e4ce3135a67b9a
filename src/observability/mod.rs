//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! watcher + reconciler produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (log aggregation)
//!     → metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
