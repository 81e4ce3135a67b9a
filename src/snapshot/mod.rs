//! Desired proxy state.
//!
//! # Data Flow
//! ```text
//! watcher state (locked)
//!     → Snapshot (built under one lock acquisition)
//!     → snapshot channel
//!     → reconciler (read-only)
//! ```
//!
//! # Design Decisions
//! - Snapshots are plain values; no shared mutation after construction
//! - Endpoint lists compare as sets, so iteration order never causes churn

pub mod types;

pub use types::{CaPool, Downstream, Snapshot, TlsMaterial, Upstream, UpstreamEndpoint};
