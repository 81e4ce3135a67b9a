//! Mesh control-plane integration.
//!
//! # Data Flow
//! ```text
//! Consul agent HTTP API
//!     → client.rs (blocking queries, cursors from response headers)
//!     → types.rs (decoded registrations, CA roots, leaf, health entries)
//!     → health.rs (health entries → weighted endpoints)
//! ```
//!
//! # Design Decisions
//! - The watcher depends on the `ControlPlane` trait, never on HTTP directly
//! - Health aggregation is a pure function of the returned checks

pub mod client;
pub mod health;
pub mod types;

pub use client::{ConsulClient, ControlPlane};
pub use types::{MeshError, MeshResult, QueryMeta, QueryOptions};
