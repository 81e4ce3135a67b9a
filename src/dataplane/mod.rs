//! Proxy configuration store client.
//!
//! # Data Flow
//! ```text
//! Reconciler
//!     → client.rs (begin → staged creates/deletes → commit)
//!     → transport.rs (one request/response round trip)
//!     → HAProxy Data Plane API (or memory.rs for dry runs and tests)
//! ```
//!
//! # Design Decisions
//! - Optimistic concurrency: a transaction is bound to the version it was
//!   opened at, and commit is the only externally visible step
//! - The tracked version changes only on a successful commit or an explicit
//!   refresh

pub mod client;
pub mod memory;
pub mod models;
pub mod transport;
pub mod types;

pub use client::{DataplaneClient, Transaction};
pub use memory::MemoryStore;
pub use transport::{HttpTransport, Transport};
pub use types::{DataplaneError, DataplaneResult, ParentType};
