//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → CLI overrides (main.rs)
//!     → validation.rs (semantic checks)
//!     → SidecarConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - All fields have defaults so a sidecar can start from flags alone
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, ConsulConfig, DataplaneConfig, HaproxyConfig, ObservabilityConfig, SidecarConfig,
};
