//! Structured logging.
//!
//! `RUST_LOG` wins over the configured level when set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directive used when neither `RUST_LOG` nor the config names a level.
pub const DEFAULT_DIRECTIVE: &str = "mesh_sidecar=info";

/// Build the filter for `level`, which is either a bare level (`debug`) or a
/// full directive string (`mesh_sidecar=debug,reqwest=info`).
pub fn filter_for(level: Option<&str>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directive = match level {
        Some(l) if l.contains('=') => l.to_string(),
        Some(l) => format!("mesh_sidecar={},tower_http={}", l, l),
        None => DEFAULT_DIRECTIVE.to_string(),
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber. Safe to call once per process.
pub fn init(level: Option<&str>) {
    tracing_subscriber::registry()
        .with(filter_for(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
