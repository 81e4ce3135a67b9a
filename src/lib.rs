//! Service-mesh sidecar control loop for an HAProxy data plane.

pub mod admin;
pub mod config;
pub mod dataplane;
pub mod lifecycle;
pub mod mesh;
pub mod observability;
pub mod reconciler;
pub mod snapshot;
pub mod watcher;

pub use config::SidecarConfig;
pub use lifecycle::Shutdown;
pub use reconciler::Reconciler;
pub use snapshot::Snapshot;
pub use watcher::Watcher;
