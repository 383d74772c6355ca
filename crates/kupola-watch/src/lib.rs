//! Polling watch engine and failure coordination for kupola
//!
//! Turns the cluster's pull-based list API into incremental
//! change-notification streams, and coordinates the global reaction to
//! connectivity loss and credential expiry across every active stream.

mod coordinator;
mod detector;
mod engine;

pub use coordinator::FailureCoordinator;
pub use detector::snapshots_equal;
pub use engine::{WatchEvent, WatchStreamEngine, WatchSubscription};

// Re-export types that appear in our public API
pub use kupola_k8s::{ApiError, ErrorClass};
pub use kupola_types::{ResourceIdentity, Watchable};
