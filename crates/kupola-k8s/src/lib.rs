//! Cluster access layer for kupola
//!
//! This crate defines the [`ClusterApi`] trait the rest of the system is
//! written against, the error taxonomy that drives recovery policies, and
//! the `kube`-backed implementation used against a real cluster.

mod api;
mod client;
mod convert;
mod error;

pub use api::{ClusterApi, CredentialRefresher, ForwardChannel, LogChannel, ShellChannel};
pub use client::KubeClusterApi;
pub use error::{ApiError, ErrorClass};

// Re-export types that appear in our public API
pub use kupola_types::{
    CronJobSummary, DeploymentSummary, NamespaceSummary, PodSummary, SessionTarget,
    TerminalDimensions,
};
