//! Cluster access trait and the channel types it hands out.
//!
//! The managers and the watch engine are written against [`ClusterApi`]
//! rather than a concrete client so tests can inject an in-memory fake
//! and so no component reaches for a process-wide singleton.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use kupola_types::{
    CronJobSummary, DeploymentSummary, NamespaceSummary, PodSummary, SessionTarget,
    TerminalDimensions,
};

use crate::error::ApiError;

/// Bidirectional byte channel into an interactive remote shell.
pub struct ShellChannel {
    /// Write side of the remote stdin.
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read side of the remote tty output.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Forwards terminal dimension changes to the remote tty.
    pub resize: mpsc::Sender<TerminalDimensions>,
    /// Cancelling tears the remote channel down. Idempotent.
    pub cancel: CancellationToken,
}

/// Followed log tail from one container.
pub struct LogChannel {
    /// Raw log bytes as streamed by the cluster.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Cancelling stops the stream. Idempotent.
    pub cancel: CancellationToken,
}

/// Handle for a running local-port-to-pod-port forward.
pub struct ForwardChannel {
    /// Cancelling stops the listener and every open connection. Idempotent.
    pub cancel: CancellationToken,
    /// Resolves when the forward has fully shut down. `Err` means the
    /// forward died on its own rather than being cancelled.
    pub done: oneshot::Receiver<Result<(), ApiError>>,
}

/// Synchronous-looking request/response access to one cluster.
///
/// Snapshot fetchers take a namespace set; an empty set means all
/// namespaces. Every method may suspend the caller.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self, namespaces: &[String]) -> Result<Vec<PodSummary>, ApiError>;

    async fn list_deployments(
        &self,
        namespaces: &[String],
    ) -> Result<Vec<DeploymentSummary>, ApiError>;

    async fn list_cron_jobs(&self, namespaces: &[String])
    -> Result<Vec<CronJobSummary>, ApiError>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceSummary>, ApiError>;

    /// Whether the pod currently exists. A 404 is `Ok(false)`, not an error.
    async fn pod_exists(&self, namespace: &str, pod: &str) -> Result<bool, ApiError>;

    /// Start `/bin/sh` in the target container with a tty sized to `dims`.
    async fn open_shell(
        &self,
        target: &SessionTarget,
        dims: TerminalDimensions,
    ) -> Result<ShellChannel, ApiError>;

    /// Follow the container log with a bounded tail.
    async fn open_log_stream(
        &self,
        target: &SessionTarget,
        tail_lines: i64,
    ) -> Result<LogChannel, ApiError>;

    /// Copy a file out of the container.
    async fn read_file(&self, target: &SessionTarget, path: &str) -> Result<Vec<u8>, ApiError>;

    /// Copy a file into the container.
    async fn write_file(
        &self,
        target: &SessionTarget,
        path: &str,
        data: &[u8],
    ) -> Result<(), ApiError>;

    /// Start forwarding a local port to a container port.
    ///
    /// The listener is bound before this returns, so a bind failure
    /// surfaces here rather than on first use.
    async fn forward_port(
        &self,
        namespace: &str,
        pod: &str,
        container_port: u16,
        local_port: u16,
    ) -> Result<ForwardChannel, ApiError>;
}

/// Refreshes expired cluster credentials.
///
/// Injected into the failure coordinator so a 401-class failure can be
/// resolved without surfacing an error to the user.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), ApiError>;
}
