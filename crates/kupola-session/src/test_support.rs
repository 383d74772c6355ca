//! In-memory `ClusterApi` for exercising the managers without a cluster.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use kupola_k8s::{
    ApiError, ClusterApi, ForwardChannel, LogChannel, ShellChannel,
};
use kupola_types::{
    CronJobSummary, DeploymentSummary, NamespaceSummary, PodSummary, SessionTarget,
    TerminalDimensions,
};

/// Test-side handles for one opened shell channel.
pub struct ShellEnds {
    /// Reads whatever the session wrote to the remote stdin.
    pub written: DuplexStream,
    /// Writes bytes that appear as remote shell output.
    pub feed: DuplexStream,
    /// Receives terminal dimensions forwarded by the session.
    pub resize_rx: mpsc::Receiver<TerminalDimensions>,
    pub cancel: CancellationToken,
    pub opened_with: TerminalDimensions,
}

pub struct LogEnds {
    /// Writes bytes that appear as streamed log output.
    pub feed: DuplexStream,
    pub cancel: CancellationToken,
}

pub struct ForwardEnds {
    pub cancel: CancellationToken,
    /// Trip to simulate the backing forward dying on its own.
    pub die: CancellationToken,
}

#[derive(Default)]
pub struct MockClusterApi {
    pub pod_exists: AtomicBool,
    pub shells_opened: AtomicUsize,
    pub logs_opened: AtomicUsize,
    pub forwards_opened: AtomicUsize,
    pub fail_forward: AtomicBool,
    shells: Mutex<Vec<ShellEnds>>,
    logs: Mutex<Vec<LogEnds>>,
    forwards: Mutex<Vec<ForwardEnds>>,
}

impl MockClusterApi {
    pub fn new(pod_exists: bool) -> Self {
        let api = Self::default();
        api.pod_exists.store(pod_exists, Ordering::SeqCst);
        api
    }

    /// Hand over the oldest not-yet-taken shell channel ends.
    pub fn take_shell(&self) -> ShellEnds {
        self.shells.lock().remove(0)
    }

    pub fn take_log(&self) -> LogEnds {
        self.logs.lock().remove(0)
    }

    pub fn take_forward(&self) -> ForwardEnds {
        self.forwards.lock().remove(0)
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn list_pods(&self, _namespaces: &[String]) -> Result<Vec<PodSummary>, ApiError> {
        Ok(Vec::new())
    }

    async fn list_deployments(
        &self,
        _namespaces: &[String],
    ) -> Result<Vec<DeploymentSummary>, ApiError> {
        Ok(Vec::new())
    }

    async fn list_cron_jobs(
        &self,
        _namespaces: &[String],
    ) -> Result<Vec<CronJobSummary>, ApiError> {
        Ok(Vec::new())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceSummary>, ApiError> {
        Ok(Vec::new())
    }

    async fn pod_exists(&self, _namespace: &str, _pod: &str) -> Result<bool, ApiError> {
        Ok(self.pod_exists.load(Ordering::SeqCst))
    }

    async fn open_shell(
        &self,
        _target: &SessionTarget,
        dims: TerminalDimensions,
    ) -> Result<ShellChannel, ApiError> {
        self.shells_opened.fetch_add(1, Ordering::SeqCst);
        let (stdin_w, stdin_r) = tokio::io::duplex(4096);
        let (stdout_w, stdout_r) = tokio::io::duplex(4096);
        let (resize_tx, resize_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        self.shells.lock().push(ShellEnds {
            written: stdin_r,
            feed: stdout_w,
            resize_rx,
            cancel: cancel.clone(),
            opened_with: dims,
        });
        Ok(ShellChannel {
            input: Box::new(stdin_w),
            output: Box::new(stdout_r),
            resize: resize_tx,
            cancel,
        })
    }

    async fn open_log_stream(
        &self,
        _target: &SessionTarget,
        _tail_lines: i64,
    ) -> Result<LogChannel, ApiError> {
        self.logs_opened.fetch_add(1, Ordering::SeqCst);
        let (out_w, out_r) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        self.logs.lock().push(LogEnds {
            feed: out_w,
            cancel: cancel.clone(),
        });
        Ok(LogChannel {
            output: Box::new(out_r),
            cancel,
        })
    }

    async fn read_file(&self, _target: &SessionTarget, _path: &str) -> Result<Vec<u8>, ApiError> {
        Err(ApiError::Other("not supported by mock".to_string()))
    }

    async fn write_file(
        &self,
        _target: &SessionTarget,
        _path: &str,
        _data: &[u8],
    ) -> Result<(), ApiError> {
        Err(ApiError::Other("not supported by mock".to_string()))
    }

    async fn forward_port(
        &self,
        _namespace: &str,
        _pod: &str,
        _container_port: u16,
        _local_port: u16,
    ) -> Result<ForwardChannel, ApiError> {
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(ApiError::Other("forward refused".to_string()));
        }
        self.forwards_opened.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let die = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let task_cancel = cancel.clone();
        let task_die = die.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    let _ = done_tx.send(Ok(()));
                }
                _ = task_die.cancelled() => {
                    let _ = done_tx.send(Err(ApiError::Other(
                        "forward process died".to_string(),
                    )));
                }
            }
        });
        self.forwards.lock().push(ForwardEnds {
            cancel: cancel.clone(),
            die,
        });
        Ok(ForwardChannel {
            cancel,
            done: done_rx,
        })
    }
}
