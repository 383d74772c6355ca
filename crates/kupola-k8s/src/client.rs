//! Kubernetes implementation of [`ClusterApi`] over `kube`.

use async_trait::async_trait;
use chrono::Utc;
use futures::SinkExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{AttachParams, ListParams, LogParams, TerminalSize};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kupola_types::{
    CronJobSummary, DeploymentSummary, NamespaceSummary, PodSummary, SessionTarget,
    TerminalDimensions,
};

use crate::api::{ClusterApi, CredentialRefresher, ForwardChannel, LogChannel, ShellChannel};
use crate::convert;
use crate::error::ApiError;

/// Cluster access over a `kube::Client`.
///
/// The client is kept behind a lock so credential refresh can swap in a
/// freshly authenticated client without interrupting callers.
pub struct KubeClusterApi {
    client: RwLock<Client>,
    context: Option<String>,
}

impl KubeClusterApi {
    /// Wrap an already constructed client.
    pub fn new(client: Client) -> Self {
        Self {
            client: RwLock::new(client),
            context: None,
        }
    }

    /// Build a client from the local kubeconfig, optionally pinned to a
    /// named context.
    pub async fn from_kubeconfig(context: Option<String>) -> Result<Self, ApiError> {
        let client = build_client(context.as_deref()).await?;
        Ok(Self {
            client: RwLock::new(client),
            context,
        })
    }

    fn client(&self) -> Client {
        self.client.read().clone()
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client(), namespace)
    }
}

async fn build_client(context: Option<&str>) -> Result<Client, ApiError> {
    let kubeconfig = Kubeconfig::read()
        .map_err(|e| ApiError::Other(format!("failed to read kubeconfig: {e}")))?;
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| ApiError::Other(format!("failed to build cluster config: {e}")))?;
    Client::try_from(config).map_err(ApiError::from)
}

/// List one resource kind across a namespace set; empty set means all.
macro_rules! list_summaries {
    ($self:expr, $namespaces:expr, $kind:ty, $convert:expr) => {{
        let params = ListParams::default();
        let mut summaries = Vec::new();
        let now = Utc::now();
        if $namespaces.is_empty() {
            let api: Api<$kind> = Api::all($self.client());
            let list = api.list(&params).await.map_err(ApiError::from)?;
            summaries.extend(list.items.iter().map(|item| $convert(item, now)));
        } else {
            for namespace in $namespaces {
                let api: Api<$kind> = Api::namespaced($self.client(), namespace);
                let list = api.list(&params).await.map_err(ApiError::from)?;
                summaries.extend(list.items.iter().map(|item| $convert(item, now)));
            }
        }
        Ok(summaries)
    }};
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_pods(&self, namespaces: &[String]) -> Result<Vec<PodSummary>, ApiError> {
        list_summaries!(self, namespaces, Pod, convert::pod_summary)
    }

    async fn list_deployments(
        &self,
        namespaces: &[String],
    ) -> Result<Vec<DeploymentSummary>, ApiError> {
        list_summaries!(self, namespaces, Deployment, convert::deployment_summary)
    }

    async fn list_cron_jobs(
        &self,
        namespaces: &[String],
    ) -> Result<Vec<CronJobSummary>, ApiError> {
        list_summaries!(self, namespaces, CronJob, convert::cron_job_summary)
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceSummary>, ApiError> {
        let api: Api<Namespace> = Api::all(self.client());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(ApiError::from)?;
        Ok(list.items.iter().map(convert::namespace_summary).collect())
    }

    async fn pod_exists(&self, namespace: &str, pod: &str) -> Result<bool, ApiError> {
        let api = self.pods(namespace);
        match api.get_opt(pod).await {
            Ok(found) => Ok(found.is_some()),
            Err(err) => {
                let err = ApiError::from(err);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn open_shell(
        &self,
        target: &SessionTarget,
        dims: TerminalDimensions,
    ) -> Result<ShellChannel, ApiError> {
        let api = self.pods(&target.namespace);
        let params = AttachParams {
            container: Some(target.container.clone()),
            stdin: true,
            stdout: true,
            // tty channels multiplex stderr into stdout
            stderr: false,
            tty: true,
            ..Default::default()
        };
        let mut attached = api
            .exec(&target.pod, vec!["/bin/sh"], &params)
            .await
            .map_err(ApiError::from)?;

        let stdin = attached
            .stdin()
            .ok_or_else(|| ApiError::Other("exec channel has no stdin".to_string()))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| ApiError::Other("exec channel has no stdout".to_string()))?;
        let mut size_tx = attached
            .terminal_size()
            .ok_or_else(|| ApiError::Other("exec channel has no tty".to_string()))?;

        // Seed the remote tty with the current dimensions before the
        // caller sees the channel.
        let _ = size_tx
            .send(TerminalSize {
                height: dims.rows,
                width: dims.cols,
            })
            .await;

        let cancel = CancellationToken::new();
        let (resize_tx, mut resize_rx) = mpsc::channel::<TerminalDimensions>(4);
        let driver_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut join = std::pin::pin!(attached.join());
            let mut resize_open = true;
            loop {
                tokio::select! {
                    // Dropping the join future closes the websocket and
                    // with it the remote shell.
                    _ = driver_cancel.cancelled() => break,
                    result = &mut join => {
                        if let Err(e) = result {
                            debug!(error = %e, "exec channel closed with error");
                        }
                        break;
                    }
                    dims = resize_rx.recv(), if resize_open => match dims {
                        Some(d) => {
                            let _ = size_tx
                                .send(TerminalSize { height: d.rows, width: d.cols })
                                .await;
                        }
                        None => resize_open = false,
                    },
                }
            }
        });

        Ok(ShellChannel {
            input: Box::new(stdin),
            output: Box::new(stdout),
            resize: resize_tx,
            cancel,
        })
    }

    async fn open_log_stream(
        &self,
        target: &SessionTarget,
        tail_lines: i64,
    ) -> Result<LogChannel, ApiError> {
        let api = self.pods(&target.namespace);
        let params = LogParams {
            follow: true,
            container: Some(target.container.clone()),
            tail_lines: Some(tail_lines),
            timestamps: false,
            ..Default::default()
        };
        let stream = api
            .log_stream(&target.pod, &params)
            .await
            .map_err(ApiError::from)?;
        Ok(LogChannel {
            output: Box::new(stream.compat()),
            cancel: CancellationToken::new(),
        })
    }

    async fn read_file(&self, target: &SessionTarget, path: &str) -> Result<Vec<u8>, ApiError> {
        let api = self.pods(&target.namespace);
        let params = AttachParams {
            container: Some(target.container.clone()),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };
        let mut attached = api
            .exec(&target.pod, vec!["cat", path], &params)
            .await
            .map_err(ApiError::from)?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| ApiError::Other("exec channel has no stdout".to_string()))?;
        let status = attached.take_status();

        let mut data = Vec::new();
        stdout
            .read_to_end(&mut data)
            .await
            .map_err(ApiError::from)?;

        check_exec_status(status, path).await?;
        Ok(data)
    }

    async fn write_file(
        &self,
        target: &SessionTarget,
        path: &str,
        data: &[u8],
    ) -> Result<(), ApiError> {
        let api = self.pods(&target.namespace);
        let params = AttachParams {
            container: Some(target.container.clone()),
            stdin: true,
            stdout: false,
            stderr: true,
            tty: false,
            ..Default::default()
        };
        let command = format!("cat > {}", shell_quote(path));
        let mut attached = api
            .exec(&target.pod, vec!["sh", "-c", &command], &params)
            .await
            .map_err(ApiError::from)?;

        let mut writer = attached
            .stdin()
            .ok_or_else(|| ApiError::Other("exec channel has no stdin".to_string()))?;
        let status = attached.take_status();

        writer.write_all(data).await.map_err(ApiError::from)?;
        // Close stdin so the remote `cat` sees EOF and exits.
        writer.shutdown().await.map_err(ApiError::from)?;

        check_exec_status(status, path).await
    }

    async fn forward_port(
        &self,
        namespace: &str,
        pod: &str,
        container_port: u16,
        local_port: u16,
    ) -> Result<ForwardChannel, ApiError> {
        let api = self.pods(namespace);

        // Handshake once up front so an unreachable pod or invalid port
        // fails the start call instead of the first local connection.
        api.portforward(pod, &[container_port])
            .await
            .map_err(ApiError::from)?;

        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(ApiError::from)?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let loop_cancel = cancel.clone();
        let pod = pod.to_string();
        tokio::spawn(async move {
            let result = accept_loop(api, pod, container_port, listener, loop_cancel).await;
            let _ = done_tx.send(result);
        });

        Ok(ForwardChannel {
            cancel,
            done: done_rx,
        })
    }
}

/// Accept local connections and bridge each one over its own forward.
async fn accept_loop(
    api: Api<Pod>,
    pod: String,
    container_port: u16,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<(), ApiError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted.map_err(ApiError::from)?;
                debug!(%peer, %pod, container_port, "forwarding local connection");
                let api = api.clone();
                let pod = pod.clone();
                let conn_cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        bridge_connection(api, pod, container_port, socket, conn_cancel).await
                    {
                        debug!(error = %e, "forwarded connection ended with error");
                    }
                });
            }
        }
    }
}

async fn bridge_connection(
    api: Api<Pod>,
    pod: String,
    container_port: u16,
    mut socket: tokio::net::TcpStream,
    cancel: CancellationToken,
) -> Result<(), ApiError> {
    let mut forwarder = api
        .portforward(&pod, &[container_port])
        .await
        .map_err(ApiError::from)?;
    let mut upstream = forwarder
        .take_stream(container_port)
        .ok_or_else(|| ApiError::Other("port forward produced no stream".to_string()))?;

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = tokio::io::copy_bidirectional(&mut socket, &mut upstream) => {
            result.map(|_| ()).map_err(ApiError::from)
        }
    }
}

/// Await the exec status channel and fold a remote failure into an error.
async fn check_exec_status(
    status: Option<impl std::future::Future<Output = Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Status>>>,
    path: &str,
) -> Result<(), ApiError> {
    let Some(status) = status else {
        return Ok(());
    };
    match status.await {
        Some(s) if s.status.as_deref() == Some("Failure") => {
            let message = s.message.unwrap_or_else(|| "exec failed".to_string());
            if message.contains("No such file") {
                Err(ApiError::NotFound(format!("{path}: {message}")))
            } else {
                Err(ApiError::Other(message))
            }
        }
        _ => Ok(()),
    }
}

/// Single-quote a path for `sh -c`, escaping embedded quotes.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

#[async_trait]
impl CredentialRefresher for KubeClusterApi {
    /// Rebuild the client from the kubeconfig on disk and swap it in.
    ///
    /// Exec-based auth plugins mint a fresh token during the rebuild, so
    /// this is all an expired-credential recovery needs.
    async fn refresh(&self) -> Result<(), ApiError> {
        let client = build_client(self.context.as_deref()).await?;
        *self.client.write() = client;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("/tmp/plain.txt"), "'/tmp/plain.txt'");
        assert_eq!(shell_quote("/tmp/it's"), "'/tmp/it'\\''s'");
    }
}
