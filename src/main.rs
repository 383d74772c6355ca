use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use kupola_k8s::{ClusterApi, KubeClusterApi};
use kupola_session::{
    PortForwardManager, SessionId, SessionKind, SessionManager, SessionTarget, SessionView,
    TerminalDimensions,
};
use kupola_types::Watchable;
use kupola_watch::{FailureCoordinator, WatchEvent, WatchStreamEngine};

/// Kupola - headless cluster watch and interactive-session engine
#[derive(Parser, Debug)]
#[command(name = "kupola")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubernetes context name (defaults to the current context)
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll a resource kind and print a snapshot whenever it changes
    Watch {
        /// Resource kind to watch
        #[arg(value_enum)]
        kind: ResourceKind,

        /// Namespaces to watch (repeatable; empty means all)
        #[arg(short, long = "namespace")]
        namespaces: Vec<String>,

        /// Poll interval in seconds
        #[arg(long, default_value = "3")]
        interval: u64,
    },

    /// Follow a container's log through a log session
    Logs {
        namespace: String,
        pod: String,
        container: String,
    },

    /// Open an interactive shell session (line-buffered)
    Exec {
        namespace: String,
        pod: String,
        container: String,
    },

    /// Forward a local port to a container port until interrupted
    Forward {
        namespace: String,
        pod: String,
        container_port: u16,
        local_port: u16,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ResourceKind {
    Pods,
    Deployments,
    Cronjobs,
    Namespaces,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;
    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }
    result
}

async fn run(args: Args) -> Result<()> {
    let api = Arc::new(
        KubeClusterApi::from_kubeconfig(args.context.clone())
            .await
            .context("failed to connect to the cluster")?,
    );
    let coordinator =
        Arc::new(FailureCoordinator::new().with_refresher(Arc::clone(&api) as _));

    match args.command {
        Command::Watch {
            kind,
            namespaces,
            interval,
        } => {
            let engine = WatchStreamEngine::new(Arc::clone(&coordinator));
            let interval = Duration::from_secs(interval.max(1));
            match kind {
                ResourceKind::Pods => {
                    let fetch_api = Arc::clone(&api);
                    run_watch(&engine, interval, move || {
                        let api = Arc::clone(&fetch_api);
                        let namespaces = namespaces.clone();
                        async move { api.list_pods(&namespaces).await }
                    })
                    .await
                }
                ResourceKind::Deployments => {
                    let fetch_api = Arc::clone(&api);
                    run_watch(&engine, interval, move || {
                        let api = Arc::clone(&fetch_api);
                        let namespaces = namespaces.clone();
                        async move { api.list_deployments(&namespaces).await }
                    })
                    .await
                }
                ResourceKind::Cronjobs => {
                    let fetch_api = Arc::clone(&api);
                    run_watch(&engine, interval, move || {
                        let api = Arc::clone(&fetch_api);
                        let namespaces = namespaces.clone();
                        async move { api.list_cron_jobs(&namespaces).await }
                    })
                    .await
                }
                ResourceKind::Namespaces => {
                    let fetch_api = Arc::clone(&api);
                    run_watch(&engine, interval, move || {
                        let api = Arc::clone(&fetch_api);
                        async move { api.list_namespaces().await }
                    })
                    .await
                }
            }
        }
        Command::Logs {
            namespace,
            pod,
            container,
        } => run_logs(api, namespace, pod, container).await,
        Command::Exec {
            namespace,
            pod,
            container,
        } => run_exec(api, namespace, pod, container).await,
        Command::Forward {
            namespace,
            pod,
            container_port,
            local_port,
        } => run_forward(api, namespace, pod, container_port, local_port).await,
    }
}

async fn run_watch<T, F, Fut>(
    engine: &WatchStreamEngine,
    interval: Duration,
    fetch: F,
) -> Result<()>
where
    T: Watchable + Serialize + Clone + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<Vec<T>, kupola_k8s::ApiError>> + Send + 'static,
{
    let mut subscription = engine.subscribe(interval, fetch);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                subscription.cancel();
                return Ok(());
            }
            event = subscription.next_event() => match event {
                Some(WatchEvent::Snapshot(items)) => {
                    println!("--- {} item(s)", items.len());
                    for item in &items {
                        println!("{}", serde_json::to_string(item)?);
                    }
                }
                Some(WatchEvent::Error(err)) => eprintln!("watch error: {err}"),
                None => {
                    // The poller stopped itself; with no UI to offer a
                    // retry button, report the outage and exit.
                    if let Some(failure) = engine.coordinator().current_failure() {
                        anyhow::bail!("connection to cluster lost: {failure}");
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn run_logs(
    api: Arc<KubeClusterApi>,
    namespace: String,
    pod: String,
    container: String,
) -> Result<()> {
    let sessions = Arc::new(SessionManager::new(api));
    let target = SessionTarget::new(namespace, pod, container);
    let id = SessionId::new(format!("{target}/logs"));

    let outcome = sessions
        .open(
            id.clone(),
            target,
            SessionKind::Log,
            TerminalDimensions::default(),
        )
        .await?;
    let SessionView::Log(mut view) = outcome.into_view() else {
        unreachable!("log sessions produce log views");
    };

    for line in &view.backlog {
        println!("{line}");
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = view.output.recv() => match line {
                Some(line) => println!("{line}"),
                None => break,
            }
        }
    }
    sessions.close(&id).await;
    Ok(())
}

async fn run_exec(
    api: Arc<KubeClusterApi>,
    namespace: String,
    pod: String,
    container: String,
) -> Result<()> {
    let sessions = Arc::new(SessionManager::new(api));
    let target = SessionTarget::new(namespace, pod, container);
    let id = SessionId::new(format!("{target}/shell"));

    let outcome = sessions
        .open(
            id.clone(),
            target,
            SessionKind::Shell,
            TerminalDimensions::default(),
        )
        .await?;
    let SessionView::Shell(mut view) = outcome.into_view() else {
        unreachable!("shell sessions produce shell views");
    };

    // Mirror remote output to stdout as it arrives.
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = view.output.recv().await {
            if stdout.write_all(&chunk).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    sessions
                        .send_input(&id, format!("{line}\n").as_bytes())
                        .await?;
                }
                None => break,
            }
        }
    }

    sessions.close(&id).await;
    printer.abort();
    Ok(())
}

async fn run_forward(
    api: Arc<KubeClusterApi>,
    namespace: String,
    pod: String,
    container_port: u16,
    local_port: u16,
) -> Result<()> {
    let forwards = Arc::new(PortForwardManager::new(api));
    let session = forwards
        .start(&namespace, &pod, container_port, local_port)
        .await?;
    println!(
        "forwarding 127.0.0.1:{} -> {}/{}:{} (ctrl-c to stop)",
        session.local_port, session.namespace, session.pod, session.container_port
    );

    tokio::signal::ctrl_c().await?;
    // No forwarding channel may outlive the application.
    forwards.stop_all();
    Ok(())
}
