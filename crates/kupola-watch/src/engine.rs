//! Polling watch engine.
//!
//! The cluster access layer is pull-based, so a push-style watch is
//! emulated by fetching full snapshots on a timer and diffing against the
//! last emitted one. Consumers only see snapshots that actually changed
//! under the watched-field policy in [`crate::detector`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use kupola_k8s::{ApiError, ErrorClass};
use kupola_types::Watchable;

use crate::coordinator::FailureCoordinator;
use crate::detector::snapshots_equal;

/// Notification delivered to one watch consumer.
#[derive(Debug)]
pub enum WatchEvent<T> {
    /// A snapshot that differs from the previously emitted one.
    Snapshot(Vec<T>),
    /// A fetch failure scoped to this subscription. The poll loop keeps
    /// running afterwards unless the error was a lost connection.
    Error(ApiError),
}

/// A live subscription handed to the consumer.
///
/// Exactly one poll loop runs per subscription. Replacing a subscription
/// means cancelling this one and calling `subscribe` again; the engine
/// never resumes an old loop.
pub struct WatchSubscription<T> {
    events: mpsc::UnboundedReceiver<WatchEvent<T>>,
    cancel: CancellationToken,
}

impl<T> WatchSubscription<T> {
    /// Next notification; `None` once the poll loop has stopped.
    pub async fn next_event(&mut self) -> Option<WatchEvent<T>> {
        self.events.recv().await
    }

    /// Stop the poll loop. Idempotent, and safe to call on a subscription
    /// that already stopped itself after a connection-lost report. No
    /// event is delivered after this returns.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.events.close();
        // Drain anything the loop queued before it observed the token.
        while self.events.try_recv().is_ok() {}
    }
}

impl<T> Drop for WatchSubscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns snapshot fetchers into change-notification streams.
pub struct WatchStreamEngine {
    coordinator: Arc<FailureCoordinator>,
}

impl WatchStreamEngine {
    pub fn new(coordinator: Arc<FailureCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<FailureCoordinator> {
        &self.coordinator
    }

    /// Start polling `fetch` every `interval`.
    ///
    /// The first fetch is issued immediately and its snapshot always
    /// emitted; later snapshots are emitted only when they differ from
    /// the recorded current one. Fetch-and-compare cycles are strictly
    /// sequential; a new poll never starts while one is outstanding.
    pub fn subscribe<T, F, Fut>(&self, interval: Duration, fetch: F) -> WatchSubscription<T>
    where
        T: Watchable + Clone + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>, ApiError>> + Send + 'static,
    {
        let cancel = self.coordinator.register_watcher();
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::clone(&self.coordinator);
        let loop_cancel = cancel.clone();
        tokio::spawn(poll_loop(fetch, interval, coordinator, loop_cancel, tx));
        WatchSubscription { events: rx, cancel }
    }
}

async fn poll_loop<T, F, Fut>(
    mut fetch: F,
    interval: Duration,
    coordinator: Arc<FailureCoordinator>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<WatchEvent<T>>,
) where
    T: Watchable + Clone + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>, ApiError>> + Send + 'static,
{
    let mut current: Option<Vec<T>> = None;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = fetch_with_refresh(&mut fetch, &coordinator) => result,
        };

        match result {
            Ok(snapshot) => {
                let changed = match &current {
                    Some(previous) => !snapshots_equal(previous, &snapshot),
                    None => true,
                };
                if changed {
                    if tx.send(WatchEvent::Snapshot(snapshot.clone())).is_err() {
                        break;
                    }
                    current = Some(snapshot);
                } else {
                    trace!("snapshot unchanged, suppressing emission");
                }
            }
            Err(err) if err.class() == ErrorClass::ConnectionLost => {
                // One global failure instead of one error per watcher.
                // The coordinator cancels every registered token,
                // including ours; stop without emitting anything further.
                coordinator.report_failure(&err);
                let _ = tx.send(WatchEvent::Error(err));
                break;
            }
            Err(err) => {
                // A single bad fetch does not stop the subscription.
                if tx.send(WatchEvent::Error(err)).is_err() {
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Fetch once, transparently refreshing credentials and retrying once on
/// a 401-class failure. The user never sees the expired-credential error
/// unless the refresh or the retry also fails.
async fn fetch_with_refresh<T, F, Fut>(
    fetch: &mut F,
    coordinator: &FailureCoordinator,
) -> Result<Vec<T>, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>, ApiError>>,
{
    match fetch().await {
        Err(err) if err.class() == ErrorClass::CredentialExpired => {
            debug!("credentials expired, refreshing and retrying fetch");
            match coordinator.refresh_credentials().await {
                Ok(()) => fetch().await,
                Err(refresh_err) => {
                    debug!(error = %refresh_err, "credential refresh failed");
                    Err(err)
                }
            }
        }
        other => other,
    }
}
