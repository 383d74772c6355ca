//! Port-forward registry and lifecycle.
//!
//! At most one forward may hold a given local port across the whole
//! application; the check runs before the cluster is touched so the
//! caller gets a dedicated "port in use" error instead of whatever the
//! underlying forwarding mechanism would produce. A forward whose
//! backing channel dies is dropped from the active set immediately, so
//! it is never reported active after its process is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kupola_k8s::{ApiError, ClusterApi};

pub type ForwardId = u64;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("local port {0} is already in use by another forward")]
    PortInUse(u16),
    #[error("forward was stopped during startup")]
    StoppedDuringStartup,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Descriptor of one active forward.
#[derive(Clone, Debug)]
pub struct PortForwardSession {
    pub id: ForwardId,
    pub namespace: String,
    pub pod: String,
    pub container_port: u16,
    pub local_port: u16,
    pub started_at: DateTime<Utc>,
}

enum EntryState {
    /// Reserved; the forwarding channel is still being established.
    Starting,
    Running(CancellationToken),
}

struct ForwardEntry {
    info: PortForwardSession,
    state: EntryState,
}

type ForwardMap = Arc<Mutex<HashMap<ForwardId, ForwardEntry>>>;

/// Registry of active port forwards, shared by `Arc`.
pub struct PortForwardManager {
    api: Arc<dyn ClusterApi>,
    forwards: ForwardMap,
    next_id: AtomicU64,
}

impl PortForwardManager {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            forwards: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start forwarding `local_port` to `container_port` on the pod.
    ///
    /// The local port is reserved in the registry before the cluster call
    /// so a concurrent `start` for the same port fails fast with
    /// [`ForwardError::PortInUse`] instead of racing.
    pub async fn start(
        &self,
        namespace: &str,
        pod: &str,
        container_port: u16,
        local_port: u16,
    ) -> Result<PortForwardSession, ForwardError> {
        let info = PortForwardSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container_port,
            local_port,
            started_at: Utc::now(),
        };
        let id = info.id;

        {
            let mut forwards = self.forwards.lock();
            if forwards.values().any(|e| e.info.local_port == local_port) {
                return Err(ForwardError::PortInUse(local_port));
            }
            forwards.insert(
                id,
                ForwardEntry {
                    info: info.clone(),
                    state: EntryState::Starting,
                },
            );
        }

        let channel = match self
            .api
            .forward_port(namespace, pod, container_port, local_port)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                self.forwards.lock().remove(&id);
                return Err(err.into());
            }
        };

        {
            let mut forwards = self.forwards.lock();
            match forwards.get_mut(&id) {
                Some(entry) => entry.state = EntryState::Running(channel.cancel.clone()),
                // Stopped (or shut down) while the channel was being
                // established; tear the fresh channel down again.
                None => {
                    channel.cancel.cancel();
                    return Err(ForwardError::StoppedDuringStartup);
                }
            }
        }

        info!(%namespace, %pod, container_port, local_port, "port forward started");

        // Watchdog: the moment the backing channel finishes on its own,
        // the forward must disappear from the active set.
        let forwards = Arc::clone(&self.forwards);
        tokio::spawn(async move {
            match channel.done.await {
                Ok(Ok(())) => debug!(id, "port forward shut down"),
                Ok(Err(err)) => warn!(id, error = %err, "port forward died"),
                Err(_) => warn!(id, "port forward dropped without result"),
            }
            forwards.lock().remove(&id);
        });

        Ok(info)
    }

    /// Stop one forward. Unknown ids are a no-op.
    pub fn stop(&self, id: ForwardId) {
        let entry = self.forwards.lock().remove(&id);
        if let Some(entry) = entry {
            info!(id, local_port = entry.info.local_port, "stopping port forward");
            if let EntryState::Running(cancel) = entry.state {
                cancel.cancel();
            }
        }
    }

    /// Stop every forward. Invoked at application shutdown so no
    /// forwarding channel outlives the application.
    pub fn stop_all(&self) {
        let entries: Vec<_> = self.forwards.lock().drain().collect();
        for (id, entry) in entries {
            debug!(id, "stopping port forward at shutdown");
            if let EntryState::Running(cancel) = entry.state {
                cancel.cancel();
            }
        }
    }

    /// Whether any active forward already holds this local port.
    pub fn is_local_port_in_use(&self, local_port: u16) -> bool {
        self.forwards
            .lock()
            .values()
            .any(|e| e.info.local_port == local_port)
    }

    /// Whether this pod port is currently forwarded. At most one entry
    /// can match, since each forward holds a distinct local port.
    pub fn is_forwarded(&self, namespace: &str, pod: &str, container_port: u16) -> bool {
        self.find_forward(namespace, pod, container_port).is_some()
    }

    /// The forward for this pod port, if one exists.
    pub fn find_forward(
        &self,
        namespace: &str,
        pod: &str,
        container_port: u16,
    ) -> Option<PortForwardSession> {
        self.forwards
            .lock()
            .values()
            .find(|e| {
                e.info.namespace == namespace
                    && e.info.pod == pod
                    && e.info.container_port == container_port
            })
            .map(|e| e.info.clone())
    }

    pub fn sessions(&self) -> Vec<PortForwardSession> {
        self.forwards.lock().values().map(|e| e.info.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.forwards.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::MockClusterApi;

    fn manager() -> (PortForwardManager, Arc<MockClusterApi>) {
        let api = Arc::new(MockClusterApi::new(true));
        (PortForwardManager::new(Arc::clone(&api) as _), api)
    }

    async fn wait_until_empty(manager: &PortForwardManager) {
        for _ in 0..200 {
            if manager.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("forward was not removed");
    }

    #[tokio::test]
    async fn test_start_records_session_and_answers_queries() {
        let (manager, _api) = manager();
        let session = manager.start("default", "web-1", 8080, 18080).await.unwrap();

        assert_eq!(session.local_port, 18080);
        assert!(manager.is_local_port_in_use(18080));
        assert!(manager.is_forwarded("default", "web-1", 8080));
        assert!(!manager.is_forwarded("default", "web-1", 9090));
        assert_eq!(manager.sessions().len(), 1);

        let found = manager.find_forward("default", "web-1", 8080).unwrap();
        assert_eq!(found.id, session.id);
    }

    #[tokio::test]
    async fn test_duplicate_local_port_is_rejected_before_the_cluster_call() {
        let (manager, api) = manager();
        manager.start("default", "web-1", 8080, 18080).await.unwrap();

        let err = manager
            .start("default", "web-2", 9090, 18080)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::PortInUse(18080)));
        // The rejected start never reached the cluster.
        assert_eq!(api.forwards_opened.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.sessions().len(), 1);

        // A distinct local port is fine.
        manager.start("default", "web-2", 9090, 19090).await.unwrap();
        assert!(manager.is_forwarded("default", "web-2", 9090));
    }

    #[tokio::test]
    async fn test_dead_backing_channel_removes_the_forward() {
        let (manager, api) = manager();
        manager.start("default", "web-1", 8080, 18080).await.unwrap();
        let ends = api.take_forward();

        ends.die.cancel();
        wait_until_empty(&manager).await;
        assert!(!manager.is_forwarded("default", "web-1", 8080));
        assert!(!manager.is_local_port_in_use(18080));
    }

    #[tokio::test]
    async fn test_stop_cancels_and_is_idempotent() {
        let (manager, api) = manager();
        let session = manager.start("default", "web-1", 8080, 18080).await.unwrap();
        let ends = api.take_forward();

        manager.stop(session.id);
        assert!(ends.cancel.is_cancelled());
        assert_eq!(manager.active_count(), 0);

        manager.stop(session.id); // no-op
    }

    #[tokio::test]
    async fn test_stop_all_clears_everything() {
        let (manager, api) = manager();
        manager.start("default", "web-1", 8080, 18080).await.unwrap();
        manager.start("default", "web-2", 9090, 19090).await.unwrap();
        let first = api.take_forward();
        let second = api.take_forward();

        manager.stop_all();
        assert!(first.cancel.is_cancelled());
        assert!(second.cancel.is_cancelled());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_no_session_behind() {
        let (manager, api) = manager();
        api.fail_forward.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = manager.start("default", "web-1", 8080, 18080).await.unwrap_err();
        assert!(matches!(err, ForwardError::Api(_)));
        assert_eq!(manager.active_count(), 0);
        assert!(!manager.is_local_port_in_use(18080));
    }
}
