//! Process-wide failure coordination.
//!
//! A cluster-wide outage affects every open watch at once; presenting N
//! independent errors is worse than freezing everything behind a single
//! recoverable one. The coordinator collects a cancellation token from
//! every active watcher, trips them all on the first connection-lost
//! report, and exposes one retry action that tells owners to re-subscribe
//! from scratch.
//!
//! The coordinator is an explicitly constructed service shared by
//! `Arc`, never a language-level singleton, so tests can run several
//! isolated instances.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kupola_k8s::{ApiError, CredentialRefresher, ErrorClass};

#[derive(Default)]
struct FailureState {
    /// The single blocking error currently shown, if any.
    current: Option<String>,
    /// One token per active watcher, tripped together on failure.
    watchers: Vec<CancellationToken>,
}

/// Coordinates global reaction to connectivity loss and credential expiry.
pub struct FailureCoordinator {
    state: Mutex<FailureState>,
    retry_tx: broadcast::Sender<()>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl FailureCoordinator {
    pub fn new() -> Self {
        let (retry_tx, _) = broadcast::channel(8);
        Self {
            state: Mutex::new(FailureState::default()),
            retry_tx,
            refresher: None,
        }
    }

    /// Attach the credential refresher used for 401-class recovery.
    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Register a watcher; the returned token is cancelled when any
    /// watcher reports a lost connection. Already-cancelled tokens from
    /// earlier failures are pruned on the way in.
    pub fn register_watcher(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut state = self.state.lock();
        state.watchers.retain(|t| !t.is_cancelled());
        state.watchers.push(token.clone());
        token
    }

    /// Report a classified failure.
    ///
    /// Only the first connection-lost report populates the failure state
    /// and trips the watcher tokens; repeats while a failure is already
    /// showing are no-ops, so the caller never produces duplicate dialogs.
    /// Returns whether this report was the one that tripped.
    pub fn report_failure(&self, error: &ApiError) -> bool {
        if error.class() != ErrorClass::ConnectionLost {
            return false;
        }
        let watchers = {
            let mut state = self.state.lock();
            if state.current.is_some() {
                return false;
            }
            state.current = Some(error.to_string());
            std::mem::take(&mut state.watchers)
        };
        warn!(error = %error, watchers = watchers.len(), "connection lost, suspending all watchers");
        for token in watchers {
            token.cancel();
        }
        true
    }

    /// The blocking error currently shown, if any.
    pub fn current_failure(&self) -> Option<String> {
        self.state.lock().current.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// Clear the failure and signal subscription owners to restart from
    /// fresh subscriptions. Old pollers are never resumed.
    pub fn retry(&self) {
        self.state.lock().current = None;
        info!("failure cleared, signalling watch owners to restart");
        let _ = self.retry_tx.send(());
    }

    /// Subscribe to retry signals. Owners re-subscribe their watches when
    /// a signal arrives.
    pub fn retry_signal(&self) -> broadcast::Receiver<()> {
        self.retry_tx.subscribe()
    }

    /// Run the injected credential refresher, if any.
    ///
    /// Called by the engine when a fetch comes back 401-class, before the
    /// one transparent retry of the triggering operation.
    pub async fn refresh_credentials(&self) -> Result<(), ApiError> {
        match &self.refresher {
            Some(refresher) => refresher.refresh().await,
            None => Err(ApiError::Other(
                "no credential refresher configured".to_string(),
            )),
        }
    }
}

impl Default for FailureCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> ApiError {
        ApiError::ConnectionLost("socket closed".to_string())
    }

    #[test]
    fn test_first_connection_lost_trips_all_watchers() {
        let coordinator = FailureCoordinator::new();
        let a = coordinator.register_watcher();
        let b = coordinator.register_watcher();

        assert!(coordinator.report_failure(&lost()));
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(coordinator.is_failed());
    }

    #[test]
    fn test_repeat_reports_are_noops() {
        let coordinator = FailureCoordinator::new();
        assert!(coordinator.report_failure(&lost()));
        assert!(!coordinator.report_failure(&lost()));
        assert!(!coordinator.report_failure(&lost()));
    }

    #[test]
    fn test_other_classes_do_not_trip() {
        let coordinator = FailureCoordinator::new();
        let token = coordinator.register_watcher();
        assert!(!coordinator.report_failure(&ApiError::Other("boom".to_string())));
        assert!(!coordinator.report_failure(&ApiError::NotFound("gone".to_string())));
        assert!(!token.is_cancelled());
        assert!(!coordinator.is_failed());
    }

    #[tokio::test]
    async fn test_retry_clears_state_and_broadcasts() {
        let coordinator = FailureCoordinator::new();
        let mut signal = coordinator.retry_signal();
        coordinator.report_failure(&lost());

        coordinator.retry();
        assert!(!coordinator.is_failed());
        assert!(coordinator.current_failure().is_none());
        signal.recv().await.expect("retry signal");
    }

    #[test]
    fn test_watchers_registered_after_failure_are_fresh() {
        let coordinator = FailureCoordinator::new();
        coordinator.report_failure(&lost());
        let token = coordinator.register_watcher();
        assert!(!token.is_cancelled());
    }
}
