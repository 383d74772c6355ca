//! Interactive session registry and lifecycle.
//!
//! Sessions are owned here, not by whatever view happens to render them:
//! minimizing a session detaches the view while the backing process keeps
//! running, and restoring reattaches to the same process. The backing
//! process of a session is created at most once and torn down exactly
//! once, when the session closes.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use kupola_k8s::{ApiError, ClusterApi};
use kupola_types::{SessionId, SessionKind, SessionTarget, TerminalDimensions};

use crate::logtail::LogProcess;
use crate::shell::ShellProcess;

/// Tail length requested when a log session starts following.
const LOG_TAIL_LINES: i64 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Minimized,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session with id {0}")]
    NotFound(SessionId),
    #[error("target pod of session {0} no longer exists")]
    TargetGone(SessionId),
    #[error("session {0} is not a shell session")]
    NotAShell(SessionId),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Receiving side of an attached view.
pub enum SessionView {
    Shell(ShellView),
    Log(LogView),
}

pub struct ShellView {
    /// Raw tty output, as produced by the remote shell.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub struct LogView {
    /// Lines that arrived while no view was attached, oldest first.
    pub backlog: Vec<String>,
    /// Lines arriving from now on.
    pub output: mpsc::UnboundedReceiver<String>,
}

/// Whether `open` created a session or reattached to an existing one.
pub enum OpenOutcome {
    Created(SessionView),
    Reattached(SessionView),
}

impl OpenOutcome {
    pub fn into_view(self) -> SessionView {
        match self {
            Self::Created(view) | Self::Reattached(view) => view,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: SessionId,
    pub target: SessionTarget,
    pub kind: SessionKind,
    pub state: SessionState,
}

enum Backing {
    Shell(Arc<ShellProcess>),
    Log(Arc<LogProcess>),
}

impl Backing {
    fn attach(&self) -> SessionView {
        match self {
            Self::Shell(process) => SessionView::Shell(ShellView {
                output: process.attach(),
            }),
            Self::Log(process) => SessionView::Log(LogView {
                backlog: process.recent_lines(),
                output: process.attach(),
            }),
        }
    }

    fn detach(&self) {
        match self {
            Self::Shell(process) => process.detach(),
            Self::Log(process) => process.detach(),
        }
    }

    fn terminate(&self) {
        match self {
            Self::Shell(process) => process.terminate(),
            Self::Log(process) => process.terminate(),
        }
    }
}

struct SessionEntry {
    target: SessionTarget,
    kind: SessionKind,
    state: SessionState,
    backing: Backing,
}

/// Registry of interactive sessions, shared by `Arc`.
///
/// All mutating operations serialize on one async lock, so concurrent
/// calls for the same id cannot both perform a teardown or both spawn a
/// backing process.
pub struct SessionManager {
    api: Arc<dyn ClusterApi>,
    sessions: tokio::sync::Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionManager {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Open a session, or reattach to it if `id` already names a live one.
    ///
    /// Reattaching never creates a new backing process; the existing one
    /// is transitioned to Active and handed back.
    pub async fn open(
        &self,
        id: SessionId,
        target: SessionTarget,
        kind: SessionKind,
        dims: TerminalDimensions,
    ) -> Result<OpenOutcome, SessionError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get_mut(&id) {
            debug!(%id, "reattaching existing session");
            entry.state = SessionState::Active;
            if let Backing::Shell(process) = &entry.backing {
                // The view was recreated; re-wire its dimensions.
                process.resize(dims);
            }
            return Ok(OpenOutcome::Reattached(entry.backing.attach()));
        }

        info!(%id, %target, ?kind, "opening session");
        let backing = match kind {
            SessionKind::Shell => {
                let channel = self.api.open_shell(&target, dims).await?;
                Backing::Shell(ShellProcess::spawn(channel))
            }
            SessionKind::Log => {
                let channel = self.api.open_log_stream(&target, LOG_TAIL_LINES).await?;
                Backing::Log(LogProcess::spawn(channel))
            }
        };
        let view = backing.attach();
        sessions.insert(
            id,
            SessionEntry {
                target,
                kind,
                state: SessionState::Active,
                backing,
            },
        );
        Ok(OpenOutcome::Created(view))
    }

    /// Detach the session's view, keeping the backing process alive.
    pub async fn minimize(&self, id: &SessionId) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if entry.state == SessionState::Active {
            entry.state = SessionState::Minimized;
            entry.backing.detach();
            debug!(%id, "session minimized");
        }
        Ok(())
    }

    /// Reattach a minimized session.
    ///
    /// The target pod is verified first: a session whose pod has
    /// disappeared is force-closed and reported as [`SessionError::TargetGone`]
    /// instead of being silently reattached to a dead target.
    pub async fn restore(
        &self,
        id: &SessionId,
        dims: TerminalDimensions,
    ) -> Result<SessionView, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        let target = entry.target.clone();

        if !self.api.pod_exists(&target.namespace, &target.pod).await? {
            info!(%id, %target, "target pod gone, force-closing session");
            let entry = sessions.remove(id).expect("entry present under lock");
            entry.backing.terminate();
            return Err(SessionError::TargetGone(id.clone()));
        }

        let entry = sessions.get_mut(id).expect("entry present under lock");
        entry.state = SessionState::Active;
        if let Backing::Shell(process) = &entry.backing {
            // The view was recreated while the process was not; the remote
            // tty needs the new dimensions.
            process.resize(dims);
        }
        debug!(%id, "session restored");
        Ok(entry.backing.attach())
    }

    /// Close the session and tear its backing process down.
    ///
    /// Removal happens under the lock and teardown after it, so two
    /// concurrent closes cannot both perform the teardown. Closing an
    /// unknown or already-closed id is a no-op.
    pub async fn close(&self, id: &SessionId) {
        let entry = self.sessions.lock().await.remove(id);
        if let Some(entry) = entry {
            info!(%id, "closing session");
            // Teardown of an already-dead channel is best-effort.
            entry.backing.terminate();
        }
    }

    /// Close every session. Used at application shutdown.
    pub async fn close_all(&self) {
        let entries: Vec<_> = self.sessions.lock().await.drain().collect();
        for (id, entry) in entries {
            debug!(%id, "closing session at shutdown");
            entry.backing.terminate();
        }
    }

    /// Forward user keystrokes to a shell session.
    ///
    /// Input sent before the remote shell printed its first prompt is
    /// queued and flushed once it does.
    pub async fn send_input(&self, id: &SessionId, bytes: &[u8]) -> Result<(), SessionError> {
        let process = self.shell_process(id).await?;
        process.send_input(bytes).await;
        Ok(())
    }

    /// Propagate new terminal dimensions to a shell session's remote tty.
    pub async fn resize(&self, id: &SessionId, dims: TerminalDimensions) -> Result<(), SessionError> {
        let process = self.shell_process(id).await?;
        process.resize(dims);
        Ok(())
    }

    /// Whether the shell has printed a prompt and accepts input.
    pub async fn is_ready(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.shell_process(id).await?.is_ready())
    }

    /// Working directory last inferred from the shell prompt, if any.
    pub async fn working_directory(&self, id: &SessionId) -> Result<Option<String>, SessionError> {
        Ok(self.shell_process(id).await?.working_directory())
    }

    /// Stable identity of a shell session's backing process.
    pub async fn shell_handle_id(&self, id: &SessionId) -> Result<u64, SessionError> {
        Ok(self.shell_process(id).await?.handle_id())
    }

    pub async fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.lock().await.get(id).map(|e| e.state)
    }

    /// Number of sessions currently in the Active state.
    pub async fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|e| e.state == SessionState::Active)
            .count()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                target: entry.target.clone(),
                kind: entry.kind,
                state: entry.state,
            })
            .collect()
    }

    async fn shell_process(&self, id: &SessionId) -> Result<Arc<ShellProcess>, SessionError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        match &entry.backing {
            Backing::Shell(process) => Ok(Arc::clone(process)),
            Backing::Log(_) => Err(SessionError::NotAShell(id.clone())),
        }
    }
}
