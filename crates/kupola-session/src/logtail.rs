//! Backing stream for log tail sessions.
//!
//! Mirrors the shell process lifecycle without the input side: one pump
//! task per session reads the followed log stream line by line, keeps a
//! bounded buffer of recent lines, and forwards to the attached view
//! while one exists. Minimizing detaches the view; the stream itself
//! stays alive until the session is closed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use kupola_k8s::LogChannel;

/// Recent lines retained for reattachment after a minimize.
const RECENT_LINES: usize = 1000;

struct LogState {
    recent: VecDeque<String>,
    attached: Option<mpsc::UnboundedSender<String>>,
}

pub struct LogProcess {
    cancel: CancellationToken,
    state: Arc<Mutex<LogState>>,
}

impl LogProcess {
    /// Take ownership of a log channel and start pumping lines.
    pub fn spawn(channel: LogChannel) -> Arc<Self> {
        let LogChannel { output, cancel } = channel;

        let state = Arc::new(Mutex::new(LogState {
            recent: VecDeque::with_capacity(RECENT_LINES),
            attached: None,
        }));

        let process = Arc::new(Self {
            cancel: cancel.clone(),
            state: Arc::clone(&state),
        });

        let pump_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut lines = BufReader::new(output).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    // Stream ended (container terminated?) or errored.
                    Ok(None) | Err(_) => break,
                };
                let viewer = {
                    let mut state = pump_state.lock();
                    if state.recent.len() == RECENT_LINES {
                        state.recent.pop_front();
                    }
                    state.recent.push_back(line.clone());
                    state.attached.clone()
                };
                if let Some(viewer) = viewer {
                    let _ = viewer.send(line);
                }
            }
            trace!("log pump stopped");
        });

        process
    }

    /// Attach a fresh view; previously attached views stop receiving.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().attached = Some(tx);
        rx
    }

    pub fn detach(&self) {
        self.state.lock().attached = None;
    }

    /// Lines seen recently, oldest first. Lets a restored view backfill
    /// what scrolled by while it was minimized.
    pub fn recent_lines(&self) -> Vec<String> {
        self.state.lock().recent.iter().cloned().collect()
    }

    /// Tear the stream down. Idempotent.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}
