//! Backing process for interactive shell sessions.
//!
//! A `ShellProcess` owns the exec channel for one remote shell. It keeps
//! pumping output into a bounded ring whether or not a view is attached,
//! gates user input on prompt readiness, and forwards terminal resizes to
//! the remote tty. The process is created once per session and reused
//! across minimize/restore; only the attached view comes and goes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use kupola_k8s::ShellChannel;
use kupola_types::TerminalDimensions;

use crate::prompt::{OutputRing, PromptScanner};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

struct ShellState {
    /// Prompt observed; input may flow.
    ready: bool,
    /// Working directory inferred from the most recent prompt.
    cwd: Option<String>,
    /// Input received before readiness, flushed in order once ready.
    pending_input: Vec<u8>,
    /// Tail of recent output for the prompt scanner.
    ring: OutputRing,
    /// Where output goes while a view is attached.
    attached: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

pub struct ShellProcess {
    handle_id: u64,
    input: tokio::sync::Mutex<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>,
    resize: mpsc::Sender<TerminalDimensions>,
    cancel: CancellationToken,
    state: Arc<Mutex<ShellState>>,
}

impl ShellProcess {
    /// Take ownership of an exec channel and start pumping its output.
    pub fn spawn(channel: ShellChannel) -> Arc<Self> {
        let ShellChannel {
            input,
            mut output,
            resize,
            cancel,
        } = channel;

        let state = Arc::new(Mutex::new(ShellState {
            ready: false,
            cwd: None,
            pending_input: Vec::new(),
            ring: OutputRing::default(),
            attached: None,
        }));

        let process = Arc::new(Self {
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            input: tokio::sync::Mutex::new(input),
            resize,
            cancel: cancel.clone(),
            state: Arc::clone(&state),
        });

        let pump = Arc::clone(&process);
        tokio::spawn(async move {
            let scanner = PromptScanner::new();
            let mut buf = [0u8; 4096];
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = output.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pump.ingest(&scanner, &buf[..n]).await;
            }
            trace!(handle = pump.handle_id, "shell output pump stopped");
        });

        process
    }

    /// Stable identity of the backing process, for diagnostics and for
    /// verifying that reattachment did not respawn anything.
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    /// Fold a chunk of remote output into the ring, re-run the prompt
    /// scan, and forward to the attached view if any.
    async fn ingest(&self, scanner: &PromptScanner, chunk: &[u8]) {
        let (flush, viewer) = {
            let mut state = self.state.lock();
            state.ring.extend(chunk);
            let scan = scanner.scan(&state.ring.tail());
            if scan.cwd.is_some() {
                state.cwd = scan.cwd;
            }
            let flush = if scan.ready && !state.ready {
                state.ready = true;
                debug!(handle = self.handle_id, "shell prompt detected, input unlocked");
                std::mem::take(&mut state.pending_input)
            } else {
                Vec::new()
            };
            (flush, state.attached.clone())
        };

        if let Some(viewer) = viewer {
            // A dropped view is not an error; the process outlives it.
            let _ = viewer.send(chunk.to_vec());
        }
        if !flush.is_empty() {
            self.write(&flush).await;
        }
    }

    async fn write(&self, bytes: &[u8]) {
        let mut input = self.input.lock().await;
        if let Err(e) = input.write_all(bytes).await {
            debug!(handle = self.handle_id, error = %e, "shell input write failed");
            return;
        }
        let _ = input.flush().await;
    }

    /// Forward user input, or queue it while the shell is not ready yet.
    pub async fn send_input(&self, bytes: &[u8]) {
        let ready = {
            let mut state = self.state.lock();
            if !state.ready {
                state.pending_input.extend_from_slice(bytes);
            }
            state.ready
        };
        if ready {
            self.write(bytes).await;
        }
    }

    /// Attach a fresh view; any previously attached view stops receiving.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().attached = Some(tx);
        rx
    }

    /// Detach the current view. Output keeps draining into the ring.
    pub fn detach(&self) {
        self.state.lock().attached = None;
    }

    /// Propagate new terminal dimensions to the remote tty.
    pub fn resize(&self, dims: TerminalDimensions) {
        let _ = self.resize.try_send(dims);
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Last working directory inferred from the prompt, if any was ever
    /// seen. Stays `None` for shells whose prompt the heuristic cannot
    /// recognize.
    pub fn working_directory(&self) -> Option<String> {
        self.state.lock().cwd.clone()
    }

    /// Tear the remote channel down. Idempotent; errors from an already
    /// dead channel are swallowed.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}
