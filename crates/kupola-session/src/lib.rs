//! Interactive session and port-forward lifecycle for kupola
//!
//! This crate owns the long-lived, process-backed channels into the
//! cluster: remote shells, followed log tails, and port forwards. The
//! registries here are explicitly constructed services shared by `Arc`;
//! views attach to and detach from them, but lifetime and teardown stay
//! with the registry.

mod forward;
mod logtail;
mod manager;
mod prompt;
mod shell;

#[cfg(test)]
pub(crate) mod test_support;

pub use forward::{ForwardError, ForwardId, PortForwardManager, PortForwardSession};
pub use logtail::LogProcess;
pub use manager::{
    LogView, OpenOutcome, SessionError, SessionInfo, SessionManager, SessionState, SessionView,
    ShellView,
};
pub use prompt::{OutputRing, PromptScan, PromptScanner, OUTPUT_RING_CAPACITY};
pub use shell::ShellProcess;

// Re-export types that appear in our public API
pub use kupola_types::{SessionId, SessionKind, SessionTarget, TerminalDimensions};
