//! Live log tailing.
//!
//! This module provides the tail session manager and the pieces it is built from:
//! the log source capability, the caller-supplied sink, and the per-session polling loop.

use serde::Serialize;

/// Manager-side controls of a running session.
mod active_session;
/// Log source capability and the file-backed source.
pub mod log_source;
/// Caller-side session handle.
pub mod session;
/// Tail session manager implementation.
pub mod session_manager;
/// Delivery of tail events.
pub mod sink;
mod tail_loop;
pub mod types;


pub use log_source::{FileLogSource, LogFilter, LogSource};
pub use session::SessionHandle;
pub use session_manager::TailSessionManager;
pub use sink::{LoggingSink, TailSink};
pub use tail_loop::RetryPolicy;
pub use types::{EndReason, LogCursor, LogLine, SessionKey, TailEvent, TailStatus};

/// Request to start tailing, as received from the command surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct TailRequest {
    pub source: String,
    #[serde(default)]
    pub filter: String,
    /// Requested duration in seconds; the configured default when absent
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl TailRequest {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.source.clone(), self.filter.clone())
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        self.duration_secs.map(std::time::Duration::from_secs)
    }
}
