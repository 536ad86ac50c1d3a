use thiserror::Error;

/// Errors surfaced by a backend to its caller.
///
/// Protocol-level oddities (unknown mode ids, duplicate announcements) are
/// absorbed with a diagnostic and never appear here; only connection, apply
/// and wait failures are explicit results.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport unreachable or dropped. Terminal for this backend
    /// instance; there is no automatic reconnect.
    #[error("connection to the display server failed: {0}")]
    ConnectionFailed(String),

    /// A readiness or apply-confirmation wait exceeded its bound.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The display server rejected a write-back batch. Live state is
    /// presumed unchanged.
    #[error("display server rejected the configuration: {0}")]
    ApplyFailed(String),

    /// The backend event loop has shut down.
    #[error("backend event loop has shut down")]
    Disconnected,

    /// No usable backend for this session.
    #[error("no backend available: {0}")]
    Unavailable(String),
}
