use ptyhost_native::PtyError;

use crate::registry::Handle;

/// Errors returned synchronously by engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// The pty or the process could not be created. No handle was issued.
    Spawn(PtyError),
    InvalidConfig(String),
    /// The handle was never issued, or its session has been reclaimed.
    InvalidHandle(Handle),
    /// The session has terminated, or its pty has already been released.
    NotRunning(Handle),
    /// The session's process has not exited yet.
    NotExited(Handle),
    Io(PtyError),
    Resize(PtyError),
    InvalidSize { cols: u16, rows: u16 },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Spawn(err) => write!(f, "failed to create session: {err}"),
            EngineError::InvalidConfig(msg) => write!(f, "invalid session config: {msg}"),
            EngineError::InvalidHandle(handle) => write!(f, "unknown session handle {handle}"),
            EngineError::NotRunning(handle) => write!(f, "session {handle} is not running"),
            EngineError::NotExited(handle) => write!(f, "session {handle} has not exited"),
            EngineError::Io(err) => write!(f, "session I/O failed: {err}"),
            EngineError::Resize(err) => write!(f, "session resize rejected: {err}"),
            EngineError::InvalidSize { cols, rows } => {
                write!(f, "terminal size must be positive, got {cols}x{rows}")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Spawn(err) | EngineError::Io(err) | EngineError::Resize(err) => Some(err),
            _ => None,
        }
    }
}
