//! The capability surface a session engine consumes from the OS.
//!
//! A [`PtyBackend`] turns a [`SpawnRequest`] into a [`SpawnedPty`]: four
//! independently owned pieces that can be handed to different threads.
//! The input/resize side ([`PtyDevice`]), the kill switch
//! ([`ProcessControl`]), the one-shot exit status ([`ExitWaiter`]) and the
//! output stream (a blocking [`Read`]).

use std::io::Read;
use std::path::PathBuf;

use crate::pty::PtyError;

/// Everything needed to start one process attached to a fresh pty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Full child environment. `None` inherits the caller's environment.
    pub env: Option<Vec<(String, String)>>,
    pub cols: u16,
    pub rows: u16,
}

/// A live process bound to a pty, split by concern.
pub struct SpawnedPty {
    /// OS process identifier, when the platform reports one.
    pub pid: Option<u32>,
    pub device: Box<dyn PtyDevice>,
    pub process: Box<dyn ProcessControl>,
    pub waiter: Box<dyn ExitWaiter>,
    /// Child output. Ends (returns `Ok(0)`) once the child side of the pty
    /// has hung up. Not restartable.
    pub output: Box<dyn Read + Send>,
}

/// Allocates ptys and spawns processes on them.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, PtyError>;
}

/// The controlling side of a pty: input injection and viewport size.
pub trait PtyDevice: Send {
    /// Write raw bytes into the child's input. No newline translation.
    fn write_input(&mut self, data: &[u8]) -> Result<(), PtyError>;

    fn set_size(&mut self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Ask the child to finish on its own. Must not kill it.
    fn request_graceful_close(&mut self) -> Result<(), PtyError>;
}

/// Forced termination of the child process.
pub trait ProcessControl: Send {
    fn terminate(&mut self) -> Result<(), PtyError>;
}

/// Blocks until the child exits and yields its exit code. Consumed on use,
/// so a status can only ever be collected once.
pub trait ExitWaiter: Send {
    fn wait_exit(self: Box<Self>) -> Result<i32, PtyError>;
}
