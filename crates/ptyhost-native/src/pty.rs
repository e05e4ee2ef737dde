use std::io::{self, Read, Write};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

use crate::capability::{
    ExitWaiter, ProcessControl, PtyBackend, PtyDevice, SpawnRequest, SpawnedPty,
};

/// Byte the line discipline turns into end-of-file for the reading child (`^D`).
const EOF_CHAR: u8 = 0x04;

/// Errors from PTY operations.
#[derive(Debug)]
pub enum PtyError {
    SpawnFailed(String),
    IoError(io::Error),
    ResizeFailed(String),
    WaitFailed(String),
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::SpawnFailed(msg) => write!(f, "PTY spawn failed: {msg}"),
            PtyError::IoError(err) => write!(f, "PTY I/O error: {err}"),
            PtyError::ResizeFailed(msg) => write!(f, "PTY resize failed: {msg}"),
            PtyError::WaitFailed(msg) => write!(f, "PTY exit status unavailable: {msg}"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PtyError {
    fn from(err: io::Error) -> Self {
        PtyError::IoError(err)
    }
}

impl PtyError {
    /// OS error number behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            PtyError::IoError(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

/// [`PtyBackend`] over the platform pty from `portable-pty`
/// (openpty on Unix, ConPTY on Windows).
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(request.cols, request.rows))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut child = pair
            .slave
            .spawn_command(build_command(request))
            .map_err(|e| {
                PtyError::SpawnFailed(format!("failed to spawn {}: {e}", request.command))
            })?;

        // Only the child may hold the slave end, otherwise the reader never
        // sees the hangup when it exits.
        drop(pair.slave);

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                reap(&mut child);
                return Err(PtyError::SpawnFailed(format!("failed to clone reader: {e}")));
            }
        };

        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                reap(&mut child);
                return Err(PtyError::SpawnFailed(format!("failed to take writer: {e}")));
            }
        };

        let pid = child.process_id();
        let killer = child.clone_killer();
        log::debug!(
            "spawned {} (pid {pid:?}) on a {}x{} pty",
            request.command,
            request.cols,
            request.rows
        );

        Ok(SpawnedPty {
            pid,
            device: Box::new(NativeDevice {
                master: pair.master,
                writer,
            }),
            process: Box::new(NativeProcess { pid, killer }),
            waiter: Box::new(NativeWaiter { child }),
            output: Box::new(HangupReader { inner: reader }),
        })
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn build_command(request: &SpawnRequest) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&request.command);
    cmd.args(&request.args);
    cmd.cwd(&request.cwd);

    if let Some(vars) = &request.env {
        cmd.env_clear();
        for (key, value) in vars {
            cmd.env(key, value);
        }
    }

    cmd
}

/// Kill and collect a child whose session could not be completed.
fn reap(child: &mut Box<dyn Child + Send + Sync>) {
    if let Err(e) = child.kill() {
        log::warn!("failed to kill half-spawned child: {e}");
    }
    if let Err(e) = child.wait() {
        log::warn!("failed to reap half-spawned child: {e}");
    }
}

/// Master side of the pty plus its input writer.
struct NativeDevice {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

impl PtyDevice for NativeDevice {
    fn write_input(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn set_size(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    fn request_graceful_close(&mut self) -> Result<(), PtyError> {
        self.write_input(&[EOF_CHAR])
    }
}

struct NativeProcess {
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl ProcessControl for NativeProcess {
    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), PtyError> {
        match self.pid {
            Some(pid) => sigkill(pid),
            None => {
                self.killer.kill()?;
                Ok(())
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), PtyError> {
        self.killer.kill()?;
        Ok(())
    }
}

/// `SIGKILL` the child and its process group. The child leads its own
/// session, so the group also holds descendants keeping the slave open.
/// A process that is already gone counts as killed.
#[cfg(unix)]
fn sigkill(pid: u32) -> Result<(), PtyError> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill(2) takes no pointers.
    if unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    // SAFETY: as above.
    if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err.into())
}

struct NativeWaiter {
    child: Box<dyn Child + Send + Sync>,
}

impl ExitWaiter for NativeWaiter {
    fn wait_exit(mut self: Box<Self>) -> Result<i32, PtyError> {
        let status = self
            .child
            .wait()
            .map_err(|e| PtyError::WaitFailed(format!("{e}")))?;
        Ok(i32::try_from(status.exit_code()).unwrap_or(i32::MAX))
    }
}

/// Reports the pty hangup that follows child exit as a clean end of stream.
struct HangupReader {
    inner: Box<dyn Read + Send>,
}

impl Read for HangupReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Err(err) if is_hangup(&err) => Ok(0),
            other => other,
        }
    }
}

/// Linux reports a closed slave end as `EIO` rather than EOF.
#[cfg(unix)]
fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
}
