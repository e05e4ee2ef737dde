use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::mpsc;

use ptyhost_native::{ProcessControl, PtyDevice, PtyError};

use crate::config::SpawnConfig;
use crate::error::EngineError;
use crate::registry::Handle;

/// Exit code recorded when the OS could not confirm how the process ended,
/// typically because waiting on a force-killed child failed.
pub const UNCONFIRMED_EXIT_CODE: i32 = -1;

/// Lifecycle of a session.
///
/// `Created -> Running -> ClosingRequested -> Terminated`, where both close
/// and kill pass through `ClosingRequested` and only the bridge's exit
/// capture moves a session to `Terminated`. `Failed` is reserved for
/// sessions whose creation could not be completed.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    Created,
    Running,
    ClosingRequested,
    Terminated { exit_code: i32 },
    Failed { reason: String },
}

impl SessionPhase {
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            SessionPhase::Created | SessionPhase::Running | SessionPhase::ClosingRequested
        )
    }

    /// `true` once the phase can no longer change.
    pub fn is_finished(&self) -> bool {
        !self.is_alive()
    }
}

/// Point-in-time view of a session.
#[derive(Serialize, Clone, Debug)]
pub struct SessionInfo {
    pub handle: Handle,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub phase: SessionPhase,
    pub exit_code: Option<i32>,
    pub force_killed: bool,
    pub last_error: Option<String>,
    pub created_at: SystemTime,
    pub exited_at: Option<SystemTime>,
}

/// What has to be released when a session ends. Held in an `Option` and
/// taken by whichever of kill, failure or exit capture gets there first.
/// A kill whose termination fails puts it back.
struct Teardown {
    stop_reader: mpsc::Sender<()>,
    process: Box<dyn ProcessControl>,
}

struct SessionState {
    phase: SessionPhase,
    cols: u16,
    rows: u16,
    kill_requested: bool,
    last_error: Option<String>,
    exited_at: Option<SystemTime>,
    teardown: Option<Teardown>,
}

/// One spawned process and its pty.
///
/// Lifecycle state and the pty device sit behind separate locks, and no
/// method holds both at once: a write stuck on a full pty buffer can never
/// block `kill`, whose termination is what unsticks the write.
pub struct Session {
    handle: Handle,
    pid: Option<u32>,
    config: SpawnConfig,
    cwd: PathBuf,
    created_at: SystemTime,
    state: Mutex<SessionState>,
    device: Mutex<Option<Box<dyn PtyDevice>>>,
}

impl Session {
    pub(crate) fn new(
        handle: Handle,
        config: SpawnConfig,
        cwd: PathBuf,
        pid: Option<u32>,
        device: Box<dyn PtyDevice>,
        process: Box<dyn ProcessControl>,
        stop_reader: mpsc::Sender<()>,
    ) -> Self {
        let state = SessionState {
            phase: SessionPhase::Created,
            cols: config.cols,
            rows: config.rows,
            kill_requested: false,
            last_error: None,
            exited_at: None,
            teardown: Some(Teardown {
                stop_reader,
                process,
            }),
        };

        Self {
            handle,
            pid,
            config,
            cwd,
            created_at: SystemTime::now(),
            state: Mutex::new(state),
            device: Mutex::new(Some(device)),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.lock_state().phase.is_alive()
    }

    pub fn is_finished(&self) -> bool {
        self.lock_state().phase.is_finished()
    }

    /// The captured exit code, once the process has been seen to exit.
    pub fn exit_code(&self) -> Result<i32, EngineError> {
        match &self.lock_state().phase {
            SessionPhase::Terminated { exit_code } => Ok(*exit_code),
            _ => Err(EngineError::NotExited(self.handle)),
        }
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.lock_state();
        let exit_code = match &state.phase {
            SessionPhase::Terminated { exit_code } => Some(*exit_code),
            _ => None,
        };

        SessionInfo {
            handle: self.handle,
            pid: self.pid,
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            cwd: self.cwd.clone(),
            cols: state.cols,
            rows: state.rows,
            phase: state.phase.clone(),
            exit_code,
            force_killed: state.kill_requested,
            last_error: state.last_error.clone(),
            created_at: self.created_at,
            exited_at: state.exited_at,
        }
    }

    /// Inject raw bytes into the child's input.
    pub fn write(&self, data: &[u8]) -> Result<(), EngineError> {
        self.ensure_accepting_input()?;

        let mut device = self.lock_device();
        let device = device.as_mut().ok_or(EngineError::NotRunning(self.handle))?;
        device.write_input(data).map_err(|e| {
            self.note_error(&e);
            EngineError::Io(e)
        })
    }

    /// Change the pty viewport. Only the recorded size changes on success.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), EngineError> {
        self.ensure_accepting_input()?;
        if cols == 0 || rows == 0 {
            return Err(EngineError::InvalidSize { cols, rows });
        }

        {
            let mut device = self.lock_device();
            let device = device.as_mut().ok_or(EngineError::NotRunning(self.handle))?;
            device.set_size(cols, rows).map_err(|e| {
                self.note_error(&e);
                EngineError::Resize(e)
            })?;
        }

        let mut state = self.lock_state();
        state.cols = cols;
        state.rows = rows;
        Ok(())
    }

    /// Ask the child to exit on its own. A no-op once closing, killed or
    /// finished.
    pub fn close(&self) -> Result<(), EngineError> {
        let previous = {
            let mut state = self.lock_state();
            match state.phase {
                SessionPhase::Created | SessionPhase::Running if !state.kill_requested => {}
                _ => return Ok(()),
            }
            std::mem::replace(&mut state.phase, SessionPhase::ClosingRequested)
        };

        let result = match self.lock_device().as_mut() {
            Some(device) => device.request_graceful_close(),
            // A racing kill already released the pty; the end state is on its way.
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                log::info!("session {}: graceful close requested", self.handle);
                Ok(())
            }
            Err(e) => {
                let mut state = self.lock_state();
                state.last_error = Some(e.to_string());
                if state.phase == SessionPhase::ClosingRequested && !state.kill_requested {
                    state.phase = previous;
                }
                Err(EngineError::Io(e))
            }
        }
    }

    /// Force-terminate the child and release the pty right away. The exit
    /// code still arrives through the bridge. A no-op if already killed or
    /// finished. If termination fails the session keeps its phase and can
    /// be killed again.
    pub fn kill(&self) -> Result<(), EngineError> {
        let mut teardown = {
            let mut state = self.lock_state();
            if state.phase.is_finished() || state.kill_requested {
                return Ok(());
            }
            match state.teardown.take() {
                Some(teardown) => teardown,
                // Another kill is in flight.
                None => return Ok(()),
            }
        };

        log::info!("session {}: kill requested", self.handle);
        if let Err(e) = teardown.process.terminate() {
            log::warn!("session {}: terminate failed: {e}", self.handle);
            let leftover = {
                let mut state = self.lock_state();
                if state.phase.is_alive() {
                    state.last_error = Some(e.to_string());
                    state.teardown = Some(teardown);
                    return Err(EngineError::Io(e));
                }
                teardown
            };
            // The exit was captured meanwhile; finish its release.
            let _ = self.release(leftover, false);
            return Ok(());
        }

        {
            let mut state = self.lock_state();
            state.kill_requested = true;
            if state.phase.is_alive() {
                state.phase = SessionPhase::ClosingRequested;
            }
        }
        self.release(teardown, false).map_err(|e| {
            self.note_error(&e);
            EngineError::Io(e)
        })
    }

    /// Record the process's exit. Only the first call has any effect;
    /// returns whether this call captured the code.
    pub(crate) fn record_exit(&self, exit_code: i32) -> bool {
        let teardown = {
            let mut state = self.lock_state();
            if state.phase.is_finished() {
                return false;
            }
            state.phase = SessionPhase::Terminated { exit_code };
            state.exited_at = Some(SystemTime::now());
            state.teardown.take()
        };

        if let Some(teardown) = teardown {
            if let Err(e) = self.release(teardown, false) {
                log::warn!("session {}: release after exit failed: {e}", self.handle);
            }
        }
        true
    }

    /// Abandon a session whose creation could not be finished.
    pub(crate) fn fail(&self, reason: String) {
        let teardown = {
            let mut state = self.lock_state();
            state.last_error = Some(reason.clone());
            state.phase = SessionPhase::Failed { reason };
            state.teardown.take()
        };

        if let Some(teardown) = teardown {
            if let Err(e) = self.release(teardown, true) {
                log::warn!("session {}: release after failure failed: {e}", self.handle);
            }
        }
    }

    pub(crate) fn record_error(&self, message: String) {
        self.lock_state().last_error = Some(message);
    }

    /// Created becomes Running; any later phase is left alone.
    pub(crate) fn mark_running(&self) {
        let mut state = self.lock_state();
        if state.phase == SessionPhase::Created {
            state.phase = SessionPhase::Running;
        }
    }

    fn ensure_accepting_input(&self) -> Result<(), EngineError> {
        let state = self.lock_state();
        match state.phase {
            SessionPhase::Running | SessionPhase::ClosingRequested if !state.kill_requested => {
                Ok(())
            }
            _ => Err(EngineError::NotRunning(self.handle)),
        }
    }

    /// Stop the reader, optionally terminate, close the pty, drop the
    /// process handle. In that order.
    fn release(&self, teardown: Teardown, terminate: bool) -> Result<(), PtyError> {
        let Teardown {
            stop_reader,
            mut process,
        } = teardown;

        let _ = stop_reader.try_send(());
        drop(stop_reader);

        let result = if terminate { process.terminate() } else { Ok(()) };

        drop(self.lock_device().take());
        drop(process);
        result
    }

    fn note_error(&self, err: &PtyError) {
        self.lock_state().last_error = Some(err.to_string());
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_device(&self) -> MutexGuard<'_, Option<Box<dyn PtyDevice>>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
