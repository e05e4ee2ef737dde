use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use ptyhost_native::{NativePtyBackend, PtyBackend, PtyError, SpawnedPty};

use crate::bridge::start_bridge;
use crate::config::{EngineConfig, RetentionPolicy, SpawnConfig};
use crate::error::EngineError;
use crate::event::SessionCallbacks;
use crate::registry::{Handle, Registry};
use crate::session::{Session, SessionInfo};

/// Returned by [`PtyEngine::create`].
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedSession {
    pub handle: Handle,
    /// OS process id, informational only.
    pub pid: Option<u32>,
}

/// Public face of the session engine. Every operation addresses a session
/// by [`Handle`]; raw OS resources never leave the engine.
///
/// All methods take `&self`, so an engine can be shared behind an `Arc`.
/// Dropping the engine force-kills every session still alive.
pub struct PtyEngine {
    backend: Arc<dyn PtyBackend>,
    registry: Registry<Session>,
    config: EngineConfig,
}

impl PtyEngine {
    /// An engine over the platform pty with default settings.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_backend(Arc::new(NativePtyBackend::new()), config)
    }

    pub fn with_backend(backend: Arc<dyn PtyBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            registry: Registry::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn `config.command` on a new pty and start delivering its events
    /// to `callbacks`.
    ///
    /// On failure no handle becomes resolvable and nothing the backend
    /// allocated is left running.
    pub fn create(
        &self,
        config: SpawnConfig,
        callbacks: SessionCallbacks,
    ) -> Result<CreatedSession, EngineError> {
        let request = config.to_request()?;
        let SpawnedPty {
            pid,
            device,
            process,
            waiter,
            output,
        } = self.backend.spawn(&request).map_err(|e| {
            log::warn!("failed to spawn {}: {e}", request.command);
            EngineError::Spawn(e)
        })?;

        // Register before the bridge starts, so every event it delivers
        // names a handle that already resolves.
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let (handle, session) = self.registry.register(|handle| {
            Session::new(
                handle,
                config,
                request.cwd.clone(),
                pid,
                device,
                process,
                stop_tx,
            )
        });

        if let Err(e) = start_bridge(
            Arc::clone(&session),
            output,
            waiter,
            stop_rx,
            callbacks,
            self.config.read_buffer_size,
        ) {
            let reason = format!("failed to start I/O thread: {e}");
            log::error!("session {handle}: {reason}");
            session.fail(reason.clone());
            self.registry.forget(handle);
            return Err(EngineError::Spawn(PtyError::SpawnFailed(reason)));
        }
        session.mark_running();

        log::info!(
            "session {handle}: spawned {} (pid {pid:?}) at {}x{}",
            request.command,
            request.cols,
            request.rows
        );
        Ok(CreatedSession { handle, pid })
    }

    /// Inject raw bytes into the child's input.
    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<(), EngineError> {
        self.session(handle)?.write(data)
    }

    pub fn resize(&self, handle: Handle, cols: u16, rows: u16) -> Result<(), EngineError> {
        self.session(handle)?.resize(cols, rows)
    }

    /// Request graceful termination. Succeeds without effect if the session
    /// is already closing or finished.
    pub fn close(&self, handle: Handle) -> Result<(), EngineError> {
        self.session(handle)?.close()
    }

    /// Force-terminate. Succeeds without effect if already killed or
    /// finished.
    pub fn kill(&self, handle: Handle) -> Result<(), EngineError> {
        self.session(handle)?.kill()
    }

    /// `false` for unknown handles and finished sessions.
    pub fn is_alive(&self, handle: Handle) -> bool {
        self.registry
            .resolve(handle)
            .map_or(false, |session| session.is_alive())
    }

    pub fn exit_code(&self, handle: Handle) -> Result<i32, EngineError> {
        let code = self.session(handle)?.exit_code()?;
        if self.config.retention == RetentionPolicy::EvictAfterExitCodeRead
            && self.registry.forget(handle).is_some()
        {
            log::debug!("session {handle}: evicted after exit code was read");
        }
        Ok(code)
    }

    pub fn info(&self, handle: Handle) -> Result<SessionInfo, EngineError> {
        Ok(self.session(handle)?.info())
    }

    /// Handles currently resolvable, ascending.
    pub fn handles(&self) -> Vec<Handle> {
        self.registry.handles()
    }

    /// Evict a finished session. Its handle stops resolving for good.
    pub fn reclaim(&self, handle: Handle) -> Result<(), EngineError> {
        let session = self.session(handle)?;
        if !session.is_finished() {
            return Err(EngineError::NotExited(handle));
        }
        self.registry.forget(handle);
        log::debug!("session {handle}: reclaimed");
        Ok(())
    }

    /// Evict every finished session, returning how many were removed.
    pub fn reclaim_terminated(&self) -> usize {
        let evicted = self.registry.forget_where(Session::is_finished);
        if evicted > 0 {
            log::debug!("reclaimed {evicted} finished sessions");
        }
        evicted
    }

    /// Force-kill every live session.
    pub fn shutdown(&self) {
        for session in self.registry.entries() {
            if let Err(e) = session.kill() {
                log::warn!("session {}: kill during shutdown failed: {e}", session.handle());
            }
        }
    }

    fn session(&self, handle: Handle) -> Result<Arc<Session>, EngineError> {
        self.registry
            .resolve(handle)
            .ok_or(EngineError::InvalidHandle(handle))
    }
}

impl Default for PtyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PtyEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
