//! Per-session I/O bridge: pumps pty output into data events and turns the
//! end of the child into a single exit event.
//!
//! Each session gets its own dedicated OS thread because pty reads are
//! blocking. The thread owns the output reader, the exit waiter and the
//! session's callbacks outright, so reads never take the session lock and
//! the callbacks of one session can only ever run one at a time. The
//! thread ends after delivering the exit event; dropping the callbacks with
//! it closes any forwarding channel.

use std::io::{self, Read};
use std::sync::Arc;

use tokio::sync::mpsc;

use ptyhost_native::ExitWaiter;

use crate::event::{BridgeFailure, SessionCallbacks, SessionError};
use crate::session::{Session, UNCONFIRMED_EXIT_CODE};

/// Why the read loop stopped.
#[derive(Debug)]
enum ReadOutcome {
    /// The child side hung up.
    EndOfStream,
    /// The session was killed.
    Stopped,
    Failed(io::Error),
}

/// Start the bridge for `session` on a dedicated OS thread.
pub(crate) fn start_bridge(
    session: Arc<Session>,
    output: Box<dyn Read + Send>,
    waiter: Box<dyn ExitWaiter>,
    stop_rx: mpsc::Receiver<()>,
    callbacks: SessionCallbacks,
    buffer_size: usize,
) -> io::Result<()> {
    let name = format!("pty-io-{}", session.handle());
    std::thread::Builder::new().name(name).spawn(move || {
        run(session, output, waiter, stop_rx, callbacks, buffer_size);
    })?;
    Ok(())
}

fn run(
    session: Arc<Session>,
    mut output: Box<dyn Read + Send>,
    waiter: Box<dyn ExitWaiter>,
    mut stop_rx: mpsc::Receiver<()>,
    mut callbacks: SessionCallbacks,
    buffer_size: usize,
) {
    let handle = session.handle();
    let mut buf = vec![0u8; buffer_size.max(1)];

    let outcome = pump(&session, &mut output, &mut buf, &mut stop_rx, &mut callbacks);
    // Cancel the reader before anything else touches the session.
    drop(output);
    log::debug!("session {handle}: read loop ended ({outcome:?})");

    if let ReadOutcome::Failed(err) = outcome {
        let error = SessionError {
            kind: BridgeFailure::Read,
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        };
        log::warn!("session {handle}: {error}");
        session.record_error(error.to_string());
        callbacks.error(handle, &error);

        // Output can no longer be delivered; finish the session.
        if let Err(e) = session.kill() {
            log::warn!("session {handle}: kill after read failure failed: {e}");
        }
    }

    let exit_code = match waiter.wait_exit() {
        Ok(code) => code,
        Err(err) => {
            let error = SessionError {
                kind: BridgeFailure::Wait,
                code: err.raw_os_error().unwrap_or(-1),
                message: err.to_string(),
            };
            log::warn!("session {handle}: {error}");
            session.record_error(error.to_string());
            callbacks.error(handle, &error);
            UNCONFIRMED_EXIT_CODE
        }
    };

    if session.record_exit(exit_code) {
        log::info!("session {handle}: exited with code {exit_code}");
        callbacks.exited(handle, exit_code);
    }
}

fn pump(
    session: &Session,
    output: &mut Box<dyn Read + Send>,
    buf: &mut [u8],
    stop_rx: &mut mpsc::Receiver<()>,
    callbacks: &mut SessionCallbacks,
) -> ReadOutcome {
    loop {
        // Check for stop signal (non-blocking).
        match stop_rx.try_recv() {
            Ok(()) | Err(mpsc::error::TryRecvError::Disconnected) => return ReadOutcome::Stopped,
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        let n = match output.read(buf) {
            Ok(0) => return ReadOutcome::EndOfStream,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return ReadOutcome::Failed(err),
        };

        callbacks.data(session.handle(), &buf[..n]);
    }
}
