//! Events a session delivers to its consumer, and the subscriptions that
//! receive them.
//!
//! Events are produced on the session's bridge thread, one at a time, so the
//! callbacks of a single session never run concurrently with each other.
//! `SessionEvent` is serialized as tagged JSON for hosts that forward events
//! over IPC.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::registry::Handle;

/// Which part of the bridge failed.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BridgeFailure {
    /// Reading child output failed for a reason other than the child exiting.
    Read,
    /// The OS could not report the child's exit status.
    Wait,
}

/// Payload of an error event.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionError {
    pub kind: BridgeFailure,
    /// OS error number when known, otherwise `-1`.
    pub code: i32,
    pub message: String,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            BridgeFailure::Read => "read",
            BridgeFailure::Wait => "wait",
        };
        write!(f, "{what} failed (code {}): {}", self.code, self.message)
    }
}

/// Events sent from a session to its consumer.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Output bytes, in the order the child produced them.
    Data { handle: Handle, bytes: Vec<u8> },
    /// The child exited. Always the last event of a session.
    Exited { handle: Handle, exit_code: i32 },
    Error {
        handle: Handle,
        kind: BridgeFailure,
        code: i32,
        message: String,
    },
}

type DataFn = Box<dyn FnMut(&[u8]) + Send>;
type ExitFn = Box<dyn FnMut(i32) + Send>;
type ErrorFn = Box<dyn FnMut(&SessionError) + Send>;

/// Per-session subscriptions. Every part is optional: a session with no
/// callbacks still tracks its lifecycle and exit code.
#[derive(Default)]
pub struct SessionCallbacks {
    on_data: Option<DataFn>,
    on_exit: Option<ExitFn>,
    on_error: Option<ErrorFn>,
    forward: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriptions that forward every event into a fresh channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new().forward_to(tx), rx)
    }

    pub fn on_data(mut self, callback: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.on_data = Some(Box::new(callback));
        self
    }

    pub fn on_exit(mut self, callback: impl FnMut(i32) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnMut(&SessionError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Also push events into `sender`. Several sessions may share one
    /// receiver; events carry their handle.
    pub fn forward_to(mut self, sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.forward = Some(sender);
        self
    }

    pub(crate) fn data(&mut self, handle: Handle, bytes: &[u8]) {
        if let Some(callback) = self.on_data.as_mut() {
            guarded(handle, "data", || callback(bytes));
        }
        self.forward(SessionEvent::Data {
            handle,
            bytes: bytes.to_vec(),
        });
    }

    pub(crate) fn exited(&mut self, handle: Handle, exit_code: i32) {
        if let Some(callback) = self.on_exit.as_mut() {
            guarded(handle, "exit", || callback(exit_code));
        }
        self.forward(SessionEvent::Exited { handle, exit_code });
    }

    pub(crate) fn error(&mut self, handle: Handle, error: &SessionError) {
        if let Some(callback) = self.on_error.as_mut() {
            guarded(handle, "error", || callback(error));
        }
        self.forward(SessionEvent::Error {
            handle,
            kind: error.kind,
            code: error.code,
            message: error.message.clone(),
        });
    }

    fn forward(&mut self, event: SessionEvent) {
        let Some(sender) = self.forward.as_ref() else {
            return;
        };
        if sender.send(event).is_err() {
            // Receiver dropped; stop cloning output for nobody.
            self.forward = None;
        }
    }
}

/// Run a user callback, containing any panic to that one invocation.
fn guarded(handle: Handle, event: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        log::error!("session {handle}: {event} callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_callbacks_receive_payloads() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (d, e, r) = (Arc::clone(&seen), Arc::clone(&seen), Arc::clone(&seen));
        let mut callbacks = SessionCallbacks::new()
            .on_data(move |bytes| d.lock().unwrap().push(format!("data:{}", String::from_utf8_lossy(bytes))))
            .on_exit(move |code| e.lock().unwrap().push(format!("exit:{code}")))
            .on_error(move |err| r.lock().unwrap().push(format!("error:{}", err.code)));

        let handle = Handle::from_raw(1);
        callbacks.data(handle, b"hi");
        callbacks.error(
            handle,
            &SessionError {
                kind: BridgeFailure::Read,
                code: 5,
                message: "boom".to_string(),
            },
        );
        callbacks.exited(handle, 0);

        assert_eq!(*seen.lock().unwrap(), vec!["data:hi", "error:5", "exit:0"]);
    }

    #[test]
    fn test_channel_forwards_in_order() {
        let (mut callbacks, mut rx) = SessionCallbacks::channel();
        let handle = Handle::from_raw(3);

        callbacks.data(handle, b"a");
        callbacks.data(handle, b"b");
        callbacks.exited(handle, 2);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Data {
                handle,
                bytes: b"a".to_vec()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Data {
                handle,
                bytes: b"b".to_vec()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Exited {
                handle,
                exit_code: 2
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_tolerated() {
        let (mut callbacks, rx) = SessionCallbacks::channel();
        drop(rx);
        callbacks.data(Handle::from_raw(1), b"nobody listening");
        callbacks.exited(Handle::from_raw(1), 0);
        assert!(callbacks.forward.is_none());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let exits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&exits);
        let mut callbacks = SessionCallbacks::new()
            .on_data(|_| panic!("consumer bug"))
            .on_exit(move |_| *counter.lock().unwrap() += 1);

        callbacks.data(Handle::from_raw(1), b"x");
        callbacks.data(Handle::from_raw(1), b"y");
        callbacks.exited(Handle::from_raw(1), 0);

        assert_eq!(*exits.lock().unwrap(), 1);
    }

    #[test]
    fn test_event_serializes_as_tagged_json() {
        let event = SessionEvent::Exited {
            handle: Handle::from_raw(9),
            exit_code: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Exited");
        assert_eq!(json["handle"], 9);
        assert_eq!(json["exit_code"], 1);

        let event = SessionEvent::Error {
            handle: Handle::from_raw(9),
            kind: BridgeFailure::Read,
            code: -1,
            message: "broken".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Error");
        assert_eq!(json["kind"], "read");
    }
}
