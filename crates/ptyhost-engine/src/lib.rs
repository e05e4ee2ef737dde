//! ptyhost-engine: handle-addressed pseudo-terminal sessions.
//!
//! Callers spawn a program on a pty, then address it only through the
//! opaque [`Handle`] they get back: write input, resize, close gracefully,
//! force-kill, and query the exit code. Output and the exit notification are
//! delivered through the [`SessionCallbacks`] given at creation.
//!
//! # Architecture
//!
//! - [`PtyEngine`]: the public facade. Validates requests, owns the registry.
//! - [`Registry`]: handle allocation and lookup. Handles are never reused.
//! - [`Session`]: lifecycle state machine for one process and its pty.
//! - `bridge`: one OS thread per session pumping output into events and
//!   capturing the exit status exactly once.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod registry;
pub mod session;

mod bridge;
#[cfg(test)]
mod testing;

pub use config::{EngineConfig, RetentionPolicy, SpawnConfig};
pub use engine::{CreatedSession, PtyEngine};
pub use error::EngineError;
pub use event::{BridgeFailure, SessionCallbacks, SessionError, SessionEvent};
pub use registry::{Handle, Registry};
pub use session::{Session, SessionInfo, SessionPhase, UNCONFIRMED_EXIT_CODE};
