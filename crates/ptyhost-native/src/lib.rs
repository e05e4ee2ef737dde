//! ptyhost-native: the OS pseudo-terminal capability behind ptyhost sessions.
//!
//! # Architecture
//!
//! - [`PtyBackend`]: Spawns a process attached to a new pty and hands back
//!   its parts as a [`SpawnedPty`].
//! - [`PtyDevice`], [`ProcessControl`], [`ExitWaiter`]: Input/resize,
//!   forced termination and one-shot exit status, each owned separately so
//!   they can live on different threads.
//! - [`NativePtyBackend`]: The `portable-pty` implementation.

pub mod capability;
pub mod pty;

pub use capability::{ExitWaiter, ProcessControl, PtyBackend, PtyDevice, SpawnRequest, SpawnedPty};
pub use pty::{NativePtyBackend, PtyError};
