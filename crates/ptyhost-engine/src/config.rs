//! Session and engine configuration.
//!
//! Both structs deserialize from the JSON options object a host binding
//! passes in, with every field optional except the command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ptyhost_native::SpawnRequest;

use crate::error::EngineError;

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 25;

/// Default size of the bridge's read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 65536;

/// What to spawn and how. Immutable once a session is created from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Working directory. `None` means the caller's current directory.
    pub cwd: Option<PathBuf>,
    /// Complete child environment. `None` inherits the caller's environment.
    pub env: Option<BTreeMap<String, String>>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl SpawnConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    /// Set one variable. The first call switches the child from the
    /// inherited environment to an explicit one.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Parse the JSON options form, e.g. `{"command": "sh", "args": ["-c", "ls"]}`.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.command.trim().is_empty() {
            return Err(EngineError::InvalidConfig("command is required".to_string()));
        }
        if self.cols == 0 || self.rows == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "terminal size must be positive, got {}x{}",
                self.cols, self.rows
            )));
        }
        Ok(())
    }

    /// Fill in caller defaults and produce the request for the backend.
    pub(crate) fn to_request(&self) -> Result<SpawnRequest, EngineError> {
        self.validate()?;

        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().map_err(|e| {
                EngineError::InvalidConfig(format!("cannot determine current directory: {e}"))
            })?,
        };

        Ok(SpawnRequest {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd,
            env: self
                .env
                .as_ref()
                .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            cols: self.cols,
            rows: self.rows,
        })
    }
}

/// When terminated sessions leave the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep every session until `reclaim` or `reclaim_terminated` is called.
    #[default]
    KeepUntilReclaimed,
    /// Evict a session as soon as its exit code has been read once.
    EvictAfterExitCodeRead,
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes requested per read from a session's pty.
    pub read_buffer_size: usize,
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        if config.read_buffer_size == 0 {
            return Err(EngineError::InvalidConfig(
                "read_buffer_size must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}
