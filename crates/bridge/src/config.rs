use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Instructions between limit checks when no other count hook is set.
pub const DEFAULT_HOOK_INTERVAL: u32 = 10_000;

// ---------------------------------------------------------------------------
// Session config
// ---------------------------------------------------------------------------

/// Settings applied when a session opens.
///
/// Every field has a default, so a TOML document only needs the keys it
/// changes:
///
/// ```toml
/// name = "worker"
/// sandbox = true
/// memory_limit = 16777216
/// time_limit_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Label shown in logs and in `live_sessions()`.
    pub name: Option<String>,
    /// Open the engine's standard libraries.
    pub open_libs: bool,
    /// Remove `os`, `io`, `debug`, `package`, `require`, `loadfile`,
    /// `dofile` and `load` from the globals after opening libraries.
    pub sandbox: bool,
    /// Accept precompiled chunks in `load`.
    pub binary_chunks: bool,
    /// Cap on engine heap bytes. Growth past it fails with out-of-memory.
    pub memory_limit: Option<usize>,
    /// Wall-clock cap for one outermost call, in milliseconds.
    pub time_limit_ms: Option<u64>,
    /// Cap on instructions for one outermost call.
    pub instruction_limit: Option<u64>,
    /// Instructions between limit checks.
    pub hook_interval: u32,
    /// What reading an engine value with no host form produces.
    pub unrepresentable: UnrepresentablePolicy,
    /// Record an engine traceback on script faults.
    pub capture_traceback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: None,
            open_libs: true,
            sandbox: false,
            binary_chunks: false,
            memory_limit: None,
            time_limit_ms: None,
            instruction_limit: None,
            hook_interval: DEFAULT_HOOK_INTERVAL,
            unrepresentable: UnrepresentablePolicy::default(),
            capture_traceback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnrepresentablePolicy {
    /// Produce `Value::Unrepresentable(kind)`.
    #[default]
    Marker,
    /// Fail the read with `UnconvertibleType`.
    Fail,
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl SessionConfig {
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: SessionConfig =
            toml::from_str(input).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hook_interval == 0 {
            return Err(Error::Config("hook_interval must be positive".into()));
        }
        if self.memory_limit == Some(0) {
            return Err(Error::Config("memory_limit must be positive".into()));
        }
        if self.time_limit_ms == Some(0) {
            return Err(Error::Config("time_limit_ms must be positive".into()));
        }
        if self.instruction_limit == Some(0) {
            return Err(Error::Config("instruction_limit must be positive".into()));
        }
        if self.sandbox && !self.open_libs {
            log::debug!("sandbox has no effect without open_libs");
        }
        Ok(())
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_ms.map(Duration::from_millis)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn sandboxed(mut self) -> Self {
        self.sandbox = true;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_ms = Some(limit.as_millis().max(1) as u64);
        self
    }

    pub fn with_instruction_limit(mut self, instructions: u64) -> Self {
        self.instruction_limit = Some(instructions);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
