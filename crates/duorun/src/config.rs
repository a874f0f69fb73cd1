//! # Host configuration
//!
//! Every knob the runtime reads. Loading the text from disk is the embedder's
//! business; [`HostConfig::from_json`] only parses it.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug)]
pub enum Error {
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "Config parse error: {}", e),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Version token every request must echo; a mismatch forces a peer reload.
    pub version: String,
    /// Idle seconds before a session may be evicted. `None` keeps sessions forever.
    pub idle_timeout_secs: Option<u64>,
    /// Deadline for one queued task. `None` lets a task run indefinitely.
    pub task_timeout_ms: Option<u64>,
    /// Length of freshly issued identity tokens.
    pub token_length: usize,
    /// Re-run `on_new_client` hooks when a session is rebuilt from a peer's
    /// installed list. Off by default since those hooks may have external effects.
    pub replay_new_client_on_resync: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            idle_timeout_secs: Some(30 * 60),
            task_timeout_ms: Some(30_000),
            token_length: 32,
            replay_new_client_on_resync: false,
        }
    }
}

impl HostConfig {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(Error::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(Error::Invalid("version must not be empty".into()));
        }
        if self.token_length < 16 {
            return Err(Error::Invalid(format!("token_length {} is below 16", self.token_length)));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout_ms = timeout.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout_secs = timeout.map(|d| d.as_secs());
        self
    }
}
