// File: src/config.rs

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Error;

/// Largest TTL chrono can represent in seconds.
const MAX_TTL_SECS: u64 = (i64::MAX / 1000) as u64;

/// Runtime settings, usually read from a JSON file and then overridden from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick_interval_ms: u64,
    pub max_ticks: Option<u64>,
    /// Idle time after which a conversation is forgotten. `None` keeps them for the
    /// lifetime of their session.
    pub conversation_ttl_secs: Option<u64>,
    pub event_buffer_size: usize,
    /// Account URIs, e.g. `irc://nick@irc.example.net`.
    pub accounts: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_ticks: None,
            conversation_ttl_secs: Some(30 * 60),
            event_buffer_size: 10000,
            accounts: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!("(RuntimeConfig) loading {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        let config: RuntimeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.event_buffer_size == 0 {
            return Err(Error::Config("event_buffer_size must be at least 1".into()));
        }
        if self.conversation_ttl_secs == Some(0) {
            return Err(Error::Config("conversation_ttl_secs must be positive; omit it to disable eviction".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn conversation_ttl(&self) -> Option<chrono::Duration> {
        self.conversation_ttl_secs
            .map(|secs| chrono::Duration::seconds(secs.min(MAX_TTL_SECS) as i64))
    }
}
