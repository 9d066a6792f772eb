//! Trial store configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use hs_types::{config_error, HsResult};

/// Heartbeat timeouts below this many seconds are likely to kill healthy jobs.
pub const AGGRESSIVE_TIMEOUT_SECS: u64 = 60;

/// Which experiment a store tracks, and how stalled jobs are handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database / namespace the experiment lives in.
    pub db_name: String,
    /// Experiment key.
    pub exp_name: String,
    /// Seconds without a heartbeat after which a running job is reaped.
    /// `None` disables reaping.
    #[serde(default)]
    pub kill_timeout: Option<u64>,
}

impl StoreConfig {
    pub fn new(db_name: impl Into<String>, exp_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            exp_name: exp_name.into(),
            kill_timeout: None,
        }
    }

    pub fn with_kill_timeout(mut self, seconds: u64) -> Self {
        self.kill_timeout = Some(seconds);
        self
    }

    pub fn from_json_file(path: &Path) -> HsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HsResult<()> {
        if self.db_name.trim().is_empty() {
            return Err(config_error!("db_name is required"));
        }
        if self.exp_name.trim().is_empty() {
            return Err(config_error!("exp_name is required"));
        }
        if self.kill_timeout == Some(0) {
            return Err(config_error!("kill_timeout must be positive"));
        }
        Ok(())
    }

    /// Whether the configured timeout is short enough to be suspicious.
    pub fn has_aggressive_timeout(&self) -> bool {
        self.kill_timeout
            .is_some_and(|timeout| timeout < AGGRESSIVE_TIMEOUT_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(StoreConfig::new("db", "exp").validate().is_ok());
        assert!(StoreConfig::new("", "exp").validate().is_err());
        assert!(StoreConfig::new("db", " ").validate().is_err());
        assert!(StoreConfig::new("db", "exp")
            .with_kill_timeout(0)
            .validate()
            .is_err());
    }

    #[test]
    fn aggressive_timeout_flag() {
        assert!(!StoreConfig::new("db", "exp").has_aggressive_timeout());
        assert!(StoreConfig::new("db", "exp")
            .with_kill_timeout(30)
            .has_aggressive_timeout());
        assert!(!StoreConfig::new("db", "exp")
            .with_kill_timeout(600)
            .has_aggressive_timeout());
    }

    #[test]
    fn loads_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"db_name": "db", "exp_name": "exp", "kill_timeout": 3600}"#)
            .unwrap();
        let config = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(config.kill_timeout, Some(3600));

        std::fs::write(&path, r#"{"db_name": "db", "exp_name": ""}"#).unwrap();
        assert!(StoreConfig::from_json_file(&path).is_err());
    }
}
