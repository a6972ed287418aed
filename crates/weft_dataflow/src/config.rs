//! Kernel configuration.

use crate::error::DataflowError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When successful results are persisted to the checkpoint store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Never consult or write checkpoints
    None,
    /// Persist each result as its task completes
    #[default]
    TaskExit,
    /// Buffer results and persist them at shutdown
    RunExit,
    /// Buffer results until `Kernel::checkpoint` is called
    Manual,
}

impl CheckpointMode {
    /// Whether checkpoints are consulted at all
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Executor for tasks that name none; first registered if unset
    pub default_executor: Option<String>,
    /// Default retry bound per task
    pub retries: u32,
    /// Checkpoint persistence mode
    pub checkpoint_mode: CheckpointMode,
    /// Whether tasks are checkpointed unless they opt out
    pub checkpoint_by_default: bool,
    /// Scheduler loop threads
    pub submission_threads: usize,
    /// Upper bound on a draining shutdown, in milliseconds
    pub shutdown_timeout_ms: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_executor: None,
            retries: 0,
            checkpoint_mode: CheckpointMode::default(),
            checkpoint_by_default: false,
            submission_threads: 1,
            shutdown_timeout_ms: None,
        }
    }
}

impl KernelConfig {
    /// Default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default executor label
    #[must_use]
    pub fn with_default_executor(mut self, label: impl Into<String>) -> Self {
        self.default_executor = Some(label.into());
        self
    }

    /// Set the default retry bound
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the checkpoint mode
    #[must_use]
    pub fn with_checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    /// Checkpoint every task unless it opts out
    #[must_use]
    pub fn with_checkpoint_by_default(mut self, enabled: bool) -> Self {
        self.checkpoint_by_default = enabled;
        self
    }

    /// Set the number of scheduler threads
    #[must_use]
    pub fn with_submission_threads(mut self, threads: usize) -> Self {
        self.submission_threads = threads;
        self
    }

    /// Bound a draining shutdown
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Draining shutdown bound
    #[must_use]
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_ms.map(Duration::from_millis)
    }

    /// Parse from JSON; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for malformed JSON or invalid values
    pub fn from_json(json: &str) -> Result<Self, DataflowError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DataflowError::Configuration(format!("invalid kernel config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first invalid field
    pub fn validate(&self) -> Result<(), DataflowError> {
        if self.submission_threads == 0 {
            return Err(DataflowError::Configuration(
                "submission_threads must be at least 1".to_string(),
            ));
        }
        if let Some(label) = &self.default_executor {
            if label.is_empty() {
                return Err(DataflowError::Configuration(
                    "default_executor must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.retries, 0);
        assert_eq!(config.checkpoint_mode, CheckpointMode::TaskExit);
        assert_eq!(config.submission_threads, 1);
        assert!(config.shutdown_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = KernelConfig::from_json(r#"{"retries": 3, "checkpoint_mode": "run_exit"}"#).unwrap();
        assert_eq!(config.retries, 3);
        assert_eq!(config.checkpoint_mode, CheckpointMode::RunExit);
        assert!(!config.checkpoint_by_default);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(KernelConfig::from_json("{").is_err());
        assert!(KernelConfig::from_json(r#"{"submission_threads": 0}"#).is_err());
        assert!(KernelConfig::from_json(r#"{"checkpoint_mode": "sometimes"}"#).is_err());
    }

    #[test]
    fn test_builder() {
        let config = KernelConfig::new()
            .with_default_executor("htex")
            .with_retries(2)
            .with_checkpoint_mode(CheckpointMode::Manual)
            .with_submission_threads(4)
            .with_shutdown_timeout(Duration::from_secs(2));
        assert_eq!(config.default_executor.as_deref(), Some("htex"));
        assert_eq!(config.shutdown_timeout(), Some(Duration::from_secs(2)));
        assert!(config.checkpoint_mode.is_enabled());
        assert!(!CheckpointMode::None.is_enabled());
    }
}
