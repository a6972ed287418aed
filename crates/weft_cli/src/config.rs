//! Configuration file for the `weft` binary.

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use weft_dataflow::KernelConfig;
use weft_executors::{ExecutorConfig, HtexConfig, ThreadPoolConfig};

/// Kernel, executors and checkpoint database in one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    /// Kernel settings
    pub kernel: KernelConfig,
    /// Backends, in registration order
    pub executors: Vec<ExecutorConfig>,
    /// Checkpoint database; results are only reused within a run when unset
    pub checkpoint_db: Option<PathBuf>,
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default().with_default_executor("htex"),
            executors: vec![
                ExecutorConfig::ThreadPool(ThreadPoolConfig::default()),
                ExecutorConfig::Htex(HtexConfig::default()),
            ],
            checkpoint_db: None,
        }
    }
}

impl WeftConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .wrap_err_with(|| format!("invalid config {}", path.display()))?;
        config.kernel.validate()?;
        Ok(config)
    }

    /// Executor labels in registration order
    pub fn labels(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.label().to_string()).collect()
    }
}
