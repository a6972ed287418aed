//! Serializable executor selection.

use crate::htex::{HighThroughputExecutor, HtexConfig};
use crate::thread_pool::{ThreadPoolConfig, ThreadPoolExecutor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use weft_dataflow::Executor;

/// One configured backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// Local thread pool
    ThreadPool(ThreadPoolConfig),
    /// Interchange-fed workers
    Htex(HtexConfig),
}

impl ExecutorConfig {
    /// Routing label
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::ThreadPool(config) => &config.label,
            Self::Htex(config) => &config.label,
        }
    }

    /// Construct the backend, not yet started
    #[must_use]
    pub fn build(&self) -> Arc<dyn Executor> {
        match self {
            Self::ThreadPool(config) => Arc::new(ThreadPoolExecutor::new(config.clone())),
            Self::Htex(config) => Arc::new(HighThroughputExecutor::new(config.clone())),
        }
    }
}
