//! WEFT Execution Backends
//!
//! Two implementations of [`weft_dataflow::Executor`]:
//! - [`ThreadPoolExecutor`]: app bodies on a local tokio blocking pool
//! - [`HighThroughputExecutor`]: worker threads fed through an interchange
//!   with a bounded pending queue

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backlog;
pub mod config;
pub mod htex;
pub mod thread_pool;

// Re-exports
pub use config::ExecutorConfig;
pub use htex::{HighThroughputExecutor, HtexConfig};
pub use thread_pool::{ThreadPoolConfig, ThreadPoolExecutor};
