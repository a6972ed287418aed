//! High-throughput executor.
//!
//! ```text
//! submit ──► task pipe ──► interchange ──► worker inbox ──► worker
//!                               ▲                              │
//!                               └──────── work request ◄───────┤
//! Completion ◄── queue management ◄── results pipe ◄───────────┘
//! ```

mod executor;
mod interchange;
pub mod messages;
mod pipes;
mod worker;

pub use executor::{HighThroughputExecutor, HtexConfig};
pub use messages::{MessageError, PackedCall, ResultMessage, TaskMessage};
