//! # AI worker management
//!
//! Governs a catalogue of AI worker definitions and the conversational
//! instances spawned from them.
//!
//! ## Components
//!
//! * [`manager::AIWorkerManager`]: definitions, live instances and the
//!   task-execution entry points behind one lock
//! * [`rate_limit::WorkerRateTracker`]: per-definition rolling windows
//! * [`performance`]: task records and aggregate summaries
//! * [`persistence`]: the definitions and performance JSON files
//!
//! Definitions are loaded from JSON; instances live only in memory and
//! leave a [`types::RetiredInstanceInfo`] in the performance file when they
//! are retired.
pub mod auth;
pub mod error;
pub mod manager;
pub mod performance;
pub mod persistence;
pub mod rate_limit;
pub mod types;

pub use error::{WorkerError, WorkerResult};
pub use manager::{AIWorkerManager, TaskOutput};
pub use rate_limit::WorkerRateTracker;
pub use types::*;
