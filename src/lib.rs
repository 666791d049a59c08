//! # scriptworks
//!
//! An embedded statement interpreter with structured error handling, and a
//! manager for pools of AI workers that scripts can drive through tools.
//!
//! ## Layout
//!
//! * [`ast`]: the already-parsed statement and expression tree
//! * [`eval`]: expression and statement evaluation, placeholders, procedures
//! * [`tools`]: the `tool.<namespace>.<name>` registry, including `aiworker.*`
//! * [`worker`]: worker definitions, instances, rate limits, performance logs
//! * [`llm`]: the LLM client seam shared by both halves
//!
//! Logging goes through `tracing`; binaries and tests install a subscriber.
pub mod ast;
pub mod config;
pub mod error;
pub mod eval;
pub mod llm;
pub mod tools;
pub mod worker;

// Re-exports
pub use ast::*;
pub use error::*;
pub use eval::evaluator::Evaluator;
pub use tools::ToolRegistry;
pub use worker::manager::AIWorkerManager;
