//! Workflow engine core: definition parsing, step execution, and durable
//! checkpointing.
//!
//! - `definition` -- YAML parsing, validation, filesystem discovery
//! - `expression` -- JEXL evaluator for step conditions
//! - `retry` -- Retry policy and backoff computation
//! - `checkpoint` -- Durable checkpoint manager over `CheckpointStore`
//! - `step_executor` -- Runs one command attempt with timeout and output bounds
//! - `engine` -- Run/Resume/Rollback state machine

pub mod checkpoint;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod retry;
pub mod step_executor;

pub use engine::{Engine, EngineError, EngineOptions};
