//! Shared domain types for termops.
//!
//! This crate contains the types passed between the workflow engine, its
//! storage adapter, and the CLI: workflow definitions, run state, step
//! results, lifecycle events, configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
