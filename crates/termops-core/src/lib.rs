//! Business logic and port definitions for termops.
//!
//! This crate defines the "ports" (`CheckpointStore`, `CommandRunner`) that
//! the infrastructure layer implements, plus the workflow engine that drives
//! them. It depends only on `termops-types` -- never on `termops-infra` or
//! any database/process crate.

pub mod event;
pub mod repository;
pub mod runner;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
