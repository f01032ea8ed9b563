//! Infrastructure layer for termops.
//!
//! Contains implementations of the ports defined in `termops-core`: the
//! SQLite checkpoint store, the shell command runner, plus config loading
//! and data-directory resolution.

pub mod config;
pub mod filesystem;
pub mod process;
pub mod sqlite;
