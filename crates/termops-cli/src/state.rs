//! Application state wiring the engine to its infra implementations.
//!
//! The engine is generic over its store and command runner; AppState pins
//! them to SQLite and the shell runner.

use std::path::PathBuf;

use termops_core::event::EventBus;
use termops_core::workflow::{Engine, EngineOptions};
use termops_infra::config::load_engine_config;
use termops_infra::filesystem::{resolve_data_dir, workflow_search_dirs};
use termops_infra::process::ShellCommandRunner;
use termops_infra::sqlite::checkpoint::SqliteCheckpointStore;
use termops_infra::sqlite::pool::{DatabasePool, database_url};
use termops_types::config::EngineConfig;

/// Engine pinned to the concrete infra implementations.
pub type ConcreteEngine = Engine<SqliteCheckpointStore, ShellCommandRunner>;

/// Shared state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub store: SqliteCheckpointStore,
}

impl AppState {
    /// Initialize the application state: resolve the data directory, load
    /// config, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let store = SqliteCheckpointStore::new(db_pool);

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            data_dir,
            config,
            store,
        })
    }

    /// Build an engine publishing to `bus`.
    pub fn engine(&self, bus: EventBus) -> ConcreteEngine {
        Engine::new(
            self.store.clone(),
            ShellCommandRunner::from_config(&self.config),
            bus,
            EngineOptions::from(&self.config),
        )
    }

    /// Event bus sized from config.
    pub fn event_bus(&self) -> EventBus {
        EventBus::new(self.config.event_history)
    }

    /// Directories searched when locating a run's workflow file.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        workflow_search_dirs(&self.data_dir, &self.config)
    }
}
