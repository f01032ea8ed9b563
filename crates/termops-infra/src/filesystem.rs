//! Data-directory and workflow-directory resolution.

use std::path::{Path, PathBuf};

use termops_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TERMOPS_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `TERMOPS_DATA_DIR` environment variable
/// 2. `~/.termops`
/// 3. `./.termops`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".termops");
    }

    PathBuf::from(".termops")
}

/// Directories searched for a workflow definition, in priority order.
///
/// `./`, `./workflows`, `./.termops/workflows`, `{data_dir}/workflows`, then
/// every configured `workflow_dirs` entry. Duplicates are dropped.
pub fn workflow_search_dirs(data_dir: &Path, config: &EngineConfig) -> Vec<PathBuf> {
    let candidates = [
        PathBuf::from("."),
        PathBuf::from("workflows"),
        PathBuf::from(".termops").join("workflows"),
        data_dir.join("workflows"),
    ];

    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in candidates.into_iter().chain(config.workflow_dirs.iter().cloned()) {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}
