//! CLI command implementations.
//!
//! | Module    | Commands handled            |
//! |-----------|-----------------------------|
//! | `run`     | `Run`, `Stop`               |
//! | `inspect` | `Scene`, `Records`, `Config` |

pub mod inspect;
pub mod run;

use std::sync::Arc;

use anyhow::{Context, Result};

use chaos_engine::config::EngineConfig;
use chaos_engine::repository::{Repositories, SqliteRepository};

pub use inspect::{cmd_config, cmd_records, cmd_scene};
pub use run::{cmd_run, cmd_stop};

/// Repositories for the configured database, or in memory when there is none.
fn open_repositories(config: &EngineConfig) -> Result<Repositories> {
    match &config.storage.database {
        Some(path) => {
            let store = SqliteRepository::open(path)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            Ok(Repositories::from_store(Arc::new(store)))
        }
        None => Ok(Repositories::in_memory()),
    }
}

/// Like `open_repositories`, for commands that read state left by an earlier run.
fn require_repositories(config: &EngineConfig) -> Result<Repositories> {
    if config.storage.database.is_none() {
        anyhow::bail!("No database configured: pass --database or set [storage].database");
    }
    open_repositories(config)
}
