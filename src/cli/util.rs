//! CLI Common Utilities
//!
//! Shared initialization and context management for CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::ai::create_client;
use crate::config::{Config, ConfigLoader, PROJECT_DIR};
use crate::pipeline::PipelineOrchestrator;
use crate::storage::{Database, SharedDatabase, SharedStore};
use crate::types::{IntakeError, Result};

/// Command execution context
///
/// Created via `CommandContext::load()` once the project is initialized.
#[derive(Clone)]
pub struct CommandContext {
    /// Project data directory (.intakeflow)
    pub project_dir: PathBuf,
    /// Shared database handle
    pub db: SharedDatabase,
    /// Loaded configuration
    pub config: Config,
}

impl CommandContext {
    /// Validate initialization, load config and open the database
    pub fn load() -> Result<Self> {
        let project_dir = require_initialized()?;
        let config = ConfigLoader::load()?;

        let db = Database::open(&config.storage.database_path)?;
        db.initialize()?;

        Ok(Self {
            project_dir,
            db: Arc::new(db),
            config,
        })
    }

    pub fn store(&self) -> SharedStore {
        self.db.clone()
    }

    /// Orchestrator over the configured provider; fails without an API key
    pub fn orchestrator(&self) -> Result<PipelineOrchestrator> {
        let client = create_client(&self.config.llm)?;
        Ok(PipelineOrchestrator::new(self.store(), client, &self.config))
    }
}

/// Runtime for commands that drive async pipeline stages
pub fn runtime() -> Result<Runtime> {
    Runtime::new().map_err(IntakeError::Io)
}

/// Require the project to be initialized
///
/// Returns the .intakeflow directory path, or `IntakeError::NotInitialized`.
pub fn require_initialized() -> Result<PathBuf> {
    let project_dir = Path::new(PROJECT_DIR);

    if !project_dir.exists() {
        return Err(IntakeError::NotInitialized);
    }

    Ok(project_dir.to_path_buf())
}

pub fn is_initialized() -> bool {
    Path::new(PROJECT_DIR).exists()
}
