//! Configuration Management
//!
//! Unified configuration system with hierarchical resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/intakeflow/config.toml)
//! 3. Project config (.intakeflow/config.toml)
//! 4. Environment variables (INTAKEFLOW_*)

mod loader;
mod types;

pub use loader::{ConfigLoader, PROJECT_DIR};
pub use types::*;
