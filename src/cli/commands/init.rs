//! Init Command
//!
//! Initialize intakeflow in the current directory.

use crate::cli::ui::Output;
use crate::config::{ConfigLoader, PROJECT_DIR};
use crate::storage::Database;
use crate::types::{IntakeError, Result};

pub fn run(force: bool) -> Result<()> {
    let root = std::env::current_dir()?;
    let project_dir = root.join(PROJECT_DIR);

    if project_dir.exists() && !force {
        return Err(IntakeError::Config(
            "Already initialized. Use --force to overwrite.".to_string(),
        ));
    }

    ConfigLoader::init_project(&root, force)?;

    let config = ConfigLoader::load()?;
    let db = Database::open(&config.storage.database_path)?;
    db.initialize()?;

    let output = Output::new();
    output.success(&format!("Initialized intakeflow in {}/", PROJECT_DIR));
    output.field("Database", config.storage.database_path.display());
    println!();
    println!("Next steps:");
    println!("  1. intakeflow session create");
    println!("  2. intakeflow document add <SESSION> <FILE>...");
    println!("  3. intakeflow run <SESSION>");

    Ok(())
}
