//! Document Command
//!
//! Attach document text to a session.

use std::path::PathBuf;

use tracing::info;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::storage::SessionStore;
use crate::types::{Document, Result, ResultExt};

pub fn add(session_id: &str, files: &[PathBuf]) -> Result<()> {
    let ctx = CommandContext::load()?;
    let output = Output::new();

    for path in files {
        let content = std::fs::read_to_string(path)
            .with_context_fn(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();

        let document = Document::new(session_id, filename, content);
        ctx.db.add_document(&document)?;
        info!(document_id = %document.id, chars = document.content.len(), "Added document");

        output.success(&format!("Added {} ({})", document.filename, document.id));
    }

    Ok(())
}
