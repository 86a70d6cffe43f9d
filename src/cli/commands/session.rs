//! Session Commands
//!
//! Create intake sessions and inspect their state.

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::storage::SessionStore;
use crate::types::{IntakeError, Result, Session, Stage};

pub fn create(id: Option<String>) -> Result<()> {
    let ctx = CommandContext::load()?;
    let session = Session::new(id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
    ctx.db.create_session(&session)?;

    Output::new().success(&format!("Created session {}", session.id));
    Ok(())
}

pub fn show(session_id: &str, format: &str) -> Result<()> {
    let ctx = CommandContext::load()?;
    let session = ctx
        .db
        .get_session(session_id)?
        .ok_or_else(|| IntakeError::NotFound(format!("Session {}", session_id)))?;
    let documents = ctx.db.list_documents(session_id)?;

    let mut stages = Vec::new();
    for stage in Stage::ALL {
        stages.extend(ctx.db.list_stage_records(session_id, stage)?);
    }

    if format == "json" {
        let status = serde_json::json!({
            "session": session,
            "documents": documents
                .iter()
                .map(|d| serde_json::json!({ "id": d.id, "filename": d.filename }))
                .collect::<Vec<_>>(),
            "stages": stages,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let output = Output::new();
    output.header(&format!("Session {}", session.id));
    output.field("Status", output.session_status(session.status));
    output.field("Total cost", format!("${:.4}", session.total_cost));
    output.field("Created", session.created_at.format("%Y-%m-%d %H:%M:%S"));

    output.section("Documents");
    if documents.is_empty() {
        println!("  (none)");
    }
    for document in &documents {
        println!("  {}  {}", document.id, document.filename);
    }

    output.section("Stage records");
    if stages.is_empty() {
        println!("  (none)");
    }
    for record in &stages {
        let subject = documents
            .iter()
            .find(|d| d.id == record.subject_id)
            .map(|d| d.filename.as_str())
            .unwrap_or("session");
        println!(
            "  {:<20} {:<24} {:<12} attempt {}{}",
            record.stage.as_str(),
            subject,
            output.stage_status(record.status),
            record.attempts,
            if record.recovered { " (recovered)" } else { "" }
        );
        if let Some(error) = &record.error {
            println!("    {}", error);
        }
    }

    Ok(())
}
