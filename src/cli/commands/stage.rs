//! Stage Commands
//!
//! Run pipeline stages, inspect their progress, and reset failed attempts.

use std::path::Path;

use serde_json::Value;

use crate::cli::ui::Output;
use crate::cli::util::{CommandContext, runtime};
use crate::storage::SessionStore;
use crate::types::{Question, Report, Result, Stage};

/// Analyze every document of the session, or just `document_id`
pub fn analyze(session_id: &str, document_id: Option<&str>) -> Result<()> {
    let ctx = CommandContext::load()?;
    let orchestrator = ctx.orchestrator()?;
    let output = Output::new();

    let records = runtime()?.block_on(async {
        match document_id {
            Some(document_id) => orchestrator
                .start_document_analysis(session_id, document_id)
                .await
                .map(|record| vec![record]),
            None => orchestrator.analyze_documents(session_id).await,
        }
    })?;

    for record in &records {
        let note = if record.recovered { " (recovered)" } else { "" };
        output.success(&format!(
            "{} {}{}",
            record.subject_id,
            output.stage_status(record.status),
            note
        ));
    }
    print_cost(&ctx, session_id)
}

pub fn questions(session_id: &str, format: &str) -> Result<()> {
    let ctx = CommandContext::load()?;
    let orchestrator = ctx.orchestrator()?;

    let questions =
        runtime()?.block_on(orchestrator.start_question_generation(session_id))?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&questions)?);
        return Ok(());
    }
    print_questions(&questions);
    print_cost(&ctx, session_id)
}

pub fn report(session_id: &str, format: &str, out: Option<&Path>) -> Result<()> {
    let ctx = CommandContext::load()?;
    let orchestrator = ctx.orchestrator()?;

    let report = runtime()?.block_on(orchestrator.start_report_generation(session_id))?;
    emit_report(&report, format, out)?;
    print_cost(&ctx, session_id)
}

/// Run every stage in order
pub fn run(session_id: &str, format: &str, out: Option<&Path>) -> Result<()> {
    let ctx = CommandContext::load()?;
    let orchestrator = ctx.orchestrator()?;

    let report = runtime()?.block_on(orchestrator.run(session_id))?;
    emit_report(&report, format, out)?;
    print_cost(&ctx, session_id)
}

pub fn progress(session_id: &str, format: &str) -> Result<()> {
    let ctx = CommandContext::load()?;
    let orchestrator = ctx.orchestrator()?;

    let mut stages = Vec::with_capacity(Stage::ALL.len());
    for stage in Stage::ALL {
        stages.push((stage, orchestrator.get_progress(session_id, stage)?));
    }

    if format == "json" {
        let map: serde_json::Map<String, Value> = stages
            .iter()
            .map(|(stage, progress)| {
                serde_json::to_value(progress).map(|v| (stage.as_str().to_string(), v))
            })
            .collect::<std::result::Result<_, _>>()?;
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    let output = Output::new();
    output.header(&format!("Progress for session {}", session_id));
    for (stage, progress) in &stages {
        output.progress(stage.name(), progress);
    }
    Ok(())
}

pub fn reset(session_id: &str, stage: Stage, document_id: Option<&str>) -> Result<()> {
    let ctx = CommandContext::load()?;
    let orchestrator = ctx.orchestrator()?;

    let removed = orchestrator.reset_stage(session_id, stage, document_id)?;
    let output = Output::new();
    if removed == 0 {
        output.info(&format!("Nothing to reset for {}", stage.name()));
    } else {
        output.success(&format!(
            "Reset {} ({} attempt record{} cleared)",
            stage.name(),
            removed,
            if removed == 1 { "" } else { "s" }
        ));
    }
    Ok(())
}

fn print_cost(ctx: &CommandContext, session_id: &str) -> Result<()> {
    if let Some(session) = ctx.db.get_session(session_id)? {
        Output::new().field("Total cost", format!("${:.4}", session.total_cost));
    }
    Ok(())
}

fn print_questions(questions: &[Question]) {
    let output = Output::new();
    output.section("Clarifying questions");
    for question in questions {
        println!("  {}. {}", question.id, question.text);
        if !question.category.is_empty() {
            println!("     category:  {}", question.category);
        }
        if !question.rationale.is_empty() {
            println!("     rationale: {}", question.rationale);
        }
    }
}

fn emit_report(report: &Report, format: &str, out: Option<&Path>) -> Result<()> {
    let rendered = if format == "json" {
        serde_json::to_string_pretty(report)?
    } else {
        render_markdown(report)
    };

    match out {
        Some(path) => {
            std::fs::write(path, rendered)?;
            Output::new().success(&format!("Report written to {}", path.display()));
        }
        None => println!("{}", rendered),
    }

    if report.recovered {
        Output::new().warning("Parts of the report were recovered from incomplete model output");
    }
    Ok(())
}

/// Markdown rendering of the report sections
pub fn render_markdown(report: &Report) -> String {
    let mut md = format!("# Feasibility Report\n\nSession: `{}`\n", report.session_id);

    for (key, value) in &report.sections {
        md.push_str(&format!("\n## {}\n\n", title(key)));
        render_value(&mut md, value, 0);
    }
    md
}

fn title(key: &str) -> String {
    let words = key.replace('_', " ");
    let mut chars = words.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => words,
    }
}

fn render_value(md: &mut String, value: &Value, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) | Value::Array(_) => {
                        md.push_str(&format!("{}-\n", indent));
                        render_value(md, item, depth + 1);
                    }
                    other => md.push_str(&format!("{}- {}\n", indent, scalar(other))),
                }
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                match item {
                    Value::Object(_) | Value::Array(_) => {
                        md.push_str(&format!("{}- **{}**:\n", indent, title(key)));
                        render_value(md, item, depth + 1);
                    }
                    other => {
                        md.push_str(&format!("{}- **{}**: {}\n", indent, title(key), scalar(other)))
                    }
                }
            }
        }
        other => md.push_str(&format!("{}{}\n", indent, scalar(other))),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
