//! Prompt Builder and Stage Schemas
//!
//! Prompts pass the document text, prior stage results and the expected JSON
//! shape; each stage's [`RecordSchema`] doubles as the backfill contract for
//! the recovery parser.

use serde_json::{Map, Value};

use crate::ai::{CompletionRequest, FieldSpec, RecordSchema};
use crate::constants::pipeline::MAX_DOCUMENT_CHARS;
use crate::types::{Document, Question};

const SYSTEM_PROMPT: &str = "You are a senior solution architect assessing incoming software \
     project requests. Respond with a single JSON object and nothing else.";

// =============================================================================
// Prompt Builder
// =============================================================================

#[derive(Debug, Clone)]
enum PromptSection {
    Role { expertise: String, task: String },
    Objectives(Vec<String>),
    Context(Vec<(String, String)>),
    Text { header: String, content: String },
    Schema(Value),
}

/// Builder for consistently structured prompts
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<PromptSection>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, expertise: &str, task: &str) -> Self {
        self.sections.push(PromptSection::Role {
            expertise: expertise.to_string(),
            task: task.to_string(),
        });
        self
    }

    pub fn objectives(mut self, objectives: &[&str]) -> Self {
        self.sections.push(PromptSection::Objectives(
            objectives.iter().map(|o| o.to_string()).collect(),
        ));
        self
    }

    /// Add a context item; items share one context section in insertion order
    pub fn context_item(mut self, key: &str, value: &str) -> Self {
        let item = (key.to_string(), value.to_string());
        match self.sections.iter_mut().find_map(|s| match s {
            PromptSection::Context(items) => Some(items),
            _ => None,
        }) {
            Some(items) => items.push(item),
            None => self.sections.push(PromptSection::Context(vec![item])),
        }
        self
    }

    pub fn section(mut self, header: &str, content: &str) -> Self {
        self.sections.push(PromptSection::Text {
            header: header.to_string(),
            content: content.to_string(),
        });
        self
    }

    pub fn output_schema(mut self, schema: &RecordSchema) -> Self {
        self.sections.push(PromptSection::Schema(schema.shape_hint()));
        self
    }

    pub fn build(self) -> String {
        let mut prompt = String::new();

        for section in self.sections {
            match section {
                PromptSection::Role { expertise, task } => {
                    prompt.push_str("<ROLE>\n");
                    prompt.push_str(&format!(
                        "You are an expert {} specializing in {}.\n",
                        expertise, task
                    ));
                    prompt.push_str("</ROLE>\n\n");
                }
                PromptSection::Objectives(objectives) => {
                    prompt.push_str("<OBJECTIVES>\n");
                    for (i, obj) in objectives.iter().enumerate() {
                        prompt.push_str(&format!("{}. {}\n", i + 1, obj));
                    }
                    prompt.push_str("</OBJECTIVES>\n\n");
                }
                PromptSection::Context(items) => {
                    prompt.push_str("# Context\n\n");
                    for (key, value) in items {
                        prompt.push_str(&format!("**{}**: {}\n", key, value));
                    }
                    prompt.push('\n');
                }
                PromptSection::Text { header, content } => {
                    prompt.push_str(&format!("# {}\n\n", header));
                    prompt.push_str(&content);
                    prompt.push_str("\n\n");
                }
                PromptSection::Schema(shape) => {
                    prompt.push_str("# Output\n\nReturn JSON with exactly this shape:\n```json\n");
                    prompt.push_str(
                        &serde_json::to_string_pretty(&shape).unwrap_or_else(|_| shape.to_string()),
                    );
                    prompt.push_str("\n```\n\n");
                }
            }
        }

        prompt.trim_end().to_string()
    }

    /// Finish as a completion request with the shared system prompt
    pub fn into_request(self) -> CompletionRequest {
        CompletionRequest::new(self.build()).with_system(SYSTEM_PROMPT)
    }
}

// =============================================================================
// Stage Schemas
// =============================================================================

pub fn document_analysis_schema() -> RecordSchema {
    RecordSchema::new(
        "document_analysis",
        vec![
            FieldSpec::text("summary").with_keywords(&["overview"]),
            FieldSpec::list("requirements").with_keywords(&["feature", "functional"]),
            FieldSpec::list("constraints").with_keywords(&["budget", "deadline", "limitation"]),
            FieldSpec::list("risks").with_keywords(&["concern", "issue"]),
            FieldSpec::list("stakeholders").with_keywords(&["users", "audience"]),
        ],
    )
}

pub fn questions_schema() -> RecordSchema {
    RecordSchema::new(
        "question_generation",
        vec![FieldSpec::list("questions").with_keywords(&["clarif"])],
    )
}

/// Report phase names, in execution order
pub const REPORT_PHASES: [&str; 3] = ["overview", "technical", "delivery"];

pub fn report_phase_schema(phase: &str) -> RecordSchema {
    match phase {
        "overview" => RecordSchema::new(
            "report_overview",
            vec![
                FieldSpec::text("executive_summary").with_keywords(&["summary"]),
                FieldSpec::object("project_scope").with_keywords(&["scope"]),
                FieldSpec::list("objectives").with_keywords(&["goal"]),
            ],
        ),
        "technical" => RecordSchema::new(
            "report_technical",
            vec![
                FieldSpec::text("architecture"),
                FieldSpec::list("technology_stack").with_keywords(&["technolog", "stack"]),
                FieldSpec::list("integrations").with_keywords(&["integration", "third party"]),
                FieldSpec::list("technical_risks").with_keywords(&["risk"]),
            ],
        ),
        _ => RecordSchema::new(
            "report_delivery",
            vec![
                FieldSpec::text("timeline").with_keywords(&["schedule", "milestone"]),
                FieldSpec::object("effort_estimate").with_keywords(&["effort", "estimate", "cost"]),
                FieldSpec::list("team").with_keywords(&["staff", "roles"]),
                FieldSpec::text("feasibility").with_keywords(&["verdict"]),
                FieldSpec::list("recommendations").with_keywords(&["next step"]),
            ],
        ),
    }
}

// =============================================================================
// Stage Prompts
// =============================================================================

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

pub fn document_analysis_prompt(document: &Document, schema: &RecordSchema) -> CompletionRequest {
    PromptBuilder::new()
        .role("solution architect", "project intake analysis")
        .objectives(&[
            "Summarize what the client wants built",
            "List functional requirements and hard constraints",
            "Flag delivery risks and the people involved",
        ])
        .context_item("Document", &document.filename)
        .section(
            "Document",
            truncate_chars(&document.content, MAX_DOCUMENT_CHARS),
        )
        .output_schema(schema)
        .into_request()
}

pub fn questions_prompt(analyses: &[Value], schema: &RecordSchema) -> CompletionRequest {
    PromptBuilder::new()
        .role("solution architect", "requirements discovery")
        .objectives(&[
            "Find gaps and ambiguities across the document analyses",
            "Ask the client the questions that most reduce estimate uncertainty",
            "Give each question a category and a one-line rationale",
        ])
        .context_item("Documents analyzed", &analyses.len().to_string())
        .section("Document analyses", &to_json(&analyses))
        .section(
            "Question format",
            r#"Each entry of "questions" is {"text": "...", "category": "...", "rationale": "..."}"#,
        )
        .output_schema(schema)
        .into_request()
}

pub fn report_phase_prompt(
    phase: &str,
    analyses: &[Value],
    questions: &[Question],
    merged_so_far: &Map<String, Value>,
    schema: &RecordSchema,
) -> CompletionRequest {
    let goal = format!("Write the {} part of the feasibility report", phase);
    let mut builder = PromptBuilder::new()
        .role("solution architect", "software project feasibility reports")
        .objectives(&[
            goal.as_str(),
            "Stay consistent with the report sections already written",
            "Mark anything the documents do not support as an open question",
        ])
        .context_item("Report phase", phase)
        .context_item("Clarifying questions", &questions.len().to_string())
        .section("Document analyses", &to_json(&analyses));

    if !questions.is_empty() {
        builder = builder.section("Open questions", &to_json(&questions));
    }
    if !merged_so_far.is_empty() {
        builder = builder.section("Report so far", &to_json(merged_so_far));
    }

    builder.output_schema(schema).into_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_prompt() {
        let prompt = PromptBuilder::new()
            .role("solution architect", "intake")
            .objectives(&["Read", "Summarize"])
            .build();

        assert!(prompt.contains("<ROLE>"));
        assert!(prompt.contains("solution architect"));
        assert!(prompt.contains("1. Read"));
        assert!(prompt.contains("2. Summarize"));
    }

    #[test]
    fn test_context_items_keep_order() {
        let prompt = PromptBuilder::new()
            .context_item("Client", "Acme")
            .context_item("Budget", "50k")
            .build();

        let client = prompt.find("**Client**: Acme").unwrap();
        let budget = prompt.find("**Budget**: 50k").unwrap();
        assert!(client < budget);
        assert_eq!(prompt.matches("# Context").count(), 1);
    }

    #[test]
    fn test_document_prompt_carries_shape() {
        let doc = Document::new("s1", "brief.md", "Build a clinic booking app");
        let request = document_analysis_prompt(&doc, &document_analysis_schema());
        assert!(request.prompt.contains("Build a clinic booking app"));
        assert!(request.prompt.contains("\"requirements\""));
        assert!(!request.system.is_empty());
    }

    #[test]
    fn test_report_prompt_includes_prior_phases() {
        let mut merged = Map::new();
        merged.insert("executive_summary".into(), Value::String("Booking app".into()));
        let request = report_phase_prompt(
            "technical",
            &[],
            &[],
            &merged,
            &report_phase_schema("technical"),
        );
        assert!(request.prompt.contains("Report so far"));
        assert!(request.prompt.contains("Booking app"));
        assert!(request.prompt.contains("\"technology_stack\""));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
