//! Line-oriented section extraction
//!
//! Last-resort recovery for output that is not JSON at all (or too broken to
//! repair): headings that name a schema field start a section, and bullet or
//! text lines underneath become that field's content. `field: value` lines
//! are captured directly.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::schema::{FieldKind, FieldSpec, RecordSchema};

/// `## Heading`, `**Heading**`, `Heading:` on a line of its own
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:#{1,6}\s*)?(?:\*\*|__)?\s*([A-Za-z][A-Za-z0-9 _/&-]{1,60}?)\s*(?:\*\*|__)?\s*:?\s*(?:\*\*|__)?$")
        .expect("heading regex is valid")
});

/// `- item`, `* item`, `• item`, `1. item`, `2) item`
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•+]|\d+[.)])\s+(.+)$").expect("bullet regex is valid"));

/// `key: value` and `"key": "value",`
static INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:[-*•]\s+)?(?:\*\*)?"?([A-Za-z][A-Za-z0-9 _-]{1,40})"?(?:\*\*)?\s*:\s*(.+)$"#)
        .expect("inline regex is valid")
});

fn normalize(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '#')
        .to_lowercase()
        .replace(['_', '-'], " ")
}

/// Field a heading refers to: exact label, label contained in the heading,
/// or one of the field's keywords
fn match_field<'a>(schema: &'a RecordSchema, heading: &str) -> Option<&'a FieldSpec> {
    let heading = normalize(heading);
    if heading.is_empty() {
        return None;
    }

    schema
        .fields
        .iter()
        .find(|f| f.label() == heading)
        .or_else(|| schema.fields.iter().find(|f| heading.contains(&f.label())))
        .or_else(|| {
            schema
                .fields
                .iter()
                .find(|f| f.keywords.iter().any(|k| heading.contains(k)))
        })
}

/// Unmarked lines only count as headings when they name a field exactly
fn is_marked_heading(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("**") || line.starts_with("__") || line.ends_with(':')
}

/// Strip JSON-ish punctuation left around an item
fn clean_item(text: &str) -> String {
    text.trim()
        .trim_end_matches(',')
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

fn push_value(record: &mut Map<String, Value>, field: &FieldSpec, text: &str) {
    let text = clean_item(text);
    if text.is_empty() || text == "[" || text == "{" {
        return;
    }

    match field.kind {
        FieldKind::List => {
            let entry = record
                .entry(field.name.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(Value::String(text));
            }
        }
        FieldKind::Text => append_text(record, field.name, &text),
        FieldKind::Object => {
            let entry = record
                .entry(field.name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = entry {
                append_text(map, "summary", &text);
            }
        }
    }
}

fn append_text(map: &mut Map<String, Value>, key: &str, text: &str) {
    match map.get_mut(key) {
        Some(Value::String(existing)) if !existing.is_empty() => {
            existing.push(' ');
            existing.push_str(text);
        }
        _ => {
            map.insert(key.to_string(), Value::String(text.to_string()));
        }
    }
}

/// Extract schema fields from free-form text
pub fn extract_sections(raw: &str, schema: &RecordSchema) -> Map<String, Value> {
    let mut record = Map::new();
    let mut current: Option<&FieldSpec> = None;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("```") || matches!(line, "{" | "}" | "[" | "]") {
            continue;
        }

        if let Some(caps) = BULLET_RE.captures(line) {
            if let Some(field) = current {
                push_value(&mut record, field, &caps[1]);
            }
            continue;
        }

        if let Some(caps) = HEADING_RE.captures(line)
            && let Some(field) = match_field(schema, &caps[1])
            && (is_marked_heading(line) || normalize(&caps[1]) == field.label())
        {
            current = Some(field);
            continue;
        }

        if let Some(caps) = INLINE_RE.captures(line)
            && let Some(field) = match_field(schema, &caps[1])
        {
            current = Some(field);
            push_value(&mut record, field, &caps[2]);
            continue;
        }

        if let Some(field) = current {
            push_value(&mut record, field, line);
        }
    }

    record
}
