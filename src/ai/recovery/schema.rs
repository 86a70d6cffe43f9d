//! Expected record shapes and required-field backfill
//!
//! A [`RecordSchema`] names the fields a stage expects in its model output.
//! After any successful decode, fields that are absent, null, an empty string
//! or an empty list are filled with a placeholder so downstream consumers can
//! rely on every required field being present.

use serde_json::{Map, Value, json};

/// Suffix of every placeholder value
const PLACEHOLDER_SUFFIX: &str = " unconfirmed, needs follow-up";

/// Shape of one required field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text
    Text,
    /// List of items (strings or objects)
    List,
    /// Nested object
    Object,
}

/// One required field of a record
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Extra heading keywords recognized by the line heuristic
    pub keywords: &'static [&'static str],
}

impl FieldSpec {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            keywords: &[],
        }
    }

    pub const fn list(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::List,
            keywords: &[],
        }
    }

    pub const fn object(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Object,
            keywords: &[],
        }
    }

    pub const fn with_keywords(mut self, keywords: &'static [&'static str]) -> Self {
        self.keywords = keywords;
        self
    }

    /// Human-readable label: `risk_factors` -> `risk factors`
    pub fn label(&self) -> String {
        self.name.replace('_', " ")
    }

    /// Placeholder value of the right shape for this field
    pub fn placeholder(&self) -> Value {
        let text = placeholder_text(self.name);
        match self.kind {
            FieldKind::Text => Value::String(text),
            FieldKind::List => json!([text]),
            FieldKind::Object => json!({ "summary": text }),
        }
    }
}

/// Required fields of one record type
#[derive(Debug, Clone)]
pub struct RecordSchema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl RecordSchema {
    pub fn new(name: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self { name, fields }
    }

    /// First list field, used to wrap a bare top-level array
    pub fn primary_list(&self) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.kind == FieldKind::List)
    }

    /// Example JSON shape for prompts
    pub fn shape_hint(&self) -> Value {
        let mut shape = Map::new();
        for field in &self.fields {
            let example = match field.kind {
                FieldKind::Text => Value::String(String::from("...")),
                FieldKind::List => json!(["..."]),
                FieldKind::Object => json!({}),
            };
            shape.insert(field.name.to_string(), example);
        }
        Value::Object(shape)
    }

    /// Fill every missing or empty required field with its placeholder.
    ///
    /// Returns the names of the fields that were filled.
    pub fn backfill(&self, record: &mut Map<String, Value>) -> Vec<String> {
        let mut filled = Vec::new();
        for field in &self.fields {
            let missing = record.get(field.name).is_none_or(is_empty_value);
            if missing {
                record.insert(field.name.to_string(), field.placeholder());
                filled.push(field.name.to_string());
            }
        }
        filled
    }
}

/// Placeholder text for `field`
pub fn placeholder_text(field: &str) -> String {
    format!("{}{}", field, PLACEHOLDER_SUFFIX)
}

/// Whether `value` is a placeholder string
pub fn is_placeholder(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.ends_with(PLACEHOLDER_SUFFIX))
}

/// Null, blank string, empty list, empty object, or a placeholder (also a
/// list or object holding only placeholders)
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty() || is_placeholder(value),
        Value::Array(items) => items.iter().all(is_empty_value),
        Value::Object(map) => map.values().all(is_empty_value),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> RecordSchema {
        RecordSchema::new(
            "analysis",
            vec![
                FieldSpec::text("summary"),
                FieldSpec::list("requirements"),
                FieldSpec::object("budget"),
            ],
        )
    }

    #[test]
    fn test_backfill_missing_and_empty() {
        let mut record = json!({
            "summary": "",
            "requirements": [],
            "extra": 1
        })
        .as_object()
        .cloned()
        .unwrap();

        let filled = schema().backfill(&mut record);
        assert_eq!(filled, vec!["summary", "requirements", "budget"]);
        assert_eq!(record["summary"], "summary unconfirmed, needs follow-up");
        assert_eq!(
            record["requirements"],
            json!(["requirements unconfirmed, needs follow-up"])
        );
        assert!(is_placeholder(&record["budget"]["summary"]));
        assert_eq!(record["extra"], 1);
    }

    #[test]
    fn test_backfill_keeps_present_fields() {
        let mut record = json!({
            "summary": "A booking platform",
            "requirements": ["auth"],
            "budget": {"amount": 50000}
        })
        .as_object()
        .cloned()
        .unwrap();
        assert!(schema().backfill(&mut record).is_empty());
    }

    #[test]
    fn test_empty_value_rules() {
        assert!(is_empty_value(&Value::Null));
        assert!(is_empty_value(&json!("  ")));
        assert!(is_empty_value(&json!([])));
        assert!(is_empty_value(&json!(["x unconfirmed, needs follow-up"])));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!(["real"])));
    }
}
