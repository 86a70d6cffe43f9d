//! Response Recovery Parser
//!
//! Turns raw model output into a structured record. Strategies run in order
//! until one produces a record:
//!
//! 1. **Direct**: strip fences, decode (retrying once with trailing commas fixed)
//! 2. **BalancedExtract**: decode the balanced `{...}` embedded in prose
//! 3. **TruncationRepair**: cut at the last complete element, close containers
//! 4. **Heuristic**: keyword headings and bullet lines
//!
//! Parsing never fails; required fields missing after any strategy are
//! backfilled with placeholders.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::heuristic::extract_sections;
use super::repair::{extract_balanced_object, fix_trailing_commas, preprocess, repair_truncated};
use super::schema::RecordSchema;
use crate::types::preview;

/// Which strategy produced the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Direct,
    BalancedExtract,
    TruncationRepair,
    Heuristic,
}

impl RecoveryStrategy {
    /// Whether the record had to be reconstructed from damaged output
    pub fn is_recovery(&self) -> bool {
        matches!(self, Self::TruncationRepair | Self::Heuristic)
    }
}

/// Parsed record plus how it was obtained
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub record: Map<String, Value>,
    /// True when the record came from truncation repair or the line heuristic
    pub recovered: bool,
    pub strategy: RecoveryStrategy,
    /// Required fields filled with placeholders
    pub backfilled: Vec<String>,
}

impl ParsedRecord {
    pub fn into_value(self) -> Value {
        Value::Object(self.record)
    }
}

/// Schema-aware recovery parser
#[derive(Debug, Clone)]
pub struct ResponseRecoveryParser {
    schema: RecordSchema,
}

impl ResponseRecoveryParser {
    pub fn new(schema: RecordSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Parse `raw` into a record. Never fails.
    pub fn parse(&self, raw: &str) -> ParsedRecord {
        let (record, strategy) = self.decode(raw);

        let mut record = record;
        let backfilled = self.schema.backfill(&mut record);

        if strategy.is_recovery() || !backfilled.is_empty() {
            warn!(
                schema = self.schema.name,
                ?strategy,
                backfilled = backfilled.len(),
                "Recovered model output"
            );
        } else {
            debug!(schema = self.schema.name, ?strategy, "Parsed model output");
        }

        ParsedRecord {
            record,
            recovered: strategy.is_recovery(),
            strategy,
            backfilled,
        }
    }

    fn decode(&self, raw: &str) -> (Map<String, Value>, RecoveryStrategy) {
        let cleaned = preprocess(raw);

        if let Some(record) = self.decode_record(&cleaned) {
            return (record, RecoveryStrategy::Direct);
        }
        if let Some(record) = self.decode_record(&fix_trailing_commas(&cleaned)) {
            return (record, RecoveryStrategy::Direct);
        }

        if let Some(candidate) = extract_balanced_object(&cleaned)
            && let Some(record) = self
                .decode_record(candidate)
                .or_else(|| self.decode_record(&fix_trailing_commas(candidate)))
        {
            return (record, RecoveryStrategy::BalancedExtract);
        }

        if let Some(repaired) = repair_truncated(&cleaned)
            && let Some(record) = self.decode_record(&repaired)
            && !record.is_empty()
        {
            return (record, RecoveryStrategy::TruncationRepair);
        }

        debug!(
            schema = self.schema.name,
            preview = %preview(&cleaned, 120),
            "Falling back to line heuristic"
        );
        (extract_sections(&cleaned, &self.schema), RecoveryStrategy::Heuristic)
    }

    /// Decode `text` into a record: an object as-is, a bare array under the
    /// schema's primary list field
    fn decode_record(&self, text: &str) -> Option<Map<String, Value>> {
        match serde_json::from_str::<Value>(text).ok()? {
            Value::Object(map) => Some(map),
            Value::Array(items) => {
                let field = self.schema.primary_list()?;
                let mut map = Map::new();
                map.insert(field.name.to_string(), Value::Array(items));
                Some(map)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::recovery::schema::{FieldSpec, is_empty_value, is_placeholder};
    use proptest::prelude::*;
    use serde_json::json;

    fn parser() -> ResponseRecoveryParser {
        ResponseRecoveryParser::new(RecordSchema::new(
            "analysis",
            vec![
                FieldSpec::text("summary"),
                FieldSpec::list("requirements"),
                FieldSpec::list("risks"),
                FieldSpec::text("timeline"),
            ],
        ))
    }

    #[test]
    fn test_direct_parse() {
        let parsed = parser().parse(
            r#"{"summary": "s", "requirements": ["r"], "risks": ["k"], "timeline": "3 months"}"#,
        );
        assert_eq!(parsed.strategy, RecoveryStrategy::Direct);
        assert!(!parsed.recovered);
        assert!(parsed.backfilled.is_empty());
    }

    #[test]
    fn test_fenced_with_trailing_comma() {
        let parsed = parser().parse("```json\n{\"summary\": \"s\", \"risks\": [\"a\",],}\n```");
        assert_eq!(parsed.strategy, RecoveryStrategy::Direct);
        assert_eq!(parsed.record["risks"], json!(["a"]));
        assert_eq!(parsed.backfilled, vec!["requirements", "timeline"]);
    }

    #[test]
    fn test_object_inside_prose() {
        let parsed = parser().parse(
            "Here is my analysis:\n{\"summary\": \"s\", \"timeline\": \"Q3\"}\nLet me know!",
        );
        assert_eq!(parsed.strategy, RecoveryStrategy::BalancedExtract);
        assert!(!parsed.recovered);
        assert_eq!(parsed.record["timeline"], "Q3");
    }

    #[test]
    fn test_truncated_output_is_repaired() {
        let parsed = parser()
            .parse(r#"{"summary": "Clinic booking app", "requirements": ["Calendar", "SMS rem"#);
        assert_eq!(parsed.strategy, RecoveryStrategy::TruncationRepair);
        assert!(parsed.recovered);
        assert_eq!(parsed.record["summary"], "Clinic booking app");
        assert_eq!(parsed.record["requirements"], json!(["Calendar"]));
        assert!(is_placeholder(&parsed.record["timeline"]));
    }

    #[test]
    fn test_plain_text_uses_heuristic() {
        let parsed = parser().parse("Summary:\nInventory tool\n\nRisks:\n- Legacy ERP integration\n");
        assert_eq!(parsed.strategy, RecoveryStrategy::Heuristic);
        assert!(parsed.recovered);
        assert_eq!(parsed.record["risks"], json!(["Legacy ERP integration"]));
    }

    #[test]
    fn test_garbage_still_yields_every_field() {
        let parsed = parser().parse("");
        assert_eq!(parsed.backfilled.len(), 4);
        assert_eq!(parsed.record["summary"], "summary unconfirmed, needs follow-up");
    }

    #[test]
    fn test_bare_array_wrapped_in_primary_list() {
        let parsed = parser().parse(r#"["Auth", "Billing"]"#);
        assert_eq!(parsed.record["requirements"], json!(["Auth", "Billing"]));
    }

    /// Build a compact object, returning the text and the byte offset at
    /// which each entry's value ends
    fn render(entries: &[(String, Value)]) -> (String, Vec<usize>) {
        let mut out = String::from("{");
        let mut ends = Vec::new();
        for (i, (key, value)) in entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&serde_json::to_string(key).unwrap());
            out.push(':');
            out.push_str(&serde_json::to_string(value).unwrap());
            ends.push(out.len());
        }
        out.push('}');
        (out, ends)
    }

    /// Nested JSON values: scalars, lists and objects up to three levels deep
    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::from),
            "\\PC{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_every_required_field_present(raw in "\\PC{0,200}") {
            let parsed = parser().parse(&raw);
            for field in &parser().schema().fields {
                let value = parsed.record.get(field.name);
                prop_assert!(value.is_some_and(|v| !v.is_null()));
                prop_assert!(!value.is_some_and(|v| v.as_str() == Some("")));
            }
        }

        #[test]
        fn prop_truncation_keeps_complete_fields(
            values in proptest::collection::vec(json_value(), 1..6),
            cut_ratio in 0.0f64..1.0,
        ) {
            let entries: Vec<(String, Value)> = values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (format!("field_{}", i), v))
                .collect();
            let (text, ends) = render(&entries);

            let mut cut = ((text.len() as f64) * cut_ratio) as usize;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            let truncated = &text[..cut.max(1)];

            let repaired = repair_truncated(truncated).unwrap();
            let value: Value = serde_json::from_str(&repaired).unwrap();
            prop_assert!(value.is_object());
            for ((key, expected), end) in entries.iter().zip(&ends) {
                // A bare number or literal is only known complete once the
                // delimiter after it has arrived
                if *end < truncated.len() {
                    prop_assert_eq!(value.get(key), Some(expected));
                }
            }
        }
    }

    #[test]
    fn test_backfilled_fields_are_empty_values() {
        let parsed = parser().parse("{}");
        for name in &parsed.backfilled {
            assert!(is_empty_value(&parsed.record[name]));
        }
    }
}
