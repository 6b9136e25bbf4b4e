//! Text-field detection for JSONL corpora.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Candidate text fields, highest priority first.
pub const PREFERRED_TEXT_FIELDS: [&str; 7] =
    ["text", "completion", "output", "response", "content", "message", "answer"];

/// Number of non-blank lines inspected when sniffing.
pub const SNIFF_SAMPLE_LINES: usize = 200;

pub const DEFAULT_TEXT_FIELD: &str = "text";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub format: String,
    /// Field name to declared type, in declaration order.
    pub fields: Map<String, Value>,
}

impl Schema {
    #[must_use]
    pub fn jsonl_text(field: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(field.to_string(), Value::String("string".to_string()));
        Self { format: "jsonl".to_string(), fields }
    }

    /// First field declared as `string`, or `text` when none is.
    #[must_use]
    pub fn text_field(&self) -> &str {
        self.fields
            .iter()
            .find(|(_, ty)| ty.as_str().is_some_and(|t| t.eq_ignore_ascii_case("string")))
            .map_or(DEFAULT_TEXT_FIELD, |(name, _)| name.as_str())
    }
}

/// Decide which field of a JSONL file carries the trainable text.
///
/// Reads up to [`SNIFF_SAMPLE_LINES`] non-blank lines. The first name of
/// [`PREFERRED_TEXT_FIELDS`] holding a non-blank string anywhere in the sample
/// wins; otherwise the first non-blank string field encountered is used;
/// otherwise (including an unreadable file) the schema defaults to `text`.
pub fn sniff_schema(path: &Path) -> Schema {
    let Ok(file) = File::open(path) else {
        tracing::debug!(path = %path.display(), "cannot open corpus for sniffing; defaulting to text");
        return Schema::jsonl_text(DEFAULT_TEXT_FIELD);
    };
    sniff_reader(BufReader::new(file))
}

fn sniff_reader<R: BufRead>(reader: R) -> Schema {
    let mut preferred_hits = [false; PREFERRED_TEXT_FIELDS.len()];
    let mut fallback: Option<String> = None;
    let mut seen = 0usize;

    for line in reader.split(b'\n') {
        let Ok(line) = line else {
            break;
        };
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        seen += 1;

        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) {
            for (i, name) in PREFERRED_TEXT_FIELDS.iter().enumerate() {
                if obj.get(*name).is_some_and(is_non_blank_string) {
                    preferred_hits[i] = true;
                }
            }
            if fallback.is_none() {
                fallback = obj.iter().find(|(_, v)| is_non_blank_string(v)).map(|(k, _)| k.clone());
            }
        }

        if seen >= SNIFF_SAMPLE_LINES {
            break;
        }
    }

    let chosen = PREFERRED_TEXT_FIELDS
        .iter()
        .zip(preferred_hits)
        .find(|(_, hit)| *hit)
        .map(|(name, _)| (*name).to_string())
        .or(fallback)
        .unwrap_or_else(|| DEFAULT_TEXT_FIELD.to_string());

    Schema::jsonl_text(&chosen)
}

fn is_non_blank_string(value: &Value) -> bool {
    value.as_str().is_some_and(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sniff(content: &str) -> String {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.jsonl");
        std::fs::write(&path, content).unwrap();
        sniff_schema(&path).text_field().to_string()
    }

    #[test]
    fn test_prefers_text_over_completion() {
        assert_eq!(sniff("{\"completion\":\"a\",\"text\":\"b\"}\n"), "text");
    }

    #[test]
    fn test_priority_applies_across_whole_sample() {
        let content = "{\"body\":\"first\"}\n{\"answer\":\"x\"}\n{\"content\":\"y\"}\n";
        assert_eq!(sniff(content), "content");
    }

    #[test]
    fn test_blank_priority_value_is_ignored() {
        assert_eq!(sniff("{\"text\":\"   \",\"response\":\"ok\"}\n"), "response");
    }

    #[test]
    fn test_fallback_to_first_string_field() {
        assert_eq!(sniff("{\"id\":3,\"body\":\"hello\",\"title\":\"t\"}\n"), "body");
    }

    #[test]
    fn test_defaults_when_no_strings() {
        assert_eq!(sniff("not json\n{\"n\":1}\n\n"), "text");
    }

    #[test]
    fn test_unreadable_file_defaults_to_text() {
        let temp = TempDir::new().unwrap();
        let schema = sniff_schema(&temp.path().join("missing.jsonl"));
        assert_eq!(schema, Schema::jsonl_text("text"));
    }

    #[test]
    fn test_sample_is_bounded() {
        let mut content = String::new();
        for _ in 0..SNIFF_SAMPLE_LINES {
            content.push_str("{\"body\":\"x\"}\n");
        }
        content.push_str("{\"text\":\"late\"}\n");
        assert_eq!(sniff(&content), "body");
    }

    #[test]
    fn test_text_field_falls_back_when_no_string_type() {
        let mut fields = Map::new();
        fields.insert("n".to_string(), Value::String("int".to_string()));
        let schema = Schema { format: "jsonl".to_string(), fields };
        assert_eq!(schema.text_field(), "text");
    }
}
