//! # Structured Extraction
//!
//! Strict "JSON or explicit failure" parsing of model output. Models are
//! instructed to answer with a single JSON object; this module tolerates
//! exactly two cosmetic wrappers (a markdown code fence and surrounding
//! prose) and nothing else. Anything that doesn't parse into the target
//! shape is an error the caller's retry policy deals with.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Parse model output into a typed payload.
pub fn parse_payload<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value = parse_value(text)?;
    serde_json::from_value(value).context("model output did not match the expected shape")
}

/// Parse model output into a JSON value.
pub fn parse_value(text: &str) -> Result<Value> {
    let candidate = strip_code_fence(text.trim());

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Ok(value);
    }

    // Single fallback: the first balanced JSON object embedded in prose.
    let embedded = first_balanced_object(candidate)
        .ok_or_else(|| anyhow!("model output contained no JSON object"))?;
    serde_json::from_str(embedded).context("embedded JSON object failed to parse")
}

/// Strip a single surrounding markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let without_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed,
    };
    match without_open.rfind("```") {
        Some(idx) => without_open[..idx].trim(),
        None => without_open.trim(),
    }
}

/// Locate the first balanced `{...}` region, respecting string literals.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_plain_json() {
        let s: Sample = parse_payload(r#"{"name": "a", "count": 2}"#).unwrap();
        assert_eq!(s.name, "a");
        assert_eq!(s.count, 2);
    }

    #[test]
    fn test_fenced_json() {
        let text = "```json\n{\"name\": \"b\", \"count\": 3}\n```";
        let s: Sample = parse_payload(text).unwrap();
        assert_eq!(s.name, "b");
    }

    #[test]
    fn test_json_embedded_in_prose() {
        let text = "Here is the result you asked for:\n{\"name\": \"c\", \"count\": 1}\nLet me know!";
        let s: Sample = parse_payload(text).unwrap();
        assert_eq!(s.name, "c");
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"note {"name": "has } brace", "count": 7} trailing"#;
        let s: Sample = parse_payload(text).unwrap();
        assert_eq!(s.name, "has } brace");
        assert_eq!(s.count, 7);
    }

    #[test]
    fn test_no_json_is_an_error() {
        assert!(parse_payload::<Sample>("I could not find anyone, sorry.").is_err());
    }

    #[test]
    fn test_wrong_shape_is_an_error() {
        assert!(parse_payload::<Sample>(r#"{"unexpected": true}"#).is_err());
    }
}
