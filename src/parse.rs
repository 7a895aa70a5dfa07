//! Parsing of oracle responses.
//!
//! Models wrap JSON in code fences or prose often enough that every parser
//! first isolates the outermost JSON object before deserializing it.

use crate::oracle::client::truncate_str;
use crate::oracle::router::Difficulty;
use serde_json::Value;

/// Oracle verdict on whether a registry outcome is patient-reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationVerdict {
    pub is_pro: bool,
    pub instrument: String,
    pub reason: String,
}

/// Oracle verdict on which candidate matches a registry outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchVerdict {
    /// Ordinal of the chosen candidate, or negative for no match.
    pub match_number: i64,
    pub has_changed: bool,
}

impl MatchVerdict {
    pub const NO_MATCH: i64 = -1;

    /// The claimed candidate ordinal, if the oracle found a match.
    ///
    /// Fails when the ordinal is too large to name any outcome.
    pub fn counterpart(&self) -> anyhow::Result<Option<u32>> {
        if self.match_number < 0 {
            return Ok(None);
        }
        u32::try_from(self.match_number)
            .map(Some)
            .map_err(|_| anyhow::anyhow!("match number {} is out of range", self.match_number))
    }
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Find the first balanced `{...}` object, ignoring braces inside strings.
fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&content[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the JSON object carried by a response.
pub fn parse_json_object(response: &str) -> anyhow::Result<serde_json::Map<String, Value>> {
    let clean = strip_markdown_fences(response);
    let fragment = extract_json_object(clean).ok_or_else(|| {
        anyhow::anyhow!(
            "response contains no JSON object: {}",
            truncate_str(clean, 200)
        )
    })?;
    match serde_json::from_str::<Value>(fragment) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(anyhow::anyhow!("response JSON is not an object")),
        Err(e) => Err(anyhow::anyhow!(
            "response JSON could not be parsed ({}): {}",
            e,
            truncate_str(fragment, 200)
        )),
    }
}

fn lenient_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn lenient_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            // 3.0 is accepted, 2.7 and values beyond i64 are not.
            let f = n.as_f64()?;
            (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_field(map: &serde_json::Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Parse `{"is_pro": bool, "instrument": str, "reason": str}`.
pub fn parse_classification(response: &str) -> anyhow::Result<ClassificationVerdict> {
    let map = parse_json_object(response)?;
    let is_pro = map
        .get("is_pro")
        .and_then(lenient_bool)
        .ok_or_else(|| anyhow::anyhow!("classification is missing a boolean 'is_pro'"))?;
    Ok(ClassificationVerdict {
        is_pro,
        instrument: text_field(&map, "instrument"),
        reason: text_field(&map, "reason"),
    })
}

/// Parse `{"match_number": int, "has_changed": bool}`.
pub fn parse_match(response: &str) -> anyhow::Result<MatchVerdict> {
    let map = parse_json_object(response)?;
    let match_number = map
        .get("match_number")
        .and_then(lenient_int)
        .ok_or_else(|| anyhow::anyhow!("match verdict is missing an integer 'match_number'"))?;
    let has_changed = match map.get("has_changed") {
        Some(value) => lenient_bool(value)
            .ok_or_else(|| anyhow::anyhow!("match verdict has a non-boolean 'has_changed'"))?,
        None if match_number < 0 => false,
        None => return Err(anyhow::anyhow!("match verdict is missing 'has_changed'")),
    };
    Ok(MatchVerdict {
        match_number,
        has_changed,
    })
}

/// Parse `{"difficulty": "easy" | "moderate" | "hard"}`.
pub fn parse_difficulty(response: &str) -> Option<Difficulty> {
    let map = parse_json_object(response).ok()?;
    map.get("difficulty")?.as_str().and_then(Difficulty::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_from_fenced_json() {
        let response = "```json\n{\"is_pro\": true, \"instrument\": \"EQ-5D\", \"reason\": \"Self-reported.\"}\n```";
        let verdict = parse_classification(response).unwrap();
        assert!(verdict.is_pro);
        assert_eq!(verdict.instrument, "EQ-5D");
        assert_eq!(verdict.reason, "Self-reported.");
    }

    #[test]
    fn classification_tolerates_null_instrument_and_string_bool() {
        let verdict = parse_classification(r#"{"is_pro": "no", "instrument": null, "reason": "Lab value"}"#).unwrap();
        assert!(!verdict.is_pro);
        assert_eq!(verdict.instrument, "");
    }

    #[test]
    fn classification_requires_is_pro() {
        assert!(parse_classification(r#"{"reason": "?"}"#).is_err());
        assert!(parse_classification("I think it is a PRO").is_err());
    }

    #[test]
    fn match_verdict_with_surrounding_prose() {
        let verdict = parse_match("Here you go: {\"match_number\": 3, \"has_changed\": false} hope it helps").unwrap();
        assert_eq!(verdict.counterpart().unwrap(), Some(3));
        assert!(!verdict.has_changed);
    }

    #[test]
    fn no_match_sentinel() {
        let verdict = parse_match(r#"{"match_number": -1}"#).unwrap();
        assert_eq!(verdict.match_number, MatchVerdict::NO_MATCH);
        assert_eq!(verdict.counterpart().unwrap(), None);
    }

    #[test]
    fn match_number_must_be_a_usable_integer() {
        assert!(parse_match(r#"{"match_number": 2.7, "has_changed": false}"#).is_err());
        assert!(parse_match(r#"{"match_number": 18446744073709551615, "has_changed": false}"#).is_err());

        let whole = parse_match(r#"{"match_number": 2.0, "has_changed": false}"#).unwrap();
        assert_eq!(whole.counterpart().unwrap(), Some(2));

        let huge = parse_match(r#"{"match_number": 5000000000, "has_changed": false}"#).unwrap();
        assert!(huge.counterpart().is_err());
    }

    #[test]
    fn match_needs_change_flag_when_matched() {
        assert!(parse_match(r#"{"match_number": 2}"#).is_err());
        assert!(parse_match(r#"{"match_number": "two", "has_changed": true}"#).is_err());
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let verdict = parse_classification(r#"{"is_pro": true, "instrument": "{weird}", "reason": "a } b"}"#).unwrap();
        assert_eq!(verdict.instrument, "{weird}");
        assert_eq!(verdict.reason, "a } b");
    }

    #[test]
    fn difficulty_values() {
        assert_eq!(parse_difficulty(r#"{"difficulty": "Moderate"}"#), Some(Difficulty::Moderate));
        assert_eq!(parse_difficulty(r#"{"difficulty": "extreme"}"#), None);
        assert_eq!(parse_difficulty("hard"), None);
    }
}
