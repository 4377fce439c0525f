//! Pulling JSON objects out of free-form model output.
//!
//! Models wrap JSON in code fences, surround it with prose, or emit
//! Python-flavoured objects. Extraction walks an ordered list of
//! [`ExtractStrategy`] values and stops at the first that yields valid JSON.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::ExtractError;

/// One way of recovering a JSON value from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStrategy {
    /// The whole text is JSON.
    Direct,
    /// JSON inside a ```` ``` ```` or ```` ```json ```` fence.
    CodeFence,
    /// From the first `{` to the last `}`.
    BraceSpan,
    /// Brace span with single quotes, bare keys, Python literals and
    /// trailing commas repaired.
    LenientRepair,
}

impl ExtractStrategy {
    /// Default order, strictest first.
    pub const DEFAULT_ORDER: [Self; 4] = [
        Self::Direct,
        Self::CodeFence,
        Self::BraceSpan,
        Self::LenientRepair,
    ];

    /// Apply this strategy alone.
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractError`] describing why this strategy failed.
    pub fn apply(self, text: &str) -> Result<Value, ExtractError> {
        match self {
            Self::Direct => parse(text.trim()),
            Self::CodeFence => parse(code_fence(text)?),
            Self::BraceSpan => parse(brace_span(text)?),
            Self::LenientRepair => parse(&repair(brace_span(text)?)),
        }
    }
}

/// Extract with the default strategy order.
///
/// # Errors
///
/// Returns [`ExtractError::Empty`] for blank input, otherwise
/// [`ExtractError::Exhausted`] carrying the last strategy's error.
pub fn extract_json(text: &str) -> Result<Value, ExtractError> {
    extract_with(text, &ExtractStrategy::DEFAULT_ORDER)
}

/// Extract with an explicit strategy order.
///
/// # Errors
///
/// See [`extract_json`].
pub fn extract_with(text: &str, strategies: &[ExtractStrategy]) -> Result<Value, ExtractError> {
    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    let mut last = ExtractError::NoObject;
    for strategy in strategies {
        match strategy.apply(text) {
            Ok(value) => return Ok(value),
            Err(err) => last = err,
        }
    }
    Err(ExtractError::Exhausted(Box::new(last)))
}

/// Extract and deserialize into `T`.
///
/// # Errors
///
/// Fails if no strategy yields JSON or the JSON does not match `T`.
pub fn extract_as<T: DeserializeOwned>(text: &str) -> Result<T, ExtractError> {
    let value = extract_json(text)?;
    serde_json::from_value(value).map_err(|e| ExtractError::Invalid(e.to_string()))
}

fn parse(text: &str) -> Result<Value, ExtractError> {
    serde_json::from_str(text).map_err(|e| ExtractError::Invalid(e.to_string()))
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("fence regex is valid")
    })
}

fn code_fence(text: &str) -> Result<&str, ExtractError> {
    fence_regex()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .ok_or(ExtractError::NoFence)
}

fn brace_span(text: &str) -> Result<&str, ExtractError> {
    let start = text.find('{').ok_or(ExtractError::NoObject)?;
    let end = text.rfind('}').ok_or(ExtractError::NoObject)?;
    if end < start {
        return Err(ExtractError::NoObject);
    }
    Ok(&text[start..=end])
}

/// Rewrite Python-flavoured object text into JSON.
///
/// Works outside string literals only: single-quoted strings become
/// double-quoted, bare keys get quoted, `True`/`False`/`None` become JSON
/// literals and trailing commas are dropped.
fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '"' | '\'' => i = copy_string(&chars, i, &mut out),
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}' | ']')) {
                    out.push(',');
                }
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let followed_by_colon =
                    chars[i..].iter().find(|c| !c.is_whitespace()) == Some(&':');
                if followed_by_colon {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(match word.as_str() {
                        "True" => "true",
                        "False" => "false",
                        "None" => "null",
                        other => other,
                    });
                }
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }
    out
}

/// Copy the string literal starting at `start` as a double-quoted JSON
/// string. Returns the index just past the closing quote.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push('"');
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            match chars.get(i + 1) {
                Some('\'') if quote == '\'' => out.push('\''),
                Some(&next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
            i += 2;
            continue;
        }
        if c == quote {
            out.push('"');
            return i + 1;
        }
        if quote == '\'' && c == '"' {
            out.push_str("\\\"");
        } else {
            out.push(c);
        }
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct() {
        let v = ExtractStrategy::Direct.apply(r#" {"a": 1} "#).unwrap();
        assert_eq!(v, json!({"a": 1}));
        assert!(ExtractStrategy::Direct.apply("here: {\"a\": 1}").is_err());
    }

    #[test]
    fn test_code_fence() {
        let text = "Sure:\n```json\n{\"a\": [1, 2]}\n```\nDone.";
        assert_eq!(
            ExtractStrategy::CodeFence.apply(text).unwrap(),
            json!({"a": [1, 2]})
        );
        let bare = "```\n{\"b\": true}\n```";
        assert_eq!(
            ExtractStrategy::CodeFence.apply(bare).unwrap(),
            json!({"b": true})
        );
        assert_eq!(
            ExtractStrategy::CodeFence.apply("{}"),
            Err(ExtractError::NoFence)
        );
    }

    #[test]
    fn test_brace_span_in_prose() {
        let text = "The answer is {\"score\": 90, \"nested\": {\"x\": 1}} as requested.";
        assert_eq!(
            ExtractStrategy::BraceSpan.apply(text).unwrap(),
            json!({"score": 90, "nested": {"x": 1}})
        );
        assert_eq!(
            ExtractStrategy::BraceSpan.apply("no json"),
            Err(ExtractError::NoObject)
        );
    }

    #[test]
    fn test_lenient_repair() {
        let text = "{'name': 'CLK \"A\"', ok: True, missing: None, list: [1, 2,],}";
        assert_eq!(
            ExtractStrategy::LenientRepair.apply(text).unwrap(),
            json!({"name": "CLK \"A\"", "ok": true, "missing": null, "list": [1, 2]})
        );
    }

    #[test]
    fn test_repair_leaves_colons_in_strings_alone() {
        let text = r#"{"time": "12:30", 'k': 'a,b: c'}"#;
        assert_eq!(
            extract_json(text).unwrap(),
            json!({"time": "12:30", "k": "a,b: c"})
        );
    }

    #[test]
    fn test_first_success_wins() {
        // Fence content is valid; the brace span over the whole text is not.
        let text = "```json\n{\"a\": 1}\n```\ntrailing } brace";
        assert_eq!(extract_json(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_exhausted_and_empty() {
        assert_eq!(extract_json("   "), Err(ExtractError::Empty));
        assert!(matches!(
            extract_json("no object here"),
            Err(ExtractError::Exhausted(_))
        ));
    }

    #[test]
    fn test_extract_as_typed() {
        #[derive(serde::Deserialize)]
        struct Answer {
            component_name: String,
        }
        let a: Answer = extract_as("```json\n{\"component_name\": \"ADC\"}\n```").unwrap();
        assert_eq!(a.component_name, "ADC");
    }
}
