//! Deterministic auto-correction for JSON-bearing model output.
//!
//! Applies a sequence of manual string fixes — fence stripping, embedded
//! object extraction, delimiter balancing, trailing comma removal — and
//! reports which corrections were applied. No regex is used; all repairs
//! are string-scanning operations. Already-valid JSON passes through
//! untouched (modulo a whitespace trim).

use serde_json::Value;

use crate::error::{Result, StreamError};

/// One applied correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Correction {
    /// Removed a markdown code fence around the payload.
    StripFence,
    /// Extracted the first well-formed JSON region out of surrounding prose.
    ExtractEmbedded,
    /// Closed an unterminated string.
    CloseString,
    /// Appended a missing `]`.
    CloseBracket,
    /// Appended a missing `}`.
    CloseBrace,
    /// Removed a trailing comma.
    TrailingComma,
    /// Dropped a truncated trailing key or dangling colon.
    TruncatedPair,
}

impl Correction {
    pub fn label(&self) -> &'static str {
        match self {
            Correction::StripFence => "strip_fence",
            Correction::ExtractEmbedded => "extract_embedded",
            Correction::CloseString => "close_string",
            Correction::CloseBracket => "close_bracket",
            Correction::CloseBrace => "close_brace",
            Correction::TrailingComma => "trailing_comma",
            Correction::TruncatedPair => "truncated_pair",
        }
    }
}

impl std::fmt::Display for Correction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Apply the correction pipeline and report what was done.
///
/// Returns the corrected text and the corrections applied, in order. When
/// the input is already valid JSON the text comes back trimmed with no
/// corrections.
///
/// # Example
///
/// ```
/// use streamguard::repair::{auto_correct, Correction};
///
/// let (fixed, corrections) = auto_correct(r#"{"name": "Al", "age": 7"#);
/// assert_eq!(fixed, r#"{"name": "Al", "age": 7}"#);
/// assert_eq!(corrections, vec![Correction::CloseBrace]);
/// ```
pub fn auto_correct(input: &str) -> (String, Vec<Correction>) {
    let mut text = input.trim().to_string();
    let mut corrections = Vec::new();

    if serde_json::from_str::<Value>(&text).is_ok() {
        return (text, corrections);
    }

    if let Some(inner) = strip_fence(&text) {
        corrections.push(Correction::StripFence);
        text = inner;
        if serde_json::from_str::<Value>(&text).is_ok() {
            return (text, corrections);
        }
    }

    if !text.starts_with('{') && !text.starts_with('[') {
        if let Some(embedded) = find_bracketed(&text, '{', '}')
            .or_else(|| find_bracketed(&text, '[', ']'))
        {
            corrections.push(Correction::ExtractEmbedded);
            text = embedded.to_string();
            if serde_json::from_str::<Value>(&text).is_ok() {
                return (text, corrections);
            }
        } else {
            return (text, corrections);
        }
    }

    let (removed, stripped) = remove_trailing_commas(&text);
    if removed {
        corrections.push(Correction::TrailingComma);
        text = stripped;
        if serde_json::from_str::<Value>(&text).is_ok() {
            return (text, corrections);
        }
    }

    let balanced = balance(&text, &mut corrections);
    (balanced, corrections)
}

/// Auto-correct then parse.
pub fn parse_corrected(input: &str) -> Result<(Value, Vec<Correction>)> {
    let (text, corrections) = auto_correct(input);
    let value = serde_json::from_str::<Value>(&text)
        .map_err(|e| StreamError::SchemaValidation(format!("unparseable output: {e}")))?;
    Ok((value, corrections))
}

/// Pull the content out of the first markdown code fence, if any.
fn strip_fence(text: &str) -> Option<String> {
    let fence_start = text.find("```")?;
    let after_backticks = fence_start + 3;
    let line_end = text[after_backticks..].find('\n')?;
    let content_start = after_backticks + line_end + 1;

    let content = match text[content_start..].find("```") {
        Some(close) => &text[content_start..content_start + close],
        // Unclosed fence: everything after the opening line.
        None => &text[content_start..],
    };
    Some(content.trim().to_string())
}

/// Find a bracketed substring by matching open/close delimiters,
/// string-aware and nesting-aware. Prefers the first complete region.
fn find_bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..=start + i]);
            }
        }
    }
    None
}

/// Remove commas immediately preceding `}` or `]`, outside strings.
fn remove_trailing_commas(text: &str) -> (bool, String) {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut removed = false;
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if escape_next {
            escape_next = false;
            result.push(ch);
            i += 1;
            continue;
        }
        if in_string {
            if ch == '\\' {
                escape_next = true;
            } else if ch == '"' {
                in_string = false;
            }
            result.push(ch);
            i += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
            result.push(ch);
            i += 1;
            continue;
        }
        if ch == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                removed = true;
                i += 1;
                continue;
            }
        }
        result.push(ch);
        i += 1;
    }

    (removed, result)
}

/// Close unterminated strings and unclosed delimiters, dropping truncated
/// trailing pairs first so the closings land on a clean state.
fn balance(text: &str, corrections: &mut Vec<Correction>) -> String {
    let mut result = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        result.push(ch);
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if in_string {
        result.push('"');
        corrections.push(Correction::CloseString);
    }

    // Strip truncated artifacts the closing would otherwise trap:
    // a trailing comma, a dangling colon, or an orphan key with no value.
    loop {
        let t = result.trim_end();
        if let Some(stripped) = t.strip_suffix(',') {
            result = stripped.to_string();
            if !corrections.contains(&Correction::TrailingComma) {
                corrections.push(Correction::TrailingComma);
            }
            continue;
        }
        if let Some(before_colon) = t.strip_suffix(':') {
            let without_colon = before_colon.trim_end();
            if let Some(key_close) = without_colon.rfind('"') {
                if let Some(key_open) = without_colon[..key_close].rfind('"') {
                    let before_key = without_colon[..key_open].trim_end();
                    result = before_key
                        .strip_suffix(',')
                        .unwrap_or(before_key)
                        .to_string();
                    corrections.push(Correction::TruncatedPair);
                    continue;
                }
            }
        }
        break;
    }

    // Orphan key at the end of an object: {"a": 1, "b"}
    if stack.last() == Some(&'}') {
        let t = result.trim_end().to_string();
        if t.ends_with('"') && !t.ends_with("\\\"") {
            let inner = &t[..t.len() - 1];
            if let Some(open_pos) = inner.rfind('"') {
                let before = inner[..open_pos].trim_end();
                if before.ends_with(',') {
                    result = before[..before.len() - 1].to_string();
                    corrections.push(Correction::TruncatedPair);
                }
            }
        }
    }

    while let Some(closer) = stack.pop() {
        result.push(closer);
        corrections.push(match closer {
            '}' => Correction::CloseBrace,
            _ => Correction::CloseBracket,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_untouched() {
        let input = r#"{"a": 1, "b": [2, 3]}"#;
        let (fixed, corrections) = auto_correct(input);
        assert_eq!(fixed, input);
        assert!(corrections.is_empty());
    }

    #[test]
    fn idempotent_on_valid_json() {
        let (once, _) = auto_correct(r#"{"a": 1"#);
        let (twice, corrections) = auto_correct(&once);
        assert_eq!(once, twice);
        assert!(corrections.is_empty());
    }

    #[test]
    fn strips_markdown_fence() {
        let input = "Here you go:\n```json\n{\"a\": 1}\n```";
        let (fixed, corrections) = auto_correct(input);
        assert_eq!(fixed, r#"{"a": 1}"#);
        assert_eq!(corrections, vec![Correction::StripFence]);
    }

    #[test]
    fn strips_unclosed_fence() {
        let input = "```json\n{\"a\": 1}";
        let (fixed, corrections) = auto_correct(input);
        assert_eq!(fixed, r#"{"a": 1}"#);
        assert!(corrections.contains(&Correction::StripFence));
    }

    #[test]
    fn extracts_embedded_object() {
        let input = r#"The answer is {"a": 1} as requested."#;
        let (fixed, corrections) = auto_correct(input);
        assert_eq!(fixed, r#"{"a": 1}"#);
        assert_eq!(corrections, vec![Correction::ExtractEmbedded]);
    }

    #[test]
    fn extracts_embedded_array() {
        let input = "Tags: [1, 2, 3] hope that helps";
        let (fixed, corrections) = auto_correct(input);
        assert_eq!(fixed, "[1, 2, 3]");
        assert_eq!(corrections, vec![Correction::ExtractEmbedded]);
    }

    #[test]
    fn closes_missing_brace() {
        let (fixed, corrections) = auto_correct(r#"{"name": "Al", "age": "x""#);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["name"], "Al");
        assert!(corrections.contains(&Correction::CloseBrace));
    }

    #[test]
    fn closes_unterminated_string() {
        let (fixed, corrections) = auto_correct(r#"{"msg": "hello wor"#);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert!(v["msg"].as_str().unwrap().starts_with("hello wor"));
        assert!(corrections.contains(&Correction::CloseString));
        assert!(corrections.contains(&Correction::CloseBrace));
    }

    #[test]
    fn removes_trailing_comma() {
        let (fixed, corrections) = auto_correct(r#"{"a": 1, "b": 2,}"#);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["b"], 2);
        assert_eq!(corrections, vec![Correction::TrailingComma]);
    }

    #[test]
    fn nested_truncation() {
        let (fixed, corrections) = auto_correct(r#"{"items": [{"name": "a"}, {"name": "b""#);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["items"].as_array().unwrap().len(), 2);
        assert!(corrections.contains(&Correction::CloseBracket));
        assert!(corrections.contains(&Correction::CloseBrace));
    }

    #[test]
    fn drops_dangling_colon() {
        let (fixed, corrections) = auto_correct(r#"{"a": 1, "b":"#);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v, json!({"a": 1}));
        assert!(corrections.contains(&Correction::TruncatedPair));
    }

    #[test]
    fn drops_orphan_key() {
        let (fixed, _) = auto_correct(r#"{"year": 1999, "rating""#);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["year"], 1999);
        assert!(v.get("rating").is_none());
    }

    #[test]
    fn fence_then_balance() {
        let input = "```json\n{\"a\": [1, 2\n```";
        let (fixed, corrections) = auto_correct(input);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["a"].as_array().unwrap().len(), 2);
        assert!(corrections.contains(&Correction::StripFence));
        assert!(corrections.contains(&Correction::CloseBracket));
    }

    #[test]
    fn plain_text_passes_through() {
        let (fixed, corrections) = auto_correct("no json here at all");
        assert_eq!(fixed, "no json here at all");
        assert!(corrections.is_empty());
        assert!(parse_corrected("no json here at all").is_err());
    }

    #[test]
    fn parse_corrected_returns_value_and_log() {
        let (value, corrections) = parse_corrected(r#"{"done": true"#).unwrap();
        assert_eq!(value["done"], true);
        assert_eq!(corrections, vec![Correction::CloseBrace]);
    }

    #[test]
    fn brackets_inside_strings_ignored() {
        let input = r#"{"text": "array looks like [1, 2]"}"#;
        let (fixed, corrections) = auto_correct(input);
        assert_eq!(fixed, input);
        assert!(corrections.is_empty());
    }
}
