//! Recovery of JSON objects from loosely formatted model output.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

use super::LLMError;

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid regex"));

/// Pulls the first JSON object out of `raw` and deserializes it. Markdown
/// fences, `//` line comments, trailing commas and prose around the object
/// are tolerated.
pub fn parse_json_lenient<T: DeserializeOwned>(raw: &str) -> Result<T, LLMError> {
    let candidate = extract_json_object(raw)
        .ok_or_else(|| LLMError::ParseError("no JSON object in model output".to_string()))?;

    serde_json::from_str(candidate)
        .or_else(|_| serde_json::from_str(&strip_trailing_commas(&strip_line_comments(candidate))))
        .map_err(|err| LLMError::ParseError(err.to_string()))
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let body = FENCE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);

    first_balanced_object(body)
}

/// The first brace-balanced object in `body`. Braces inside string literals
/// and `//` comments don't count.
fn first_balanced_object(body: &str) -> Option<&str> {
    let start = body.find('{')?;
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut idx = start;
    while idx < bytes.len() {
        let b = bytes[idx];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'/' if bytes.get(idx + 1) == Some(&b'/') => {
                    idx = body[idx..].find('\n').map_or(bytes.len(), |n| idx + n);
                    continue;
                }
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&body[start..=idx]);
                    }
                }
                _ => {}
            }
        }
        idx += 1;
    }
    None
}

/// Drops a `,` whose next non-whitespace character closes an object or array.
fn strip_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in json.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = json[idx + 1..].trim_start().chars().next();
            if matches!(next, Some('}' | ']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Drops `// ...` to end of line when it is outside a string literal.
fn strip_line_comments(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for line in json.lines() {
        let mut in_string = false;
        let mut escaped = false;
        let mut cut = line.len();
        let bytes = line.as_bytes();
        for (idx, &b) in bytes.iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'/' if !in_string && bytes.get(idx + 1) == Some(&b'/') => {
                    cut = idx;
                    break;
                }
                _ => {}
            }
        }
        out.push_str(&line[..cut]);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn parses_plain_object() {
        let v: Value = parse_json_lenient(r#"{"a": 1}"#).expect("parse");
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn strips_fences_and_prose() {
        let raw = "Sure! Here is the result:\n```json\n{\"category\": \"social\"}\n```\nHope that helps.";
        let v: Value = parse_json_lenient(raw).expect("parse");
        assert_eq!(v["category"], "social");
    }

    #[test]
    fn strips_comments_but_not_urls() {
        let raw = "{\n  \"url\": \"https://example.com/x\", // the link\n  \"n\": 2 // count\n}";
        let v: Value = parse_json_lenient(raw).expect("parse");
        assert_eq!(v["url"], "https://example.com/x");
        assert_eq!(v["n"], 2);
    }

    #[test]
    fn stops_at_the_end_of_the_first_object() {
        let raw = r#"{"category": "social", "note": "a } in a string"} Note: use {x} next time"#;
        let v: Value = parse_json_lenient(raw).expect("parse");
        assert_eq!(v["category"], "social");
        assert_eq!(v["note"], "a } in a string");
    }

    #[test]
    fn tolerates_trailing_commas() {
        let raw = "{\n  \"tags\": [\"a\", \"b\",],\n  \"text\": \"x, }\",\n}";
        let v: Value = parse_json_lenient(raw).expect("parse");
        assert_eq!(v["tags"][1], "b");
        assert_eq!(v["text"], "x, }");
    }

    #[test]
    fn garbage_is_parse_error() {
        let err = parse_json_lenient::<Value>("I cannot help with that").expect_err("no json");
        assert!(matches!(err, LLMError::ParseError(_)));
        let err = parse_json_lenient::<Value>("{ not json }").expect_err("bad json");
        assert!(matches!(err, LLMError::ParseError(_)));
    }
}
