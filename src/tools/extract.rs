//! Tool invocation extraction from free-form model output
//!
//! Models are prompted to call tools by emitting a JSON object such as
//! `{"tool": "calculate", "parameters": {"expression": "2 + 2"}}`. Smaller
//! models are sloppy about it, so recovery is done in two phases:
//!
//! ```text
//! raw text ──► fenced blocks (```json ... ```) ──► found? ──► done
//!                                                   │ no
//!                                                   ▼
//!              marker scan ({"tool": ...) + brace-depth matching
//! ```
//!
//! Both phases are pure: identical input always yields identical output and
//! nothing here returns an error. Anything that fails to parse is skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Opening/closing delimiter of a fenced block
const FENCE: &str = "```";

/// Info strings accepted after an opening fence
const FENCE_LANGS: &[&str] = &["", "json", "tool", "tool_call"];

/// Key that marks an inline invocation object
const MARKER_KEY: &str = "\"tool\"";

/// A structured tool call recovered from model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Registered tool name
    pub name: String,
    /// Arguments, in the order the model wrote them
    pub parameters: Map<String, Value>,
}

impl Invocation {
    pub fn new(name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

/// Extract every tool invocation from `text`, in order of appearance.
///
/// Fenced blocks take precedence: if at least one fenced block yields a valid
/// invocation, inline markers are not considered at all.
pub fn extract(text: &str) -> Vec<Invocation> {
    let fenced = extract_fenced(text);
    if !fenced.is_empty() {
        return fenced;
    }
    extract_marked(text)
}

/// Remove invocation fragments so the remaining prose can be shown to a user.
///
/// Fenced JSON blocks and inline marker objects are cut out, including a
/// trailing marker object that was never closed. The result is trimmed and
/// may be empty.
pub fn strip_invocation_fragments(text: &str) -> String {
    let mut without_fences = String::with_capacity(text.len());
    let mut cursor = 0;
    for block in fenced_blocks(text) {
        without_fences.push_str(&text[cursor..block.start]);
        cursor = block.end;
    }
    without_fences.push_str(&text[cursor..]);

    let source = without_fences.as_str();
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'{' && marker_at(source, pos) {
            out.push_str(&source[cursor..pos]);
            match find_object_end(source, pos) {
                Some(end) => {
                    cursor = end + 1;
                    pos = end + 1;
                }
                None => {
                    // unterminated tail: drop everything after the marker
                    cursor = bytes.len();
                    break;
                }
            }
        } else {
            pos += 1;
        }
    }
    if cursor < source.len() {
        out.push_str(&source[cursor..]);
    }
    out.trim().to_string()
}

/// A fenced block: byte range of the whole block plus its trimmed body
struct FencedBlock<'a> {
    start: usize,
    end: usize,
    body: &'a str,
}

/// Locate fenced blocks whose info string is one we recognise and whose body
/// looks like a JSON object. An opening fence with no closing fence ends the
/// scan.
fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>> {
    let mut blocks = Vec::new();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find(FENCE) {
        let open = search_from + offset;
        let after_open = open + FENCE.len();
        let line_end = text[after_open..]
            .find('\n')
            .map(|i| after_open + i)
            .unwrap_or(text.len());
        let line = &text[after_open..line_end];

        // a `{` on the fence line starts the body: ```json {"tool": ...}```
        let (lang, body_start) = match line.find('{') {
            Some(brace) => (line[..brace].trim(), after_open + brace),
            None => (line.trim(), line_end),
        };

        let Some(close_offset) = text[body_start..].find(FENCE) else {
            break;
        };
        let close = body_start + close_offset;
        let end = close + FENCE.len();
        let body = text[body_start..close].trim();

        if FENCE_LANGS.contains(&lang.to_ascii_lowercase().as_str()) && body.starts_with('{') {
            blocks.push(FencedBlock {
                start: open,
                end,
                body,
            });
        }
        search_from = end;
    }

    blocks
}

fn extract_fenced(text: &str) -> Vec<Invocation> {
    fenced_blocks(text)
        .into_iter()
        .filter_map(|block| match serde_json::from_str::<Value>(block.body) {
            Ok(value) => invocation_from_value(&value),
            Err(e) => {
                debug!(error = %e, "Skipping malformed fenced invocation");
                None
            }
        })
        .collect()
}

fn extract_marked(text: &str) -> Vec<Invocation> {
    let bytes = text.as_bytes();
    let mut invocations = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] != b'{' || !marker_at(text, pos) {
            pos += 1;
            continue;
        }

        let Some(end) = find_object_end(text, pos) else {
            debug!(offset = pos, "Dropping unterminated invocation");
            pos += 1;
            continue;
        };

        let candidate = &text[pos..=end];
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) => match invocation_from_value(&value) {
                Some(invocation) => {
                    invocations.push(invocation);
                    pos = end + 1;
                }
                None => pos += 1,
            },
            Err(e) => {
                debug!(offset = pos, error = %e, "Skipping malformed invocation");
                pos += 1;
            }
        }
    }

    invocations
}

/// Whether an inline marker `{ "tool" :` starts at byte `pos` (whitespace
/// tolerant). `pos` must point at a `{`.
fn marker_at(text: &str, pos: usize) -> bool {
    let rest = text[pos + 1..].trim_start();
    match rest.strip_prefix(MARKER_KEY) {
        Some(after_key) => after_key.trim_start().starts_with(':'),
        None => false,
    }
}

/// Find the byte index of the `}` matching the `{` at `start`.
///
/// Braces inside JSON string literals are ignored. Returns `None` when the
/// object is never closed.
fn find_object_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Build an invocation from a parsed object.
///
/// Accepts `tool` or `name` for the tool name and `parameters` or `arguments`
/// for the argument object. Arguments encoded as a JSON string are decoded.
/// A missing argument field means no arguments.
fn invocation_from_value(value: &Value) -> Option<Invocation> {
    let object = value.as_object()?;
    let name = object
        .get("tool")
        .or_else(|| object.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())?;

    let parameters = match object.get("parameters").or_else(|| object.get("arguments")) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(encoded)) => match serde_json::from_str::<Value>(encoded) {
            Ok(Value::Object(map)) => map,
            _ => return None,
        },
        Some(_) => return None,
    };

    Some(Invocation::new(name, parameters))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_has_no_invocations() {
        assert!(extract("The answer is 42.").is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn test_inline_invocation() {
        let text = r#"Let me compute. {"tool": "calculate", "parameters": {"expression": "2+2"}}"#;
        let calls = extract(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "calculate");
        assert_eq!(calls[0].parameters["expression"], "2+2");
    }

    #[test]
    fn test_marker_is_whitespace_tolerant() {
        let text = r#"{ "tool" : "a", "parameters": {}}"#;
        assert_eq!(extract(text).len(), 1);
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"{"tool": "write", "parameters": {"content": "fn main() { }"}}"#;
        let calls = extract(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parameters["content"], "fn main() { }");
    }

    #[test]
    fn test_fenced_takes_precedence_over_inline() {
        let text = "```json\n{\"tool\": \"a\", \"parameters\": {}}\n```\n{\"tool\": \"b\", \"parameters\": {}}";
        let calls = extract(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "a");
    }

    #[test]
    fn test_invalid_fenced_falls_back_to_markers() {
        let text = "```json\n{not json}\n```\n{\"tool\": \"b\", \"parameters\": {}}";
        let calls = extract(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "b");
    }

    #[test]
    fn test_fenced_accepts_name_and_arguments() {
        let text = "```json\n{\"name\": \"a\", \"arguments\": \"{\\\"x\\\": 1}\"}\n```";
        let calls = extract(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parameters["x"], 1);
    }

    #[test]
    fn test_parameters_keep_order() {
        let text = r#"{"tool": "t", "parameters": {"z": 1, "a": 2, "m": 3}}"#;
        let calls = extract(text);
        let keys: Vec<&str> = calls[0].parameters.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_non_object_parameters_rejected() {
        assert!(extract(r#"{"tool": "t", "parameters": [1, 2]}"#).is_empty());
    }

    #[test]
    fn test_strip_fragments() {
        let text = "Here you go.\n```json\n{\"tool\": \"a\", \"parameters\": {}}\n```\nDone.";
        assert_eq!(strip_invocation_fragments(text), "Here you go.\n\nDone.");

        let inline = r#"Result: {"tool": "a", "parameters": {}} ok"#;
        assert_eq!(strip_invocation_fragments(inline), "Result:  ok");

        let truncated = r#"Almost {"tool": "a", "parameters": {"x": "#;
        assert_eq!(strip_invocation_fragments(truncated), "Almost");
    }

    #[test]
    fn test_find_object_end_unbalanced() {
        assert_eq!(find_object_end("{\"a\": {}", 0), None);
        assert_eq!(find_object_end("{\"a\": {}}", 0), Some(8));
    }
}
