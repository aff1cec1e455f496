//! Parsers for JSON-shaped tool calls: fenced code blocks and bare inline
//! objects.

use regex::Regex;
use serde_json::Value;

use super::{ParsedResponse, ToolCallParser, calls_from_value};

/// Parses tool calls from fenced code blocks:
///
/// ````text
/// ```json
/// {"name": "get_weather", "arguments": {"city": "Oslo"}}
/// ```
/// ````
///
/// The fence may omit the language tag; several calls may appear as an
/// array or across multiple fences.
pub struct FencedJsonParser {
    fence: Regex,
}

impl FencedJsonParser {
    /// Build the parser.
    pub fn new() -> Self {
        Self {
            fence: Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("valid regex"),
        }
    }
}

impl Default for FencedJsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParser for FencedJsonParser {
    fn name(&self) -> &'static str {
        "fenced-json"
    }

    fn priority(&self) -> u8 {
        90
    }

    fn can_parse(&self, text: &str) -> bool {
        text.contains("```")
    }

    fn parse(&self, text: &str) -> Option<ParsedResponse> {
        let mut calls = Vec::new();

        // A fence that parses as JSON but is not call-shaped is just data in
        // the answer; skip it rather than discarding calls found elsewhere.
        for captures in self.fence.captures_iter(text) {
            let inner = captures[1].trim();
            let Ok(value) = serde_json::from_str::<Value>(inner) else {
                continue;
            };

            if let Some(extra) = calls_from_value(&value) {
                calls.extend(extra);
            }
        }

        (!calls.is_empty()).then_some(ParsedResponse::ToolCalls(calls))
    }
}

/// Parses a bare JSON tool-call object embedded in prose:
///
/// ```text
/// I'll check that. {"name": "get_weather", "arguments": {"city": "Oslo"}}
/// ```
///
/// Detection requires both a `name` key and one of the argument key
/// spellings, so ordinary JSON in an answer does not trigger it.
pub struct InlineJsonParser;

impl InlineJsonParser {
    /// Build the parser.
    pub fn new() -> Self {
        Self
    }
}

impl Default for InlineJsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParser for InlineJsonParser {
    fn name(&self) -> &'static str {
        "inline-json"
    }

    fn priority(&self) -> u8 {
        70
    }

    fn can_parse(&self, text: &str) -> bool {
        text.contains("\"name\"")
            && ["\"arguments\"", "\"parameters\"", "\"input\""]
                .iter()
                .any(|key| text.contains(key))
    }

    fn parse(&self, text: &str) -> Option<ParsedResponse> {
        let mut calls = Vec::new();
        let mut cursor = 0;

        while let Some(offset) = text[cursor..].find('{') {
            let start = cursor + offset;
            let Some(end) = balanced_object_end(&text[start..]) else {
                break;
            };

            if let Ok(value) = serde_json::from_str::<Value>(&text[start..start + end])
                && let Some(parsed) = calls_from_value(&value)
            {
                calls.extend(parsed);
            }

            cursor = start + end;
        }

        (!calls.is_empty()).then_some(ParsedResponse::ToolCalls(calls))
    }
}

/// Byte offset one past the `}` closing the object that starts at byte 0,
/// honoring string literals and escapes. `None` when unbalanced.
fn balanced_object_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }

        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    return Some(offset + 1);
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
    use serde_json::json;

    fn tool_calls(parsed: Option<ParsedResponse>) -> Vec<super::super::ToolCallRequest> {
        match parsed {
            Some(ParsedResponse::ToolCalls(calls)) => calls,
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn fenced_block_with_language_tag() {
        let parser = FencedJsonParser::new();
        let text = "Sure:\n```json\n{\"name\": \"search\", \"arguments\": {\"q\": \"rust\"}}\n```\nDone.";

        assert!(parser.can_parse(text));
        let calls = tool_calls(parser.parse(text));
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, json!({"q": "rust"}));
    }

    #[test]
    fn fenced_block_with_array_of_calls() {
        let parser = FencedJsonParser::new();
        let text = "```\n[{\"name\": \"a\", \"arguments\": {}}, {\"name\": \"b\", \"input\": {\"k\": 2}}]\n```";

        let calls = tool_calls(parser.parse(text));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].arguments, json!({"k": 2}));
    }

    #[test]
    fn fenced_block_without_call_shape_is_rejected() {
        let parser = FencedJsonParser::new();
        let text = "```json\n{\"result\": 42}\n```";

        assert_eq!(parser.parse(text), None);
    }

    #[test]
    fn non_call_block_does_not_discard_calls_from_other_blocks() {
        let parser = FencedJsonParser::new();
        let text = concat!(
            "```json\n{\"name\": \"search\", \"arguments\": {\"q\": \"rust\"}}\n```\n",
            "The result looked like this:\n",
            "```json\n{\"result\": 42}\n```",
        );

        let calls = tool_calls(parser.parse(text));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
    }

    #[test]
    fn inline_object_in_prose() {
        let parser = InlineJsonParser::new();
        let text = "Let me look that up. {\"name\": \"search\", \"arguments\": {\"q\": \"weather in Oslo\"}} One moment.";

        assert!(parser.can_parse(text));
        let calls = tool_calls(parser.parse(text));
        assert_eq!(calls[0].name, "search");
    }

    #[test]
    fn inline_detection_requires_argument_key() {
        let parser = InlineJsonParser::new();
        assert!(!parser.can_parse("The config has a \"name\" field."));
    }

    #[test]
    fn braces_inside_strings_do_not_break_balancing() {
        let text = r#"{"name": "echo", "arguments": {"text": "a } inside \" quotes"}} trailing"#;
        let end = balanced_object_end(text).unwrap();
        assert!(serde_json::from_str::<Value>(&text[..end]).is_ok());
    }

    #[test]
    fn unbalanced_object_returns_none() {
        assert_eq!(balanced_object_end("{\"name\": \"x\""), None);
    }
}
