//! Parser for `<tool_call>`-tagged calls, the format the Hermes and Qwen
//! chat templates train models to emit.

use regex::Regex;
use serde_json::Value;

use super::{ParsedResponse, ToolCallParser, call_from_value};

/// Parses tool calls wrapped in XML-ish tags:
///
/// ```text
/// <tool_call>
/// {"name": "get_weather", "arguments": {"city": "Oslo"}}
/// </tool_call>
/// ```
pub struct XmlTagParser {
    tag: Regex,
}

impl XmlTagParser {
    /// Build the parser.
    pub fn new() -> Self {
        Self {
            tag: Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("valid regex"),
        }
    }
}

impl Default for XmlTagParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParser for XmlTagParser {
    fn name(&self) -> &'static str {
        "xml-tag"
    }

    fn priority(&self) -> u8 {
        80
    }

    fn can_parse(&self, text: &str) -> bool {
        text.contains("<tool_call>")
    }

    fn parse(&self, text: &str) -> Option<ParsedResponse> {
        let mut calls = Vec::new();

        // One garbled tag must not discard valid tags matched earlier in
        // the same response.
        for captures in self.tag.captures_iter(text) {
            let Ok(value) = serde_json::from_str::<Value>(captures[1].trim()) else {
                continue;
            };
            let Some(call) = call_from_value(&value) else {
                continue;
            };
            calls.push(call);
        }

        (!calls.is_empty()).then_some(ParsedResponse::ToolCalls(calls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_tagged_call() {
        let parser = XmlTagParser::new();
        let text = "<tool_call>\n{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Oslo\"}}\n</tool_call>";

        assert!(parser.can_parse(text));
        let Some(ParsedResponse::ToolCalls(calls)) = parser.parse(text) else {
            panic!("expected tool calls");
        };
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, json!({"city": "Oslo"}));
    }

    #[test]
    fn multiple_tagged_calls_keep_order() {
        let parser = XmlTagParser::new();
        let text = concat!(
            "<tool_call>{\"name\": \"first\", \"arguments\": {}}</tool_call>\n",
            "And then:\n",
            "<tool_call>{\"name\": \"second\", \"arguments\": {}}</tool_call>",
        );

        let Some(ParsedResponse::ToolCalls(calls)) = parser.parse(text) else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn malformed_payload_rejects_the_parse() {
        let parser = XmlTagParser::new();
        assert_eq!(parser.parse("<tool_call>not json</tool_call>"), None);
    }

    #[test]
    fn malformed_tag_does_not_discard_valid_ones() {
        let parser = XmlTagParser::new();
        let text = concat!(
            "<tool_call>{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Oslo\"}}</tool_call>\n",
            "<tool_call>not json at all</tool_call>\n",
            "<tool_call>{\"just\": \"data\"}</tool_call>",
        );

        let Some(ParsedResponse::ToolCalls(calls)) = parser.parse(text) else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, json!({"city": "Oslo"}));
    }
}
