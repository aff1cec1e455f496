//! Tool-call parser registry.
//!
//! Local models emit tool calls in whatever text format their template
//! taught them: fenced JSON blocks, `<tool_call>` tags, bare JSON objects.
//! The registry tries structured parsers in descending priority order and
//! always terminates in the fallback, which wraps the raw text as a plain
//! assistant message, so `parse_with_fallback` is total.
//!
//! Parsers never panic outward: any internal panic is contained and treated
//! as "did not parse". Each attempt is bounded by an input-size cap and a
//! soft wall-clock budget; `parse_untrusted` adds a hard timeout on a worker
//! thread for inputs that could wedge a pathological parser.

pub mod breaker;
mod json_block;
mod xml_tag;

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use thiserror::Error;

pub use json_block::{FencedJsonParser, InlineJsonParser};
pub use xml_tag::XmlTagParser;

/// The hard-timeout path gave up on a parse.
#[derive(Debug, Error)]
#[error("parsing did not finish within {timeout:?}")]
pub struct ParseTimeout {
    /// The deadline that was exceeded.
    pub timeout: Duration,
}

/// A tool call extracted from response text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Tool name.
    pub name: String,
    /// Tool arguments as a JSON object.
    pub arguments: Value,
}

/// Outcome of parsing a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// Structured tool calls were recognized.
    ToolCalls(Vec<ToolCallRequest>),
    /// No structured format matched; the raw text stands as the assistant
    /// message.
    Text(String),
}

/// A registered parser. Implementations must be pure and must not panic;
/// panics are contained by the registry but count as a failed parse.
pub trait ToolCallParser: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &'static str;

    /// Ordering priority in `[1, 100]`; higher runs earlier.
    fn priority(&self) -> u8;

    /// Cheap detection predicate.
    fn can_parse(&self, text: &str) -> bool;

    /// Extraction; `None` when the format does not match after all.
    fn parse(&self, text: &str) -> Option<ParsedResponse>;

    /// Sanity check on the extraction result.
    fn validate(&self, parsed: &ParsedResponse) -> bool {
        match parsed {
            ParsedResponse::ToolCalls(calls) => {
                !calls.is_empty() && calls.iter().all(|call| !call.name.is_empty() && call.arguments.is_object())
            }
            ParsedResponse::Text(_) => true,
        }
    }
}

/// Terminal parser: always succeeds by passing the text through.
struct FallbackParser;

impl ToolCallParser for FallbackParser {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn can_parse(&self, _text: &str) -> bool {
        true
    }

    fn parse(&self, text: &str) -> Option<ParsedResponse> {
        Some(ParsedResponse::Text(text.to_string()))
    }
}

/// Worker threads, abandoned ones included, that `parse_untrusted` may have
/// running at once. A timed-out worker cannot be killed, only disowned; the
/// bound keeps a stream of wedging inputs from accumulating threads.
const MAX_OUTSTANDING_PARSES: usize = 8;

/// Priority-ordered parser chain. Registered once at startup and read-only
/// afterwards, so lookups take no lock.
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn ToolCallParser>>,
    limits: config::ParserConfig,
    outstanding_parses: Arc<AtomicUsize>,
}

impl ParserRegistry {
    /// Registry with the structured parsers for the formats the fleet's
    /// model families actually produce, plus the terminal fallback.
    pub fn with_default_parsers(limits: config::ParserConfig) -> Self {
        let mut registry = Self {
            parsers: Vec::new(),
            limits,
            outstanding_parses: Arc::new(AtomicUsize::new(0)),
        };

        registry.register(Arc::new(FencedJsonParser::new()));
        registry.register(Arc::new(XmlTagParser::new()));
        registry.register(Arc::new(InlineJsonParser::new()));
        registry.register(Arc::new(FallbackParser));

        registry
    }

    /// Insert a parser, keeping descending priority order.
    pub fn register(&mut self, parser: Arc<dyn ToolCallParser>) {
        let position = self
            .parsers
            .partition_point(|existing| existing.priority() >= parser.priority());
        self.parsers.insert(position, parser);
    }

    /// Try each parser in priority order; the first whose detection,
    /// extraction and validation all succeed wins. Total: the fallback
    /// always matches.
    pub fn parse_with_fallback(&self, text: &str) -> ParsedResponse {
        if text.len() > self.limits.max_input_bytes {
            log::warn!(
                "Response of {} bytes exceeds the {} byte parser cap; passing through as text",
                text.len(),
                self.limits.max_input_bytes
            );
            return ParsedResponse::Text(text.to_string());
        }

        for parser in &self.parsers {
            let started = Instant::now();

            let matched = catch_unwind(AssertUnwindSafe(|| parser.can_parse(text))).unwrap_or(false);
            if !matched {
                continue;
            }

            let parsed = catch_unwind(AssertUnwindSafe(|| parser.parse(text))).unwrap_or_else(|_| {
                log::warn!("Parser `{}` panicked; treating as no parse", parser.name());
                None
            });

            let Some(parsed) = parsed else {
                continue;
            };

            if started.elapsed() > self.limits.soft_budget {
                log::warn!(
                    "Parser `{}` exceeded its {}ms budget; result rejected",
                    parser.name(),
                    self.limits.soft_budget.as_millis()
                );
                continue;
            }

            if !catch_unwind(AssertUnwindSafe(|| parser.validate(&parsed))).unwrap_or(false) {
                continue;
            }

            return parsed;
        }

        // Unreachable while the fallback is registered, but the registry
        // stays total even if a caller built one without it.
        ParsedResponse::Text(text.to_string())
    }

    /// Like [`parse_with_fallback`](Self::parse_with_fallback), but bounded
    /// by a hard timeout on a worker thread. For inputs from untrusted
    /// upstreams where a pathological parse could blow past the soft budget.
    /// The timeout is an error so callers (and a circuit breaker in front
    /// of the registry) can tell a wedged parser from genuine plain text.
    ///
    /// A worker that misses its deadline is disowned and left to finish on
    /// its own; at most [`MAX_OUTSTANDING_PARSES`] workers may be alive at
    /// once, and further parses are rejected up front until one drains.
    pub fn parse_untrusted(
        self: &Arc<Self>,
        text: String,
        hard_timeout: Duration,
    ) -> Result<ParsedResponse, ParseTimeout> {
        if self.outstanding_parses.load(Ordering::Acquire) >= MAX_OUTSTANDING_PARSES {
            log::warn!(
                "{MAX_OUTSTANDING_PARSES} parser workers still outstanding; rejecting parse without spawning another"
            );
            return Err(ParseTimeout { timeout: hard_timeout });
        }

        let registry = Arc::clone(self);
        let outstanding = Arc::clone(&self.outstanding_parses);
        let (tx, rx) = std::sync::mpsc::channel();

        outstanding.fetch_add(1, Ordering::AcqRel);
        std::thread::spawn(move || {
            let parsed = registry.parse_with_fallback(&text);
            outstanding.fetch_sub(1, Ordering::AcqRel);
            let _ = tx.send(parsed);
        });

        rx.recv_timeout(hard_timeout).map_err(|_| {
            log::warn!("Parse abandoned after {hard_timeout:?}; disowned worker will finish in the background");
            ParseTimeout { timeout: hard_timeout }
        })
    }

    /// Worker threads currently alive, abandoned ones included.
    pub fn outstanding_parses(&self) -> usize {
        self.outstanding_parses.load(Ordering::Acquire)
    }

    /// Registered parser names in trial order.
    pub fn parser_names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|parser| parser.name()).collect()
    }
}

/// Interpret a JSON value as a tool call. Accepts the argument key
/// spellings seen across model families.
pub(crate) fn call_from_value(value: &Value) -> Option<ToolCallRequest> {
    let object = value.as_object()?;
    let name = object.get("name")?.as_str()?.to_string();

    let arguments = ["arguments", "parameters", "input"]
        .iter()
        .find_map(|key| object.get(*key))
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

    // Some templates emit arguments as a JSON-encoded string.
    let arguments = match arguments {
        Value::String(encoded) => serde_json::from_str(&encoded).ok()?,
        other => other,
    };

    Some(ToolCallRequest { name, arguments })
}

/// Interpret a JSON value as one-or-many tool calls.
pub(crate) fn calls_from_value(value: &Value) -> Option<Vec<ToolCallRequest>> {
    match value {
        Value::Array(items) => items.iter().map(call_from_value).collect(),
        Value::Object(object) => {
            if let Some(calls) = object.get("tool_calls") {
                return calls_from_value(calls);
            }
            call_from_value(value).map(|call| vec![call])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<ParserRegistry> {
        Arc::new(ParserRegistry::with_default_parsers(config::ParserConfig::default()))
    }

    #[test]
    fn plain_text_falls_through_to_fallback() {
        let parsed = registry().parse_with_fallback("Here is the answer.");

        assert_eq!(parsed, ParsedResponse::Text("Here is the answer.".to_string()));
    }

    #[test]
    fn parsers_are_ordered_by_descending_priority() {
        let names = registry().parser_names();
        assert_eq!(names, vec!["fenced-json", "xml-tag", "inline-json", "fallback"]);
    }

    #[test]
    fn fenced_json_wins_over_inline() {
        let text = "Calling the tool:\n```json\n{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Oslo\"}}\n```";
        let ParsedResponse::ToolCalls(calls) = registry().parse_with_fallback(text) else {
            panic!("expected tool calls");
        };

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, json!({"city": "Oslo"}));
    }

    #[test]
    fn oversized_input_is_rejected_before_parsing() {
        let limits = config::ParserConfig {
            max_input_bytes: 16,
            ..Default::default()
        };
        let registry = ParserRegistry::with_default_parsers(limits);

        let text = "{\"name\": \"x\", \"arguments\": {}} and much more text";
        assert!(matches!(registry.parse_with_fallback(text), ParsedResponse::Text(_)));
    }

    #[test]
    fn panicking_parser_is_contained() {
        struct PanickingParser;

        impl ToolCallParser for PanickingParser {
            fn name(&self) -> &'static str {
                "panicking"
            }
            fn priority(&self) -> u8 {
                99
            }
            fn can_parse(&self, _text: &str) -> bool {
                true
            }
            #[allow(clippy::panic)]
            fn parse(&self, _text: &str) -> Option<ParsedResponse> {
                panic!("boom");
            }
        }

        let mut registry = ParserRegistry::with_default_parsers(config::ParserConfig::default());
        registry.register(Arc::new(PanickingParser));

        let parsed = registry.parse_with_fallback("Just text.");
        assert_eq!(parsed, ParsedResponse::Text("Just text.".to_string()));
    }

    #[test]
    fn hard_timeout_is_reported() {
        struct SleepyParser;

        impl ToolCallParser for SleepyParser {
            fn name(&self) -> &'static str {
                "sleepy"
            }
            fn priority(&self) -> u8 {
                99
            }
            fn can_parse(&self, _text: &str) -> bool {
                true
            }
            fn parse(&self, _text: &str) -> Option<ParsedResponse> {
                std::thread::sleep(Duration::from_secs(5));
                None
            }
        }

        let mut registry = ParserRegistry::with_default_parsers(config::ParserConfig::default());
        registry.register(Arc::new(SleepyParser));
        let registry = Arc::new(registry);

        let error = registry
            .parse_untrusted("hello".to_string(), Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(error.timeout, Duration::from_millis(50));

        // A fast parse still completes within the same deadline.
        let parsed = Arc::new(ParserRegistry::with_default_parsers(config::ParserConfig::default()))
            .parse_untrusted("hello".to_string(), Duration::from_millis(500))
            .unwrap();
        assert_eq!(parsed, ParsedResponse::Text("hello".to_string()));
    }

    #[test]
    fn abandoned_workers_are_bounded() {
        struct WedgedParser;

        impl ToolCallParser for WedgedParser {
            fn name(&self) -> &'static str {
                "wedged"
            }
            fn priority(&self) -> u8 {
                99
            }
            fn can_parse(&self, _text: &str) -> bool {
                true
            }
            fn parse(&self, _text: &str) -> Option<ParsedResponse> {
                std::thread::sleep(Duration::from_secs(2));
                None
            }
        }

        let mut registry = ParserRegistry::with_default_parsers(config::ParserConfig::default());
        registry.register(Arc::new(WedgedParser));
        let registry = Arc::new(registry);

        // Saturate the worker bound with parses that all miss their deadline.
        for _ in 0..MAX_OUTSTANDING_PARSES {
            assert!(
                registry
                    .parse_untrusted("wedge".to_string(), Duration::from_millis(10))
                    .is_err()
            );
        }
        assert_eq!(registry.outstanding_parses(), MAX_OUTSTANDING_PARSES);

        // At the cap, the next parse is rejected up front: no new worker.
        assert!(
            registry
                .parse_untrusted("wedge".to_string(), Duration::from_millis(10))
                .is_err()
        );
        assert_eq!(registry.outstanding_parses(), MAX_OUTSTANDING_PARSES);
    }

    #[test]
    fn string_encoded_arguments_are_decoded() {
        let call = call_from_value(&json!({
            "name": "get_weather",
            "arguments": "{\"city\": \"Oslo\"}"
        }))
        .unwrap();

        assert_eq!(call.arguments, json!({"city": "Oslo"}));
    }

    #[test]
    fn tool_calls_wrapper_object_is_unwrapped() {
        let calls = calls_from_value(&json!({
            "tool_calls": [
                {"name": "a", "arguments": {}},
                {"name": "b", "parameters": {"x": 1}}
            ]
        }))
        .unwrap();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "b");
        assert_eq!(calls[1].arguments, json!({"x": 1}));
    }
}
