//! Anthropic Messages API types, as documented in the
//! [API reference](https://docs.anthropic.com/en/api/messages).
//!
//! The format differs from OpenAI's in several key ways:
//! - messages carry arrays of typed content blocks
//! - the system prompt is separate from the messages array and may itself be
//!   a string or an array of text blocks
//! - tool use is expressed as tool_use/tool_result blocks instead of
//!   function-call messages

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for `POST /v1/messages`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    /// The model to route the request to.
    pub model: String,

    /// The conversation, alternating between user and assistant roles.
    pub messages: Vec<Message>,

    /// Maximum number of tokens to generate. Required by the protocol.
    pub max_tokens: u32,

    /// System prompt; a plain string or an array of text blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Controls randomness in the response. Range 0.0 to 1.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Only sample from the top K tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Sequences that stop generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to stream the response as Server-Sent Events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Custom metadata attached to the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Tools available to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Controls how the model uses tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Accepted from clients but not forwarded; local backends have no
    /// equivalent parameter.
    #[serde(default, skip_serializing)]
    pub reasoning: Option<Value>,

    /// Accepted from clients but not forwarded.
    #[serde(default, skip_serializing)]
    pub service_tier: Option<Value>,
}

impl MessagesRequest {
    /// Whether the client asked for a streaming response.
    pub fn streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// The system prompt: a plain string, or an array of text blocks which may
/// carry cache-control markers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Plain string form.
    Text(String),
    /// Array-of-blocks form.
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// The canonical string form forwarded to the backend: array entries are
    /// joined with a single `\n`, otherwise the content is passed through
    /// byte-for-byte. A previous version normalized whitespace here and
    /// corrupted large prompts; the prompt is the cache key, so it must
    /// survive the round trip unchanged.
    pub fn canonical_text(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|block| {
                    let SystemBlock::Text { text, .. } = block;
                    text.as_str()
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A block of the array-form system prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemBlock {
    /// Text block, optionally marked cacheable.
    Text {
        /// The text content.
        text: String,
        /// Prompt-caching marker, preserved when forwarding.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

/// Prompt-caching marker on a content block.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CacheControl {
    /// The cache type; only `ephemeral` exists today.
    #[serde(rename = "type")]
    pub cache_type: CacheControlType,
}

/// Cache marker type.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheControlType {
    /// Cached for a short window on the serving node.
    Ephemeral,
}

/// A message in the conversation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    /// Sender role.
    pub role: Role,
    /// Message content; a plain string or an array of content blocks.
    pub content: MessageContent,
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Client message.
    User,
    /// Model message.
    Assistant,
}

/// Message content in either accepted shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Shorthand for a single text block.
    Text(String),
    /// Full array-of-blocks form.
    Blocks(Vec<ContentBlock>),
}

/// Content block in a message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
        /// Prompt-caching marker.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Image content.
    Image {
        /// The image source.
        source: ImageSource,
    },

    /// Tool invocation requested by the assistant.
    ToolUse {
        /// Unique identifier for this tool use.
        id: String,
        /// Name of the tool.
        name: String,
        /// Input parameters.
        input: Value,
    },

    /// Result of a tool execution, sent back by the client.
    ToolResult {
        /// The tool use this result answers.
        tool_use_id: String,
        /// Result payload.
        content: ToolResultContent,
        /// Whether the tool errored.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Payload of a tool result; a plain string or an array of text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Plain string form.
    Text(String),
    /// Array-of-blocks form.
    Blocks(Vec<ToolResultBlock>),
}

impl ToolResultContent {
    /// Flatten to the plain text the backend expects in a `tool` message.
    pub fn joined_text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| {
                    let ToolResultBlock::Text { text } = block;
                    text.as_str()
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A block of a tool result.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    /// Text result.
    Text {
        /// The text content.
        text: String,
    },
}

/// Image source for image blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    /// The source type, `base64` today.
    #[serde(rename = "type")]
    pub source_type: String,
    /// Media type, e.g. `image/jpeg`.
    pub media_type: String,
    /// Base64-encoded image data.
    pub data: String,
}

/// Request metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    /// Opaque caller identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Tool definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool input.
    pub input_schema: Value,
    /// Prompt-caching marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must use some tool.
    Any,
    /// The model must not use tools.
    None,
    /// The model must use the named tool.
    Tool {
        /// Name of the required tool.
        name: String,
    },
}

/// Response body for non-streaming requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesResponse {
    /// Unique identifier for this message.
    pub id: String,

    /// Always `message`.
    #[serde(rename = "type")]
    pub response_type: String,

    /// Always `assistant`.
    pub role: Role,

    /// Response content blocks.
    pub content: Vec<ResponseContent>,

    /// The model that generated the response.
    pub model: String,

    /// Why generation stopped.
    pub stop_reason: Option<StopReason>,

    /// The stop sequence hit, if any.
    pub stop_sequence: Option<String>,

    /// Token usage.
    pub usage: Usage,
}

/// Content block in a response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContent {
    /// Generated text.
    Text {
        /// The text content.
        text: String,
    },
    /// Tool invocation.
    ToolUse {
        /// Unique identifier for this tool use.
        id: String,
        /// Name of the tool.
        name: String,
        /// Input parameters.
        input: Value,
    },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural stopping point.
    EndTurn,
    /// The `max_tokens` limit was reached.
    MaxTokens,
    /// A stop sequence was produced.
    StopSequence,
    /// The model invoked a tool.
    ToolUse,
    /// The upstream stream failed; the response is truncated.
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
            StopReason::Error => "error",
        };
        f.write_str(name)
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
}

/// Error response body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    /// Always `error`.
    #[serde(rename = "type")]
    pub response_type: String,
    /// Error details.
    pub error: ErrorDetails,
}

impl ErrorResponse {
    /// Build an error response body.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response_type: "error".to_string(),
            error: ErrorDetails {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// Error details.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorDetails {
    /// Machine-readable error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable message.
    pub message: String,
}

/// Streaming event for SSE responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// Start of a message.
    #[serde(rename = "message_start")]
    MessageStart {
        /// Initial message metadata.
        message: StreamMessageStart,
    },

    /// A content block begins.
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        /// Index of the content block.
        index: u32,
        /// The block being started.
        content_block: ResponseContent,
    },

    /// Incremental content update.
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        /// Index of the content block.
        index: u32,
        /// The delta.
        delta: ContentDelta,
    },

    /// A content block is complete.
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {
        /// Index of the content block.
        index: u32,
    },

    /// Final message metadata: stop reason and cumulative usage.
    #[serde(rename = "message_delta")]
    MessageDelta {
        /// The delta.
        delta: MessageDelta,
        /// Cumulative usage.
        usage: Usage,
    },

    /// End of the stream. Always the last event.
    #[serde(rename = "message_stop")]
    MessageStop,

    /// Keep-alive.
    #[serde(rename = "ping")]
    Ping,

    /// Stream-level error.
    #[serde(rename = "error")]
    Error {
        /// The error.
        error: ErrorDetails,
    },
}

impl StreamEvent {
    /// The SSE `event:` name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Initial message metadata for `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageStart {
    /// Unique message id.
    pub id: String,
    /// Always `message`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Always `assistant`.
    pub role: Role,
    /// Initially empty.
    pub content: Vec<ResponseContent>,
    /// The model serving the request.
    pub model: String,
    /// Usage known so far.
    pub usage: Usage,
}

/// Delta payload of `content_block_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentDelta {
    /// Text appended to a text block.
    #[serde(rename = "text_delta")]
    TextDelta {
        /// The appended text.
        text: String,
    },
    /// A fragment of a tool-use block's input JSON. Concatenating the
    /// fragments in emission order yields the complete input document.
    #[serde(rename = "input_json_delta")]
    InputJsonDelta {
        /// The JSON fragment.
        partial_json: String,
    },
}

/// Delta payload of `message_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDelta {
    /// Why generation stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// The stop sequence hit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_prompt_accepts_both_shapes() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "qwen3-32b",
            "max_tokens": 64,
            "system": "You are helpful.",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(request.system.unwrap().canonical_text(), "You are helpful.");

        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "qwen3-32b",
            "max_tokens": 64,
            "system": [
                {"type": "text", "text": "You are helpful.", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "Answer briefly."}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(
            request.system.unwrap().canonical_text(),
            "You are helpful.\nAnswer briefly."
        );
    }

    #[test]
    fn canonical_text_preserves_whitespace() {
        let system = SystemPrompt::Text("  a\n\n\tb   c  ".to_string());
        assert_eq!(system.canonical_text(), "  a\n\n\tb   c  ");
    }

    #[test]
    fn dropped_parameters_are_accepted() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "qwen3-32b",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}],
            "reasoning": {"effort": "high"},
            "service_tier": "standard_only"
        }))
        .unwrap();

        assert!(request.reasoning.is_some());
        assert!(request.service_tier.is_some());

        // Neither survives serialization toward the backend.
        let forwarded = serde_json::to_value(&request).unwrap();
        assert!(forwarded.get("reasoning").is_none());
        assert!(forwarded.get("service_tier").is_none());
    }

    #[test]
    fn stream_events_serialize_with_type_tags() {
        let event = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: "hello".to_string(),
            },
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": "hello"}
            })
        );

        assert_eq!(event.name(), "content_block_delta");
    }

    #[test]
    fn tool_result_content_joins_blocks() {
        let content: ToolResultContent = serde_json::from_value(json!([
            {"type": "text", "text": "line one"},
            {"type": "text", "text": "line two"}
        ]))
        .unwrap();

        assert_eq!(content.joined_text(), "line one\nline two");
    }
}
