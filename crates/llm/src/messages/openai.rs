//! OpenAI Chat Completions types for the backend-facing side.
//!
//! Worker nodes (MLX servers, LMStudio, OpenRouter, or anything else
//! OpenAI-compatible) all speak this protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The model identifier as the node knows it.
    pub model: String,

    /// Conversation messages, system prompt included as the first message.
    pub messages: Vec<ChatMessage>,

    /// Output token budget. Modern servers reject the legacy `max_tokens`
    /// spelling for reasoning models, so only the new field is sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Whether the response is streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Streaming options; usage reporting must be opted into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,

    /// Tools available to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    /// Tool choice constraint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Opaque end-user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Streaming options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Ask the server for a final usage chunk.
    pub include_usage: bool,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender role.
    pub role: Role,

    /// Text content. Absent for assistant messages that only carry tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool calls issued by the assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// For `tool` role messages: the call this message answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A plain text message with the given role.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions to the model.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// A completed tool call on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Stable identifier for the call.
    pub id: String,
    /// Always `function`.
    #[serde(rename = "type")]
    pub call_type: String,
    /// The invoked function.
    pub function: FunctionCall,
}

/// Function name and serialized arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,
    /// Arguments as a JSON-encoded string.
    pub arguments: String,
}

/// Tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Always `function`.
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function being exposed.
    pub function: FunctionDefinition,
}

/// Function schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Function name.
    pub name: String,
    /// What the function does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the parameters.
    pub parameters: Value,
}

/// Tool choice constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `auto`, `none` or `required`.
    Mode(ToolChoiceMode),
    /// A specific function.
    Specific {
        /// Always `function`.
        #[serde(rename = "type")]
        choice_type: String,
        /// The required function.
        function: FunctionChoice,
    },
}

/// Plain tool-choice modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    /// The model decides.
    Auto,
    /// Tools must not be used.
    None,
    /// Some tool must be used.
    Required,
}

/// Name of a specifically required function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionChoice {
    /// Function name.
    pub name: String,
}

/// Non-streaming response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Server-assigned completion id.
    pub id: String,
    /// The model that served the request.
    #[serde(default)]
    pub model: Option<String>,
    /// Completion choices; the proxy reads index 0.
    pub choices: Vec<Choice>,
    /// Token usage.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// A completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Choice index.
    pub index: u32,
    /// The generated message.
    pub message: ResponseMessage,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// The generated message of a choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Always `assistant`.
    pub role: Role,
    /// Generated text.
    #[serde(default)]
    pub content: Option<String>,
    /// Tool calls issued by the model.
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Token limit hit.
    Length,
    /// The model called tools.
    ToolCalls,
    /// Content was filtered.
    ContentFilter,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens consumed.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Completion tokens generated.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Sum of the two.
    #[serde(default)]
    pub total_tokens: u32,
}

/// Streaming chunk body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Server-assigned completion id.
    #[serde(default)]
    pub id: Option<String>,
    /// The model that served the request.
    #[serde(default)]
    pub model: Option<String>,
    /// Delta choices; empty on usage-only chunks.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Usage, present on the final chunk when requested.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// A streaming choice delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index.
    #[serde(default)]
    pub index: u32,
    /// The incremental update.
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Why generation stopped, on the closing chunk.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, sent on the first chunk.
    #[serde(default)]
    pub role: Option<Role>,
    /// Appended text.
    #[serde(default)]
    pub content: Option<String>,
    /// Tool-call fragments.
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

/// A fragment of a streamed tool call. The first fragment for an index
/// carries the id and function name; later fragments append to the
/// arguments string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFragment {
    /// Position of the call in the assistant message.
    #[serde(default)]
    pub index: u32,
    /// Call id, present on the opening fragment.
    #[serde(default)]
    pub id: Option<String>,
    /// Always `function` when present.
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    /// Name and/or argument fragment.
    #[serde(default)]
    pub function: Option<FunctionFragment>,
}

/// Function name and argument fragment of a streamed tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionFragment {
    /// Function name, present on the opening fragment.
    #[serde(default)]
    pub name: Option<String>,
    /// Argument string fragment.
    #[serde(default)]
    pub arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_streaming_tool_call_fragments() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1736000000,
            "model": "qwen3-32b",
            "choices": [{
                "index": 0,
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": ""}
                    }]
                },
                "finish_reason": null
            }]
        }))
        .unwrap();

        let fragment = &chunk.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(fragment.id.as_deref(), Some("call_abc"));
        assert_eq!(fragment.function.as_ref().unwrap().name.as_deref(), Some("get_weather"));
    }

    #[test]
    fn parses_usage_only_chunk() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [],
            "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}
        }))
        .unwrap();

        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().completion_tokens, 34);
    }

    #[test]
    fn tool_choice_shapes_serialize() {
        let auto = ToolChoice::Mode(ToolChoiceMode::Auto);
        assert_eq!(serde_json::to_value(&auto).unwrap(), json!("auto"));

        let specific = ToolChoice::Specific {
            choice_type: "function".to_string(),
            function: FunctionChoice {
                name: "get_weather".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&specific).unwrap(),
            json!({"type": "function", "function": {"name": "get_weather"}})
        );
    }

    #[test]
    fn unknown_response_fields_are_ignored() {
        let response: ChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1736000000,
            "model": "qwen3-32b",
            "system_fingerprint": "fp_x",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop",
                "logprobs": null
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        }))
        .unwrap();

        assert_eq!(response.choices[0].message.content.as_deref(), Some("hi"));
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
    }
}
