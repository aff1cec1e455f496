//! Inbound request translation: Anthropic Messages → OpenAI Chat Completions.

use crate::messages::{anthropic, openai};

/// Convert a Messages request into the chat-completion request sent to a
/// worker node.
///
/// The system prompt is forwarded byte-for-byte (array entries joined with a
/// single `\n`); `max_tokens` maps to `max_completion_tokens`; `top_k` has no
/// OpenAI equivalent and is dropped, as are the already-discarded `reasoning`
/// and `service_tier` parameters.
pub fn to_chat_request(request: &anthropic::MessagesRequest) -> openai::ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(openai::ChatMessage::text(openai::Role::System, system.canonical_text()));
    }

    for message in &request.messages {
        append_message(&mut messages, message);
    }

    let streaming = request.streaming();

    openai::ChatRequest {
        model: request.model.clone(),
        messages,
        max_completion_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        stream: streaming.then_some(true),
        stream_options: streaming.then_some(openai::StreamOptions { include_usage: true }),
        tools: request.tools.as_ref().map(|tools| tools.iter().map(tool_definition).collect()),
        tool_choice: request.tool_choice.as_ref().map(tool_choice),
        user: request.metadata.as_ref().and_then(|meta| meta.user_id.clone()),
    }
}

/// One Anthropic message can expand into several chat messages: tool_result
/// blocks become separate `tool` role messages, and text around them keeps
/// its relative order.
fn append_message(out: &mut Vec<openai::ChatMessage>, message: &anthropic::Message) {
    let role = match message.role {
        anthropic::Role::User => openai::Role::User,
        anthropic::Role::Assistant => openai::Role::Assistant,
    };

    let blocks = match &message.content {
        anthropic::MessageContent::Text(text) => {
            out.push(openai::ChatMessage::text(role, text.clone()));
            return;
        }
        anthropic::MessageContent::Blocks(blocks) => blocks,
    };

    let mut text = String::new();
    let mut tool_calls = Vec::new();

    let flush = |out: &mut Vec<openai::ChatMessage>, text: &mut String, tool_calls: &mut Vec<openai::ToolCall>| {
        if text.is_empty() && tool_calls.is_empty() {
            return;
        }

        out.push(openai::ChatMessage {
            role,
            content: (!text.is_empty()).then(|| std::mem::take(text)),
            tool_calls: (!tool_calls.is_empty()).then(|| std::mem::take(tool_calls)),
            tool_call_id: None,
        });
    };

    for block in blocks {
        match block {
            anthropic::ContentBlock::Text { text: t, .. } => {
                text.push_str(t);
            }
            // No multimodal passthrough: local workers are text-only, so the
            // image is replaced by a placeholder rather than rejected.
            anthropic::ContentBlock::Image { .. } => {
                text.push_str("[image omitted]");
            }
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Tool results end the pending user text first so ordering
                // across the boundary is preserved.
                flush(out, &mut text, &mut tool_calls);

                let mut result = content.joined_text();
                if is_error.unwrap_or(false) {
                    result = format!("Error: {result}");
                }

                out.push(openai::ChatMessage {
                    role: openai::Role::Tool,
                    content: Some(result),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
        }
    }

    flush(out, &mut text, &mut tool_calls);
}

fn tool_definition(tool: &anthropic::Tool) -> openai::ToolDefinition {
    openai::ToolDefinition {
        tool_type: "function".to_string(),
        function: openai::FunctionDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn tool_choice(choice: &anthropic::ToolChoice) -> openai::ToolChoice {
    match choice {
        anthropic::ToolChoice::Auto => openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto),
        anthropic::ToolChoice::Any => openai::ToolChoice::Mode(openai::ToolChoiceMode::Required),
        anthropic::ToolChoice::None => openai::ToolChoice::Mode(openai::ToolChoiceMode::None),
        anthropic::ToolChoice::Tool { name } => openai::ToolChoice::Specific {
            choice_type: "function".to_string(),
            function: openai::FunctionChoice { name: name.clone() },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: serde_json::Value) -> anthropic::MessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_prompt_becomes_first_message() {
        let request = parse(json!({
            "model": "qwen3-32b",
            "max_tokens": 128,
            "system": "You are helpful.",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = to_chat_request(&request);

        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, openai::Role::System);
        assert_eq!(chat.messages[0].content.as_deref(), Some("You are helpful."));
        assert_eq!(chat.max_completion_tokens, Some(128));
        assert!(chat.stream.is_none());
        assert!(chat.stream_options.is_none());
    }

    #[test]
    fn system_prompt_whitespace_survives_translation() {
        let prompt = "Line one.\n\n    indented\t\ttabs   trailing  ";
        let request = parse(json!({
            "model": "qwen3-32b",
            "max_tokens": 16,
            "system": prompt,
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = to_chat_request(&request);
        assert_eq!(chat.messages[0].content.as_deref(), Some(prompt));
    }

    #[test]
    fn streaming_opts_into_usage_chunks() {
        let request = parse(json!({
            "model": "qwen3-32b",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = to_chat_request(&request);
        assert_eq!(chat.stream, Some(true));
        assert!(chat.stream_options.unwrap().include_usage);
    }

    #[test]
    fn tool_use_becomes_assistant_tool_calls() {
        let request = parse(json!({
            "model": "qwen3-32b",
            "max_tokens": 16,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Checking the weather."},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Oslo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "rainy"}
                ]}
            ]
        }));

        let chat = to_chat_request(&request);

        assert_eq!(chat.messages.len(), 2);

        let assistant = &chat.messages[0];
        assert_eq!(assistant.role, openai::Role::Assistant);
        assert_eq!(assistant.content.as_deref(), Some("Checking the weather."));
        let call = &assistant.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.function.name, "get_weather");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&call.function.arguments).unwrap(),
            json!({"city": "Oslo"})
        );

        let tool = &chat.messages[1];
        assert_eq!(tool.role, openai::Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(tool.content.as_deref(), Some("rainy"));
    }

    #[test]
    fn errored_tool_result_is_prefixed() {
        let request = parse(json!({
            "model": "qwen3-32b",
            "max_tokens": 16,
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_9", "content": "boom", "is_error": true}
                ]}
            ]
        }));

        let chat = to_chat_request(&request);
        assert_eq!(chat.messages[0].content.as_deref(), Some("Error: boom"));
    }

    #[test]
    fn text_after_tool_result_keeps_order() {
        let request = parse(json!({
            "model": "qwen3-32b",
            "max_tokens": 16,
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "before"},
                    {"type": "tool_result", "tool_use_id": "toolu_2", "content": "out"},
                    {"type": "text", "text": "after"}
                ]}
            ]
        }));

        let chat = to_chat_request(&request);

        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.messages[0].content.as_deref(), Some("before"));
        assert_eq!(chat.messages[1].role, openai::Role::Tool);
        assert_eq!(chat.messages[2].content.as_deref(), Some("after"));
    }

    #[test]
    fn tool_choice_mappings() {
        for (anthropic_choice, expected) in [
            (json!({"type": "auto"}), json!("auto")),
            (json!({"type": "any"}), json!("required")),
            (json!({"type": "none"}), json!("none")),
            (
                json!({"type": "tool", "name": "get_weather"}),
                json!({"type": "function", "function": {"name": "get_weather"}}),
            ),
        ] {
            let request = parse(json!({
                "model": "qwen3-32b",
                "max_tokens": 16,
                "tool_choice": anthropic_choice,
                "messages": [{"role": "user", "content": "hi"}]
            }));

            let chat = to_chat_request(&request);
            assert_eq!(serde_json::to_value(chat.tool_choice.unwrap()).unwrap(), expected);
        }
    }

    #[test]
    fn tool_order_is_preserved() {
        let request = parse(json!({
            "model": "qwen3-32b",
            "max_tokens": 16,
            "tools": [
                {"name": "zebra", "input_schema": {}},
                {"name": "aardvark", "input_schema": {}}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = to_chat_request(&request);
        let tools = chat.tools.unwrap();
        assert_eq!(tools[0].function.name, "zebra");
        assert_eq!(tools[1].function.name, "aardvark");
    }
}
