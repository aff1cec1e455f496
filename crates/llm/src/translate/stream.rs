//! Outbound stream translation: OpenAI chat-completion chunks → Anthropic
//! Messages events.
//!
//! The translator runs as its own task and hands events to the HTTP writer
//! through a bounded channel. The channel is the backpressure contract: a
//! full channel suspends the translator, and the upstream chunk stream is
//! only polled again once the client has accepted the previous event.
//!
//! Terminal guarantees, independent of upstream behavior:
//! - exactly one `message_start` and exactly one `message_stop`
//! - every opened content block is closed before `message_delta`
//! - a watchdog re-armed on every chunk force-finishes silent streams

use std::collections::BTreeMap;
use std::time::Duration;

use futures::{Stream, StreamExt, stream::BoxStream};
use tokio::sync::mpsc;

use crate::{
    LlmError,
    messages::{
        anthropic::{
            ContentDelta, MessageDelta, MessagesResponse, ResponseContent, Role, StopReason, StreamEvent,
            StreamMessageStart, Usage,
        },
        openai,
    },
};

/// Upstream chunk stream as produced by the node provider.
pub type ChunkStream = BoxStream<'static, Result<openai::ChatChunk, LlmError>>;

/// Events are translated ahead of the client by at most this many items.
const CHANNEL_CAPACITY: usize = 32;

/// Translate an upstream chunk stream into the client-facing event sequence.
///
/// `watchdog` bounds upstream silence: it is armed when translation starts
/// and re-armed on every chunk. When it fires, a synthetic terminal sequence
/// is emitted so the client never hangs.
pub fn translate(upstream: ChunkStream, model: String, watchdog: Duration) -> impl Stream<Item = StreamEvent> + Send {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(run_translation(upstream, model, watchdog, tx));

    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) })
}

/// Buffer the full translated stream into a single non-streaming response.
///
/// Tool-use input is the concatenation of the block's `input_json_delta`
/// fragments; a concatenation that does not parse is downgraded to an empty
/// object rather than failing the whole response.
pub async fn collect(events: impl Stream<Item = StreamEvent>) -> Result<MessagesResponse, LlmError> {
    futures::pin_mut!(events);

    let mut id = None;
    let mut model = None;
    let mut blocks: BTreeMap<u32, BlockBuffer> = BTreeMap::new();
    let mut stop_reason = None;
    let mut stop_sequence = None;
    let mut usage = Usage::default();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::MessageStart { message } => {
                id = Some(message.id);
                model = Some(message.model);
            }
            StreamEvent::ContentBlockStart { index, content_block } => {
                let buffer = match content_block {
                    ResponseContent::Text { text } => BlockBuffer::Text(text),
                    ResponseContent::ToolUse { id, name, .. } => BlockBuffer::ToolUse {
                        id,
                        name,
                        arguments: String::new(),
                    },
                };
                blocks.insert(index, buffer);
            }
            StreamEvent::ContentBlockDelta { index, delta } => match (blocks.get_mut(&index), delta) {
                (Some(BlockBuffer::Text(text)), ContentDelta::TextDelta { text: fragment }) => {
                    text.push_str(&fragment);
                }
                (Some(BlockBuffer::ToolUse { arguments, .. }), ContentDelta::InputJsonDelta { partial_json }) => {
                    arguments.push_str(&partial_json);
                }
                _ => {
                    log::warn!("Dropping mismatched content delta for block {index}");
                }
            },
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => {}
            StreamEvent::MessageDelta { delta, usage: total } => {
                stop_reason = delta.stop_reason;
                stop_sequence = delta.stop_sequence;
                usage = total;
            }
            StreamEvent::MessageStop => break,
            StreamEvent::Error { error } => {
                return Err(LlmError::InternalError(Some(error.message)));
            }
        }
    }

    let content = blocks
        .into_values()
        .map(|buffer| match buffer {
            BlockBuffer::Text(text) => ResponseContent::Text { text },
            BlockBuffer::ToolUse { id, name, arguments } => {
                let input = parse_tool_arguments(&name, &arguments);
                ResponseContent::ToolUse { id, name, input }
            }
        })
        .collect();

    Ok(MessagesResponse {
        id: id.unwrap_or_else(new_message_id),
        response_type: "message".to_string(),
        role: Role::Assistant,
        content,
        model: model.unwrap_or_default(),
        stop_reason,
        stop_sequence,
        usage,
    })
}

enum BlockBuffer {
    Text(String),
    ToolUse { id: String, name: String, arguments: String },
}

fn parse_tool_arguments(name: &str, arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }

    match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(error) => {
            log::warn!("Tool call `{name}` produced unparseable arguments: {error}");
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}

fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

async fn run_translation(
    mut upstream: ChunkStream,
    model: String,
    watchdog: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut state = TranslationState::new(model);

    let start = state.message_start();
    if tx.send(start).await.is_err() {
        // Client went away before the first event; dropping the upstream
        // stream cancels the backend call.
        return;
    }

    loop {
        match tokio::time::timeout(watchdog, upstream.next()).await {
            Err(_) => {
                log::warn!("Upstream stream silent for {watchdog:?}; forcing terminal events");
                state.stop_reason = Some(StopReason::Error);
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(chunk))) => {
                for event in state.on_chunk(chunk) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Some(Err(error))) => {
                log::warn!("Upstream stream error: {error}");
                state.stop_reason = Some(StopReason::Error);
                break;
            }
        }
    }

    for event in state.finish() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

/// Per-response translation state. Content-block indexes are assigned in
/// first-seen order; upstream tool-call slots are tracked by their own index
/// and mapped onto block indexes when their opening fragment arrives.
struct TranslationState {
    message_id: String,
    model: String,
    next_index: u32,
    open_text: Option<u32>,
    tool_slots: BTreeMap<u32, ToolSlot>,
    stop_reason: Option<StopReason>,
    usage: openai::Usage,
    terminal_sent: bool,
}

enum ToolSlot {
    /// Argument fragments that arrived before the opening fragment.
    Pending(Vec<String>),
    Open { block_index: u32, id: String },
}

impl TranslationState {
    fn new(model: String) -> Self {
        Self {
            message_id: new_message_id(),
            model,
            next_index: 0,
            open_text: None,
            tool_slots: BTreeMap::new(),
            stop_reason: None,
            usage: openai::Usage::default(),
            terminal_sent: false,
        }
    }

    fn message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: StreamMessageStart {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                usage: Usage::default(),
            },
        }
    }

    fn on_chunk(&mut self, chunk: openai::ChatChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        let usage_only = chunk.usage.is_some();
        if let Some(usage) = chunk.usage {
            self.usage = usage;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            // Usage-only chunks carry no client-visible payload; other
            // empty chunks become keep-alives.
            if !usage_only {
                events.push(StreamEvent::Ping);
            }
            return events;
        };

        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            let index = self.ensure_text_block(&mut events);
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::TextDelta { text: content },
            });
        }

        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            self.on_tool_fragment(fragment, &mut events);
        }

        if let Some(reason) = choice.finish_reason {
            self.stop_reason = Some(match reason {
                openai::FinishReason::Stop => StopReason::EndTurn,
                openai::FinishReason::Length => StopReason::MaxTokens,
                openai::FinishReason::ToolCalls => StopReason::ToolUse,
                openai::FinishReason::ContentFilter => StopReason::EndTurn,
            });
        }

        events
    }

    fn ensure_text_block(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some(index) = self.open_text {
            return index;
        }

        let index = self.next_index;
        self.next_index += 1;
        self.open_text = Some(index);

        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContent::Text { text: String::new() },
        });

        index
    }

    fn on_tool_fragment(&mut self, fragment: openai::ToolCallFragment, events: &mut Vec<StreamEvent>) {
        let slot_index = fragment.index;
        let function = fragment.function.unwrap_or_default();
        let has_start = fragment.id.is_some() || function.name.is_some();

        if let Some(ToolSlot::Open { block_index, id }) = self.tool_slots.get(&slot_index) {
            let block_index = *block_index;

            if let Some(fragment_id) = &fragment.id
                && fragment_id != id
            {
                log::warn!(
                    "Tool call id mismatch in slot {slot_index}: expected `{id}`, got `{fragment_id}`; \
                     fragment dropped"
                );
                return;
            }

            if let Some(arguments) = function.arguments
                && !arguments.is_empty()
            {
                events.push(StreamEvent::ContentBlockDelta {
                    index: block_index,
                    delta: ContentDelta::InputJsonDelta { partial_json: arguments },
                });
            }

            return;
        }

        if !has_start {
            // An argument fragment ahead of its opening fragment; buffer it
            // until the start shows up.
            if let Some(arguments) = function.arguments
                && !arguments.is_empty()
            {
                match self.tool_slots.entry(slot_index) {
                    std::collections::btree_map::Entry::Occupied(mut entry) => {
                        if let ToolSlot::Pending(buffered) = entry.get_mut() {
                            buffered.push(arguments);
                        }
                    }
                    std::collections::btree_map::Entry::Vacant(entry) => {
                        entry.insert(ToolSlot::Pending(vec![arguments]));
                    }
                }
            }
            return;
        }

        // Opening fragment. The text block ends where the tool block begins.
        self.close_text_block(events);

        let block_index = self.next_index;
        self.next_index += 1;

        let id = fragment
            .id
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
        let name = function.name.unwrap_or_default();

        events.push(StreamEvent::ContentBlockStart {
            index: block_index,
            content_block: ResponseContent::ToolUse {
                id: id.clone(),
                name,
                input: serde_json::Value::Object(serde_json::Map::new()),
            },
        });

        // Flush fragments that arrived ahead of the start, in order.
        if let Some(ToolSlot::Pending(buffered)) = self.tool_slots.remove(&slot_index) {
            for arguments in buffered {
                events.push(StreamEvent::ContentBlockDelta {
                    index: block_index,
                    delta: ContentDelta::InputJsonDelta { partial_json: arguments },
                });
            }
        }

        if let Some(arguments) = function.arguments
            && !arguments.is_empty()
        {
            events.push(StreamEvent::ContentBlockDelta {
                index: block_index,
                delta: ContentDelta::InputJsonDelta { partial_json: arguments },
            });
        }

        self.tool_slots.insert(slot_index, ToolSlot::Open { block_index, id });
    }

    fn close_text_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_text.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    /// Close every open block and emit the terminal pair. Idempotent: the
    /// sent-flag makes a second call a no-op, so the terminal sequence is
    /// emitted exactly once however the upstream stream ended.
    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.terminal_sent {
            return Vec::new();
        }
        self.terminal_sent = true;

        let mut events = Vec::new();

        let mut open_blocks: Vec<u32> = self.open_text.take().into_iter().collect();
        for slot in self.tool_slots.values() {
            if let ToolSlot::Open { block_index, .. } = slot {
                open_blocks.push(*block_index);
            }
        }
        open_blocks.sort_unstable();

        for index in open_blocks {
            events.push(StreamEvent::ContentBlockStop { index });
        }

        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens: self.usage.prompt_tokens,
                output_tokens: self.usage.completion_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);

        events
    }
}
