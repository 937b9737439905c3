//! The streaming conversion state machine.
//!
//! A [`StreamConverter`] is a finite-state transducer from backend chunks to
//! Anthropic SSE events. One converter is instantiated per request and owned
//! exclusively by the request's task; its state is never touched concurrently.
//!
//! The tricky part is tool calls. A backend may stream a tool invocation
//! incrementally, send it as one atomic chunk, or do both for the same id.
//! The converter guarantees exactly one `tool_use` content block per unique
//! tool-call id regardless of which forms arrive, and in which order.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::chunk::{BackendChunk, ChunkUsage};
use crate::messages::anthropic::{
    ContentBlock, ContentDelta, MessageDeltaPayload, MessagesResponse, Role, StopReason, StreamEvent,
    StreamMessageStart, Usage,
};

/// Anthropic caps responses at this many content blocks; starts past the cap
/// are dropped and counted.
pub const MAX_CONTENT_BLOCKS: u32 = 128;

/// Kind of the currently open non-tool block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlainBlock {
    Text,
    Reasoning,
}

#[derive(Debug)]
struct OpenTool {
    index: u32,
    received_any_delta: bool,
}

/// Per-request streaming state. See the module docs for the contract.
pub struct StreamConverter {
    message_id: String,
    model: String,
    next_index: u32,
    open_plain: Option<PlainBlock>,
    plain_suppressed: bool,
    streaming_tools: HashMap<String, OpenTool>,
    suppressed_tools: HashSet<String>,
    emitted_tools: HashSet<String>,
    overflow_blocks: u64,
    finished: bool,
}

impl StreamConverter {
    /// Fresh converter for one request. The model is echoed back to the
    /// client in `message_start`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            next_index: 0,
            open_plain: None,
            plain_suppressed: false,
            streaming_tools: HashMap::new(),
            suppressed_tools: HashSet::new(),
            emitted_tools: HashSet::new(),
            overflow_blocks: 0,
            finished: false,
        }
    }

    /// The `message_start` event emitted when the stream opens.
    pub fn open_event(&self) -> StreamEvent {
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

    /// Whether `message_stop` has been emitted; later chunks are dropped.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Content-block starts dropped by the block cap.
    pub fn overflow_blocks(&self) -> u64 {
        self.overflow_blocks
    }

    /// Feed one backend chunk, producing zero or more events in order.
    pub fn on_chunk(&mut self, chunk: BackendChunk) -> Vec<StreamEvent> {
        if self.finished {
            log::debug!("dropping backend chunk after message_stop");
            return Vec::new();
        }

        match chunk {
            BackendChunk::TextStart => self.start_plain(PlainBlock::Text),
            BackendChunk::ReasoningStart => self.start_plain(PlainBlock::Reasoning),
            BackendChunk::TextDelta(text) => self.plain_delta(PlainBlock::Text, text),
            BackendChunk::ReasoningDelta(text) => self.plain_delta(PlainBlock::Reasoning, text),
            BackendChunk::TextEnd | BackendChunk::ReasoningEnd => self.end_plain(),
            BackendChunk::ToolInputStart { id, name } => self.tool_input_start(id, name),
            BackendChunk::ToolInputDelta { id, partial_json } => self.tool_input_delta(id, partial_json),
            BackendChunk::ToolInputEnd { id } => self.tool_input_end(id),
            BackendChunk::ToolCall { id, name, input } => self.tool_call(id, name, input),
            BackendChunk::Finish { reason, usage } => self.finish(reason, usage),
            BackendChunk::Error { kind, message } => self.error(kind.wire_name(), message),
        }
    }

    fn block_budget_left(&mut self) -> bool {
        if self.next_index >= MAX_CONTENT_BLOCKS {
            self.overflow_blocks += 1;
            false
        } else {
            true
        }
    }

    fn start_plain(&mut self, kind: PlainBlock) -> Vec<StreamEvent> {
        if !self.block_budget_left() {
            self.plain_suppressed = true;
            return Vec::new();
        }

        self.open_plain = Some(kind);

        let content_block = match kind {
            PlainBlock::Text => ContentBlock::Text { text: String::new() },
            PlainBlock::Reasoning => ContentBlock::Thinking {
                thinking: String::new(),
            },
        };

        vec![StreamEvent::ContentBlockStart {
            index: self.next_index,
            content_block,
        }]
    }

    fn plain_delta(&mut self, kind: PlainBlock, text: String) -> Vec<StreamEvent> {
        if self.plain_suppressed {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);

        // A delta without a preceding start: synthesize the start so the
        // stream stays alive against sloppy backends.
        if self.open_plain.is_none() {
            events.extend(self.start_plain(kind));
            if self.plain_suppressed {
                return Vec::new();
            }
        }

        let delta = match self.open_plain.unwrap_or(kind) {
            PlainBlock::Text => ContentDelta::TextDelta { text },
            PlainBlock::Reasoning => ContentDelta::ThinkingDelta { thinking: text },
        };

        events.push(StreamEvent::ContentBlockDelta {
            index: self.next_index,
            delta,
        });
        events
    }

    fn end_plain(&mut self) -> Vec<StreamEvent> {
        if self.plain_suppressed {
            self.plain_suppressed = false;
            return Vec::new();
        }

        if self.open_plain.take().is_none() {
            return Vec::new();
        }

        let event = StreamEvent::ContentBlockStop { index: self.next_index };
        self.next_index += 1;
        vec![event]
    }

    fn tool_input_start(&mut self, id: String, name: String) -> Vec<StreamEvent> {
        if self.streaming_tools.contains_key(&id) || self.emitted_tools.contains(&id) {
            log::debug!("duplicate tool_input_start for id '{id}' dropped");
            return Vec::new();
        }

        if !self.block_budget_left() {
            self.suppressed_tools.insert(id);
            return Vec::new();
        }

        let index = self.next_index;
        self.streaming_tools.insert(
            id.clone(),
            OpenTool {
                index,
                received_any_delta: false,
            },
        );

        vec![StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse {
                id,
                name,
                input: Value::Object(Default::default()),
            },
        }]
    }

    fn tool_input_delta(&mut self, id: String, partial_json: String) -> Vec<StreamEvent> {
        if self.suppressed_tools.contains(&id) || self.emitted_tools.contains(&id) {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);

        // Out-of-order backends can send the first delta before the start;
        // synthesize the start retroactively to preserve liveness.
        if !self.streaming_tools.contains_key(&id) {
            log::debug!("synthesizing tool_input_start for unannounced id '{id}'");
            events.extend(self.tool_input_start(id.clone(), String::new()));
            if !self.streaming_tools.contains_key(&id) {
                return Vec::new();
            }
        }

        let tool = self
            .streaming_tools
            .get_mut(&id)
            .expect("entry inserted above");
        tool.received_any_delta = true;

        events.push(StreamEvent::ContentBlockDelta {
            index: tool.index,
            delta: ContentDelta::InputJsonDelta { partial_json },
        });
        events
    }

    fn tool_input_end(&mut self, id: String) -> Vec<StreamEvent> {
        let Some(tool) = self.streaming_tools.get(&id) else {
            return Vec::new();
        };

        // No deltas seen: some backends only send the atomic tool_call and
        // never stream the input. Hold the block open until it arrives (or
        // until finish flushes it).
        if !tool.received_any_delta {
            return Vec::new();
        }

        let index = tool.index;
        self.streaming_tools.remove(&id);
        self.emitted_tools.insert(id);
        self.next_index = self.next_index.max(index + 1);

        vec![StreamEvent::ContentBlockStop { index }]
    }

    fn tool_call(&mut self, id: String, name: String, input: Value) -> Vec<StreamEvent> {
        if self.emitted_tools.contains(&id) || self.suppressed_tools.contains(&id) {
            log::debug!("duplicate tool_call for id '{id}' dropped");
            return Vec::new();
        }

        if let Some(tool) = self.streaming_tools.get(&id) {
            if tool.received_any_delta {
                // The streamed form already carried the input; this atomic
                // repeat is redundant.
                log::debug!("redundant tool_call after streamed input for id '{id}' dropped");
                return Vec::new();
            }

            // Streamed start arrived but the input never did; the atomic
            // chunk supplies it as a single delta.
            let index = tool.index;
            self.streaming_tools.remove(&id);
            self.emitted_tools.insert(id);
            self.next_index = self.next_index.max(index + 1);

            return vec![
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                    },
                },
                StreamEvent::ContentBlockStop { index },
            ];
        }

        if !self.block_budget_left() {
            self.suppressed_tools.insert(id);
            return Vec::new();
        }

        let index = self.next_index;
        self.next_index += 1;
        self.emitted_tools.insert(id.clone());

        vec![
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, input },
            },
            StreamEvent::ContentBlockStop { index },
        ]
    }

    fn finish(&mut self, reason: StopReason, usage: Option<ChunkUsage>) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if self.open_plain.take().is_some() {
            events.push(StreamEvent::ContentBlockStop { index: self.next_index });
            self.next_index += 1;
        }
        self.plain_suppressed = false;

        // Still-open streamed tools flush in index order.
        let mut open: Vec<(String, u32)> = self
            .streaming_tools
            .drain()
            .map(|(id, tool)| (id, tool.index))
            .collect();
        open.sort_by_key(|(_, index)| *index);

        for (id, index) in open {
            self.emitted_tools.insert(id);
            events.push(StreamEvent::ContentBlockStop { index });
            self.next_index = self.next_index.max(index + 1);
        }

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaPayload {
                stop_reason: Some(reason),
                stop_sequence: None,
            },
            usage: usage
                .map(|u| Usage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                })
                .unwrap_or_default(),
        });
        events.push(StreamEvent::MessageStop);

        self.finished = true;
        events
    }

    fn error(&mut self, error_type: &str, message: String) -> Vec<StreamEvent> {
        self.finished = true;

        vec![
            StreamEvent::Error {
                error: crate::messages::anthropic::ErrorDetails {
                    error_type: error_type.to_string(),
                    message,
                },
            },
            StreamEvent::MessageStop,
        ]
    }
}

/// Fold a full event sequence into the non-streaming response envelope.
/// Used when the client asked for `stream: false`: the backend stream still
/// runs to completion, buffered here instead of being written out.
pub fn collect_response(events: Vec<StreamEvent>, fallback_model: &str) -> MessagesResponse {
    let mut id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let mut model = fallback_model.to_string();
    let mut stop_reason = None;
    let mut stop_sequence = None;
    let mut usage = Usage::default();

    // index → (block, accumulated tool-input json)
    let mut blocks: Vec<(u32, ContentBlock, String)> = Vec::new();

    for event in events {
        match event {
            StreamEvent::MessageStart { message } => {
                id = message.id;
                model = message.model;
            }
            StreamEvent::ContentBlockStart { index, content_block } => {
                blocks.push((index, content_block, String::new()));
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some((_, block, buffer)) = blocks.iter_mut().find(|(i, ..)| *i == index) else {
                    continue;
                };

                match (block, delta) {
                    (ContentBlock::Text { text }, ContentDelta::TextDelta { text: chunk }) => text.push_str(&chunk),
                    (ContentBlock::Thinking { thinking }, ContentDelta::ThinkingDelta { thinking: chunk }) => {
                        thinking.push_str(&chunk)
                    }
                    (ContentBlock::ToolUse { .. }, ContentDelta::InputJsonDelta { partial_json }) => {
                        buffer.push_str(&partial_json)
                    }
                    _ => {}
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                let Some((_, block, buffer)) = blocks.iter_mut().find(|(i, ..)| *i == index) else {
                    continue;
                };

                if let ContentBlock::ToolUse { input, .. } = block
                    && !buffer.is_empty()
                {
                    *input = serde_json::from_str(buffer)
                        .unwrap_or_else(|_| Value::Object(Default::default()));
                }
            }
            StreamEvent::MessageDelta { delta, usage: u } => {
                stop_reason = delta.stop_reason.or(stop_reason);
                stop_sequence = delta.stop_sequence.or(stop_sequence);
                usage = u;
            }
            StreamEvent::MessageStop | StreamEvent::Ping | StreamEvent::Error { .. } => {}
        }
    }

    blocks.sort_by_key(|(index, ..)| *index);

    MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: Role::Assistant,
        content: blocks.into_iter().map(|(_, block, _)| block).collect(),
        model,
        stop_reason,
        stop_sequence,
        usage,
    }
}
