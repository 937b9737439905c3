//! Anthropic pass-through backend.
//!
//! The upstream already speaks the client's protocol, but the SSE still gets
//! parsed into uniform chunks and re-emitted by the stream converter. That
//! keeps one code path for backpressure, keepalives, cancellation and block
//! accounting no matter which backend serves the request.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use super::{Backend, RequestContext};
use crate::chunk::{BackendChunk, BackendErrorKind, ChunkStream, ChunkUsage};
use crate::error::{ProxyError, ProxyResult};
use crate::http_client::http_client;
use crate::messages::anthropic::{
    ContentBlock, ContentDelta, MessagesRequest, StopReason, StreamEvent,
};

const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) struct AnthropicBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    default_model: Option<String>,
}

impl AnthropicBackend {
    pub fn new(config: &config::BackendConfig) -> Self {
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            client: http_client(),
            base_url,
            api_key: config.api_key.clone(),
            default_model: config.model.clone(),
        }
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn open_stream(&self, request: &MessagesRequest, context: &RequestContext) -> ProxyResult<ChunkStream> {
        let Some(key) = context.api_key.as_ref().or(self.api_key.as_ref()) else {
            return Err(ProxyError::Unauthorized(
                "no API key in the request and none configured".to_string(),
            ));
        };

        let mut body = request.clone();
        body.stream = Some(true);
        if body.model.is_none() {
            body.model = self.default_model.clone();
        }

        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| ProxyError::BackendUnreachable(format!("failed to reach Anthropic: {error}")))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<empty body>".to_string());
            log::error!("Anthropic returned {status} opening a stream: {body}");
            return Err(ProxyError::from_upstream_status(status.as_u16(), body));
        }

        Ok(chunk_stream(response))
    }
}

fn chunk_stream(response: reqwest::Response) -> ChunkStream {
    struct State {
        events: std::pin::Pin<Box<dyn futures::Stream<Item = Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>> + Send>>,
        mapper: PassthroughMapper,
        queue: VecDeque<BackendChunk>,
        done: bool,
    }

    let state = State {
        events: Box::pin(response.bytes_stream().eventsource()),
        mapper: PassthroughMapper::default(),
        queue: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                return Some((chunk, state));
            }

            if state.done {
                return None;
            }

            match state.events.next().await {
                None => {
                    state.done = true;
                }
                Some(Err(eventsource_stream::EventStreamError::Transport(error))) => {
                    state.queue.push_back(BackendChunk::Error {
                        kind: BackendErrorKind::Unreachable,
                        message: format!("upstream connection failed mid-stream: {error}"),
                    });
                    state.done = true;
                }
                Some(Err(error)) => {
                    log::warn!("SSE parsing error in Anthropic stream: {error}");
                }
                Some(Ok(event)) => match serde_json::from_str::<StreamEvent>(&event.data) {
                    Ok(event) => state.queue.extend(state.mapper.on_event(event)),
                    Err(error) => {
                        log::warn!("dropping unparseable Anthropic stream event: {error}");
                    }
                },
            }
        }
    }))
}

/// What kind of block is open at a given index upstream.
enum OpenBlock {
    Text,
    Thinking,
    Tool { id: String },
}

/// Maps upstream Anthropic events onto the uniform chunk vocabulary.
#[derive(Default)]
struct PassthroughMapper {
    open_blocks: HashMap<u32, OpenBlock>,
    stop_reason: Option<StopReason>,
    usage: Option<ChunkUsage>,
}

impl PassthroughMapper {
    fn on_event(&mut self, event: StreamEvent) -> Vec<BackendChunk> {
        match event {
            // The converter emits its own message_start; the upstream one
            // only matters for the usage it may carry.
            StreamEvent::MessageStart { message } => {
                self.usage = Some(ChunkUsage {
                    input_tokens: message.usage.input_tokens,
                    output_tokens: message.usage.output_tokens,
                });
                Vec::new()
            }
            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::Text { text } => {
                    self.open_blocks.insert(index, OpenBlock::Text);
                    let mut chunks = vec![BackendChunk::TextStart];
                    if !text.is_empty() {
                        chunks.push(BackendChunk::TextDelta(text));
                    }
                    chunks
                }
                ContentBlock::Thinking { thinking } => {
                    self.open_blocks.insert(index, OpenBlock::Thinking);
                    let mut chunks = vec![BackendChunk::ReasoningStart];
                    if !thinking.is_empty() {
                        chunks.push(BackendChunk::ReasoningDelta(thinking));
                    }
                    chunks
                }
                ContentBlock::ToolUse { id, name, input } => {
                    self.open_blocks.insert(index, OpenBlock::Tool { id: id.clone() });
                    let mut chunks = vec![BackendChunk::ToolInputStart {
                        id: id.clone(),
                        name,
                    }];
                    if input.as_object().is_some_and(|map| !map.is_empty()) {
                        chunks.push(BackendChunk::ToolInputDelta {
                            id,
                            partial_json: input.to_string(),
                        });
                    }
                    chunks
                }
                other => {
                    log::debug!("ignoring pass-through content block: {other:?}");
                    Vec::new()
                }
            },
            StreamEvent::ContentBlockDelta { index, delta } => match (self.open_blocks.get(&index), delta) {
                (_, ContentDelta::TextDelta { text }) => vec![BackendChunk::TextDelta(text)],
                (_, ContentDelta::ThinkingDelta { thinking }) => vec![BackendChunk::ReasoningDelta(thinking)],
                (Some(OpenBlock::Tool { id }), ContentDelta::InputJsonDelta { partial_json }) => {
                    vec![BackendChunk::ToolInputDelta {
                        id: id.clone(),
                        partial_json,
                    }]
                }
                (_, ContentDelta::InputJsonDelta { .. }) => {
                    log::warn!("input_json_delta for unknown block at index {index} dropped");
                    Vec::new()
                }
            },
            StreamEvent::ContentBlockStop { index } => match self.open_blocks.remove(&index) {
                Some(OpenBlock::Text) => vec![BackendChunk::TextEnd],
                Some(OpenBlock::Thinking) => vec![BackendChunk::ReasoningEnd],
                Some(OpenBlock::Tool { id }) => vec![BackendChunk::ToolInputEnd { id }],
                None => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason.or(self.stop_reason);
                self.usage = Some(ChunkUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
                Vec::new()
            }
            StreamEvent::MessageStop => vec![BackendChunk::Finish {
                reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                usage: self.usage,
            }],
            StreamEvent::Ping => Vec::new(),
            StreamEvent::Error { error } => vec![BackendChunk::Error {
                kind: BackendErrorKind::Protocol,
                message: format!("{}: {}", error.error_type, error.message),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> StreamEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_lifecycle_maps_to_uniform_chunks() {
        let mut mapper = PassthroughMapper::default();

        let mut chunks = mapper.on_event(event(json!({
            "type": "message_start",
            "message": {"id": "msg_1", "type": "message", "role": "assistant",
                        "content": [], "model": "claude-sonnet-4",
                        "usage": {"input_tokens": 3, "output_tokens": 0}}
        })));
        chunks.extend(mapper.on_event(event(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "text", "text": ""}
        }))));
        chunks.extend(mapper.on_event(event(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "Hi"}
        }))));
        chunks.extend(mapper.on_event(event(json!({"type": "content_block_stop", "index": 0}))));
        chunks.extend(mapper.on_event(event(json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn"},
            "usage": {"input_tokens": 3, "output_tokens": 1}
        }))));
        chunks.extend(mapper.on_event(event(json!({"type": "message_stop"}))));

        assert_eq!(
            chunks,
            vec![
                BackendChunk::TextStart,
                BackendChunk::TextDelta("Hi".to_string()),
                BackendChunk::TextEnd,
                BackendChunk::Finish {
                    reason: StopReason::EndTurn,
                    usage: Some(ChunkUsage {
                        input_tokens: 3,
                        output_tokens: 1
                    }),
                },
            ]
        );
    }

    #[test]
    fn tool_blocks_keep_their_ids() {
        let mut mapper = PassthroughMapper::default();

        let mut chunks = mapper.on_event(event(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {}}
        })));
        chunks.extend(mapper.on_event(event(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": "{\"a\":1}"}
        }))));
        chunks.extend(mapper.on_event(event(json!({"type": "content_block_stop", "index": 0}))));

        assert_eq!(
            chunks,
            vec![
                BackendChunk::ToolInputStart {
                    id: "toolu_1".to_string(),
                    name: "Read".to_string(),
                },
                BackendChunk::ToolInputDelta {
                    id: "toolu_1".to_string(),
                    partial_json: "{\"a\":1}".to_string(),
                },
                BackendChunk::ToolInputEnd {
                    id: "toolu_1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn thinking_blocks_pass_through_as_reasoning() {
        let mut mapper = PassthroughMapper::default();

        let mut chunks = mapper.on_event(event(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "thinking", "thinking": ""}
        })));
        chunks.extend(mapper.on_event(event(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "thinking_delta", "thinking": "step 1"}
        }))));
        chunks.extend(mapper.on_event(event(json!({"type": "content_block_stop", "index": 0}))));

        assert_eq!(
            chunks,
            vec![
                BackendChunk::ReasoningStart,
                BackendChunk::ReasoningDelta("step 1".to_string()),
                BackendChunk::ReasoningEnd,
            ]
        );
    }

    #[test]
    fn pings_are_skipped_and_errors_surface() {
        let mut mapper = PassthroughMapper::default();

        assert!(mapper.on_event(event(json!({"type": "ping"}))).is_empty());

        let chunks = mapper.on_event(event(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "try later"}
        })));
        assert!(matches!(
            &chunks[0],
            BackendChunk::Error { kind: BackendErrorKind::Protocol, message } if message.contains("overloaded_error")
        ));
    }
}
