//! The OpenAI-compatible backend client, used for local inference servers
//! and cloud gateways alike.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};

use super::{Backend, RequestContext};
use crate::chunk::{BackendChunk, BackendErrorKind, ChunkStream, ChunkUsage, stop_reason_from_openai};
use crate::convert::{self, TranslateOptions};
use crate::error::{ProxyError, ProxyResult};
use crate::http_client::http_client;
use crate::messages::{anthropic::MessagesRequest, openai};

pub(crate) struct OpenAiBackend {
    client: Client,
    base_url: String,
    name: String,
    api_key: Option<SecretString>,
    default_model: Option<String>,
    translation: config::BackendConfig,
    cache_prompt: bool,
}

impl OpenAiBackend {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, config: &config::BackendConfig, cache_prompt: bool) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: name.into(),
            api_key: config.api_key.clone(),
            default_model: config.model.clone(),
            translation: config.clone(),
            cache_prompt,
        }
    }

    fn resolve_model(&self, request: &MessagesRequest) -> ProxyResult<String> {
        request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| {
                ProxyError::MalformedRequest("request has no model and no default model is configured".to_string())
            })
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_stream(&self, request: &MessagesRequest, context: &RequestContext) -> ProxyResult<ChunkStream> {
        let model = self.resolve_model(request)?;
        let options = TranslateOptions::from_backend(&self.translation, &model);

        let mut chat = convert::chat_request(request, &model, &options)
            .map_err(|error| ProxyError::MalformedRequest(error.to_string()))?;

        // Pre-flight rewrites every OpenAI-compatible server wants from us.
        chat.stream = Some(true);
        chat.parallel_tool_calls = Some(false);
        chat.cache_prompt = self.cache_prompt.then_some(true);

        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut request_builder = self.client.post(&url).json(&chat);

        let key = context.api_key.as_ref().or(self.api_key.as_ref());
        if let Some(key) = key {
            request_builder = request_builder.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }

        let response = request_builder
            .send()
            .await
            .map_err(|error| ProxyError::BackendUnreachable(format!("failed to reach {}: {error}", self.name)))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<empty body>".to_string());
            log::error!("{} returned {status} opening a stream: {body}", self.name);
            return Err(ProxyError::from_upstream_status(status.as_u16(), body));
        }

        Ok(chunk_stream(response))
    }
}

/// Turn the upstream SSE body into a typed chunk stream.
fn chunk_stream(response: reqwest::Response) -> ChunkStream {
    struct State {
        events: std::pin::Pin<Box<dyn futures::Stream<Item = Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>> + Send>>,
        assembler: ChunkAssembler,
        queue: VecDeque<BackendChunk>,
        done: bool,
    }

    let events = response.bytes_stream().eventsource();

    let state = State {
        events: Box::pin(events),
        assembler: ChunkAssembler::default(),
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
                    state.queue.extend(state.assembler.finish());
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
                    // Malformed SSE framing is recoverable; skip the event.
                    log::warn!("SSE parsing error in backend stream: {error}");
                }
                Some(Ok(event)) => {
                    if event.data == "[DONE]" {
                        state.queue.extend(state.assembler.finish());
                        state.done = true;
                        continue;
                    }

                    match serde_json::from_str::<openai::ChatCompletionChunk>(&event.data) {
                        Ok(chunk) => state.queue.extend(state.assembler.on_chunk(chunk)),
                        Err(error) => {
                            // Unknown chunk shapes are dropped, not fatal.
                            log::warn!("dropping unparseable backend chunk: {error}");
                        }
                    }
                }
            }
        }
    }))
}

/// Folds incremental OpenAI deltas into the uniform chunk vocabulary,
/// synthesizing the start/end markers OpenAI never sends explicitly.
#[derive(Default)]
pub(crate) struct ChunkAssembler {
    text_open: bool,
    reasoning_open: bool,
    current_tool: Option<String>,
    tool_ids_by_index: HashMap<usize, String>,
    synthesized_ids: usize,
    pending_finish: Option<String>,
    usage: Option<ChunkUsage>,
    finished: bool,
}

impl ChunkAssembler {
    pub fn on_chunk(&mut self, chunk: openai::ChatCompletionChunk) -> Vec<BackendChunk> {
        let mut out = Vec::new();

        if self.finished {
            return out;
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(ChunkUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                self.close_text(&mut out);
                self.close_tool(&mut out);
                if !self.reasoning_open {
                    self.reasoning_open = true;
                    out.push(BackendChunk::ReasoningStart);
                }
                out.push(BackendChunk::ReasoningDelta(reasoning));
            }

            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                self.close_reasoning(&mut out);
                self.close_tool(&mut out);
                if !self.text_open {
                    self.text_open = true;
                    out.push(BackendChunk::TextStart);
                }
                out.push(BackendChunk::TextDelta(text));
            }

            for call in choice.delta.tool_calls.unwrap_or_default() {
                self.on_tool_fragment(call, &mut out);
            }

            if let Some(reason) = choice.finish_reason {
                // Hold the finish until the stream drains; a usage-only
                // chunk often follows the finish_reason.
                self.pending_finish = Some(reason);
            }
        }

        out
    }

    /// Flush at end of stream: close open blocks, emit the finish.
    pub fn finish(&mut self) -> Vec<BackendChunk> {
        let mut out = Vec::new();

        if self.finished {
            return out;
        }
        self.finished = true;

        self.close_reasoning(&mut out);
        self.close_text(&mut out);
        self.close_tool(&mut out);

        let reason = self
            .pending_finish
            .as_deref()
            .map(stop_reason_from_openai)
            .unwrap_or(crate::messages::anthropic::StopReason::EndTurn);

        out.push(BackendChunk::Finish {
            reason,
            usage: self.usage,
        });
        out
    }

    fn on_tool_fragment(&mut self, call: openai::StreamingToolCall, out: &mut Vec<BackendChunk>) {
        let index = call.index.unwrap_or(0);
        let (name, arguments) = match call.function {
            Some(function) => (function.name, function.arguments),
            None => (None, None),
        };

        let starts_new_call = call.id.is_some() || name.is_some();

        if starts_new_call {
            self.close_reasoning(out);
            self.close_text(out);
            self.close_tool(out);

            let id = call.id.unwrap_or_else(|| {
                // llama.cpp occasionally omits ids; synthesize a stable one
                // so result correlation still works.
                self.synthesized_ids += 1;
                format!("call_{index}_{}", self.synthesized_ids)
            });

            self.tool_ids_by_index.insert(index, id.clone());
            self.current_tool = Some(id.clone());

            out.push(BackendChunk::ToolInputStart {
                id,
                name: name.unwrap_or_default(),
            });
        }

        if let Some(arguments) = arguments
            && !arguments.is_empty()
        {
            let Some(id) = self.tool_ids_by_index.get(&index) else {
                // An argument fragment with no preceding id for its index:
                // nothing to correlate it with, so it is dropped.
                log::warn!("dropping tool argument fragment with no known call at index {index}");
                return;
            };

            out.push(BackendChunk::ToolInputDelta {
                id: id.clone(),
                partial_json: arguments,
            });
        }
    }

    fn close_text(&mut self, out: &mut Vec<BackendChunk>) {
        if self.text_open {
            self.text_open = false;
            out.push(BackendChunk::TextEnd);
        }
    }

    fn close_reasoning(&mut self, out: &mut Vec<BackendChunk>) {
        if self.reasoning_open {
            self.reasoning_open = false;
            out.push(BackendChunk::ReasoningEnd);
        }
    }

    fn close_tool(&mut self, out: &mut Vec<BackendChunk>) {
        if let Some(id) = self.current_tool.take() {
            out.push(BackendChunk::ToolInputEnd { id });
        }
    }
}
