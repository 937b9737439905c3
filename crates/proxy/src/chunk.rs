//! The uniform chunk stream every backend client yields.
//!
//! Backends differ in how a tool invocation arrives: as an incremental
//! sequence (`ToolInputStart` → `ToolInputDelta`* → `ToolInputEnd`), as one
//! atomic `ToolCall`, or as the streamed form followed redundantly by the
//! atomic one. The stream converter deduplicates; the chunk model just
//! carries whichever shape the backend produced.

use std::pin::Pin;

use futures::Stream;
use serde_json::Value;

use crate::messages::anthropic::StopReason;

/// A lazy sequence of chunks from one backend response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = BackendChunk> + Send>>;

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkUsage {
    /// Prompt-side tokens.
    pub input_tokens: u32,
    /// Completion-side tokens.
    pub output_tokens: u32,
}

/// Failure classes a backend stream can carry inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The upstream connection dropped or refused.
    Unreachable,
    /// A deadline elapsed while reading.
    Timeout,
    /// The upstream sent bytes we could not interpret.
    Protocol,
    /// The request was canceled on our side.
    Canceled,
}

impl BackendErrorKind {
    /// Anthropic wire name for an SSE `error` event.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Unreachable => "overloaded_error",
            Self::Timeout | Self::Protocol | Self::Canceled => "api_error",
        }
    }
}

/// One typed chunk from a backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendChunk {
    /// A text block opens.
    TextStart,
    /// Text to append to the open text block.
    TextDelta(String),
    /// The open text block closes.
    TextEnd,

    /// A reasoning block opens.
    ReasoningStart,
    /// Reasoning text to append.
    ReasoningDelta(String),
    /// The open reasoning block closes.
    ReasoningEnd,

    /// A streamed tool invocation opens.
    ToolInputStart {
        /// Tool call id, unique within the response.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A fragment of the tool's argument JSON.
    ToolInputDelta {
        /// Tool call id.
        id: String,
        /// Argument text to append.
        partial_json: String,
    },
    /// The streamed tool invocation closes.
    ToolInputEnd {
        /// Tool call id.
        id: String,
    },

    /// A complete tool invocation in one chunk.
    ToolCall {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Full argument object.
        input: Value,
    },

    /// The response is complete.
    Finish {
        /// Why generation stopped.
        reason: StopReason,
        /// Usage if the backend reported it.
        usage: Option<ChunkUsage>,
    },

    /// The stream failed; no further chunks follow.
    Error {
        /// Failure class.
        kind: BackendErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

/// Map an OpenAI `finish_reason` string onto a stop reason.
pub fn stop_reason_from_openai(finish_reason: &str) -> StopReason {
    match finish_reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        // "stop", "content_filter" and anything novel end the turn.
        _ => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(stop_reason_from_openai("stop"), StopReason::EndTurn);
        assert_eq!(stop_reason_from_openai("length"), StopReason::MaxTokens);
        assert_eq!(stop_reason_from_openai("tool_calls"), StopReason::ToolUse);
        assert_eq!(stop_reason_from_openai("function_call"), StopReason::ToolUse);
        assert_eq!(stop_reason_from_openai("content_filter"), StopReason::EndTurn);
    }
}
