use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the Anthropic Messages API.
///
/// This is the shape clients send to `POST /v1/messages`, as documented in the
/// [Anthropic API Reference](https://docs.anthropic.com/en/api/messages).
/// Unknown fields are tolerated and dropped so newer clients keep working.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    /// The model to use. When omitted, the configured default model applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// The conversation, alternating between "user" and "assistant" roles.
    pub messages: Vec<Message>,

    /// Maximum number of tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// System prompt, either a bare string or a sequence of text blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Controls randomness in the response, 0.0 to 1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Sequences that cause the model to stop generating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to stream the response as Server-Sent Events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Tools available for the model to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Controls how the model uses tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Custom metadata to attach to the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MessagesRequest {
    /// Whether the client asked for a streaming response.
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// System prompt: a single string or an ordered sequence of text blocks, each
/// optionally carrying a cache-control hint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Bare string form.
    Text(String),
    /// Block sequence form.
    Blocks(Vec<SystemBlock>),
}

/// One block of a structured system prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    /// Always "text".
    #[serde(rename = "type")]
    pub block_type: String,

    /// The text content.
    pub text: String,

    /// Prompt-cache hint. Discarded during translation; the backend receives
    /// its cache signal through a request-level flag instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

/// An Anthropic message with role and content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    /// The role of the message sender.
    pub role: Role,

    /// The content, a bare string or an array of content blocks.
    pub content: MessageContent,
}

/// Message content: Anthropic accepts both a bare string and a block array.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Bare string, equivalent to one text block.
    Text(String),
    /// Ordered content blocks.
    Blocks(Vec<ContentBlock>),
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message
    User,
    /// Assistant message
    Assistant,
}

/// Content block in an Anthropic message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text content.
    Text {
        /// The text content
        text: String,
    },

    /// Image content, base64 or URL sourced.
    Image {
        /// The image source
        source: MediaSource,
    },

    /// Document content (PDF bytes or URL).
    Document {
        /// The document source
        source: MediaSource,
    },

    /// Chain-of-thought content. Passed through verbatim, never interpreted.
    Thinking {
        /// The reasoning text
        thinking: String,
    },

    /// Tool use request from the assistant.
    ToolUse {
        /// Unique identifier for this tool use
        id: String,
        /// Name of the tool to use
        name: String,
        /// Input parameters for the tool
        input: Value,
    },

    /// Result from a tool execution.
    ToolResult {
        /// The tool use ID this result corresponds to
        tool_use_id: String,
        /// The result content
        content: ToolResultContent,
        /// Whether the tool execution failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Content of a tool result: a bare string or text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Bare string result.
    Text(String),
    /// Block sequence result.
    Blocks(Vec<ToolResultBlock>),
}

impl ToolResultContent {
    /// Flatten the result to one string, joining blocks with newlines.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|block| block.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One text block inside a tool result.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolResultBlock {
    /// Always "text".
    #[serde(rename = "type")]
    pub block_type: String,

    /// The text content.
    pub text: String,
}

/// Source of an image or document block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaSource {
    /// Inline base64 data.
    Base64 {
        /// MIME type, e.g. "image/png" or "application/pdf"
        media_type: String,
        /// Base64-encoded bytes without a data-URL prefix
        data: String,
    },
    /// External URL the backend fetches itself.
    Url {
        /// The URL
        url: String,
    },
}

/// Metadata attached to the request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    /// Optional user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Tool definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    /// The name of the tool
    pub name: String,

    /// Description of what the tool does
    #[serde(default)]
    pub description: String,

    /// JSON Schema for the tool's input parameters
    pub input_schema: Value,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Let the model decide whether to use tools
    Auto,

    /// Force the model to use any available tool
    Any,

    /// Force the model to use a specific tool
    Tool {
        /// The name of the tool to use
        name: String,
    },
}

/// Non-streaming response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Unique identifier for this completion
    pub id: String,

    /// Always "message"
    #[serde(rename = "type")]
    pub response_type: String,

    /// Always "assistant"
    pub role: Role,

    /// The content of the response
    pub content: Vec<ContentBlock>,

    /// The model that generated the response
    pub model: String,

    /// Why generation stopped
    pub stop_reason: Option<StopReason>,

    /// Stop sequence that was matched, if any
    pub stop_sequence: Option<String>,

    /// Token usage statistics
    pub usage: Usage,
}

/// The reason why the model stopped generating tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model reached a natural stopping point.
    EndTurn,
    /// The generation exceeded the maximum token limit.
    MaxTokens,
    /// The model encountered a configured stop sequence.
    StopSequence,
    /// The model invoked a tool.
    ToolUse,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
            StopReason::ToolUse => write!(f, "tool_use"),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Number of input tokens
    pub input_tokens: u32,

    /// Number of output tokens
    pub output_tokens: u32,
}

/// Error details in Anthropic wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// The kind of error that occurred
    #[serde(rename = "type")]
    pub error_type: String,

    /// Human-readable error message
    pub message: String,
}

/// Error response envelope: `{"type": "error", "error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always "error"
    #[serde(rename = "type")]
    pub response_type: String,

    /// Error details
    pub error: ErrorDetails,
}

impl ErrorResponse {
    /// Build an error envelope from a kind and message.
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

/// Streaming event types for Anthropic SSE responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Start of a message
    MessageStart {
        /// The initial message metadata
        message: StreamMessageStart,
    },

    /// Content block start
    ContentBlockStart {
        /// The index of the content block
        index: u32,
        /// The content block being started
        content_block: ContentBlock,
    },

    /// Incremental content update
    ContentBlockDelta {
        /// The index of the content block
        index: u32,
        /// The delta update
        delta: ContentDelta,
    },

    /// Content block finished
    ContentBlockStop {
        /// The index of the content block
        index: u32,
    },

    /// Top-level message update carrying stop reason and usage
    MessageDelta {
        /// Delta update for the message
        delta: MessageDeltaPayload,
        /// Updated usage statistics
        usage: Usage,
    },

    /// End of message stream
    MessageStop,

    /// Ping event to keep the connection alive
    Ping,

    /// Error event
    Error {
        /// The error that occurred
        error: ErrorDetails,
    },
}

impl StreamEvent {
    /// The SSE `event:` name for this event.
    pub fn event_name(&self) -> &'static str {
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

/// Initial message metadata for streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageStart {
    /// Unique message ID
    pub id: String,

    /// Always "message"
    #[serde(rename = "type")]
    pub message_type: String,

    /// Always "assistant"
    pub role: Role,

    /// Initially empty content array
    pub content: Vec<ContentBlock>,

    /// The model being used
    pub model: String,

    /// Initial usage statistics
    pub usage: Usage,
}

/// Delta update for content blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Text delta
    TextDelta {
        /// Additional text content
        text: String,
    },

    /// Tool use input delta
    InputJsonDelta {
        /// Partial JSON string for tool input
        partial_json: String,
    },

    /// Reasoning delta
    ThinkingDelta {
        /// Additional reasoning content
        thinking: String,
    },
}

/// Message-level delta for streaming responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaPayload {
    /// Stop reason once the message is complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    /// Stop sequence if one was matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}
