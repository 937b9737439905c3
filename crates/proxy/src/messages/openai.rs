use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for an OpenAI-compatible `POST /v1/chat/completions`.
///
/// This is what crossbar sends upstream. A few fields are pre-flight rewrites
/// the local inference servers expect: `max_completion_tokens` instead of the
/// deprecated `max_tokens`, `parallel_tool_calls: false`, and the llama.cpp
/// `cache_prompt` hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation messages, system first.
    pub messages: Vec<ChatMessage>,

    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Whether to stream the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Tool choice mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Disabled for every backend; local servers interleave badly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,

    /// llama.cpp prompt-cache hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_prompt: Option<bool>,
}

/// One message in the OpenAI conversation shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender role.
    pub role: ChatRole,

    /// Message content, a bare string or typed parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,

    /// Tool calls made by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// For `tool` role messages: the id of the call this responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Build a plain-text message for a role.
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(ChatContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Role of an OpenAI chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions
    System,
    /// End-user input
    User,
    /// Model output
    Assistant,
    /// Tool execution result
    Tool,
}

/// Content of a chat message: a bare string or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    /// Bare string content.
    Text(String),
    /// Multi-modal parts.
    Parts(Vec<ContentPart>),
}

/// One typed part of a multi-modal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text part.
    Text {
        /// The text content
        text: String,
    },
    /// Image part, by URL or data URI.
    ImageUrl {
        /// The image reference
        image_url: ImageUrl,
    },
}

/// Image reference for an `image_url` part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Direct URL or `data:` URI
    pub url: String,
}

/// Tool definition in OpenAI format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Always "function"
    #[serde(rename = "type")]
    pub tool_type: ToolType,

    /// The function specification
    pub function: FunctionDefinition,
}

/// The only tool type OpenAI defines today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    /// A callable function
    Function,
}

/// Function specification inside a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Function name
    pub name: String,

    /// What the function does
    #[serde(default)]
    pub description: String,

    /// JSON Schema of the arguments
    pub parameters: Value,
}

/// An assistant tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call
    pub id: String,

    /// Always "function"
    #[serde(rename = "type")]
    pub tool_type: ToolType,

    /// The call details
    pub function: FunctionCall,
}

/// Function name and serialized arguments of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name
    pub name: String,

    /// Arguments as a JSON string
    pub arguments: String,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// One of "none", "auto", "required".
    Mode(ToolChoiceMode),
    /// Force a specific function.
    Specific {
        /// Always "function"
        #[serde(rename = "type")]
        tool_type: ToolType,
        /// The function to force
        function: ToolChoiceFunction,
    },
}

/// Mode-based tool choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    /// Tools disabled
    None,
    /// Model decides
    Auto,
    /// Model must call a tool
    Required,
}

/// Named function for a specific tool choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    /// The function name
    pub name: String,
}

/// One SSE chunk of a streaming chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion id, constant across the stream.
    #[serde(default)]
    pub id: String,

    /// Model producing the stream.
    #[serde(default)]
    pub model: String,

    /// Incremental choice updates. Usage-only chunks carry an empty array.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,

    /// Usage, present on the final chunk when the server reports it.
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
}

/// One choice inside a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    /// Choice index, 0 for single-choice streams.
    #[serde(default)]
    pub index: u32,

    /// The incremental delta.
    #[serde(default)]
    pub delta: ChunkDelta,

    /// Set on the final chunk for this choice.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental message content in a chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    /// Text to append.
    #[serde(default)]
    pub content: Option<String>,

    /// Chain-of-thought text some servers stream separately.
    #[serde(default, alias = "reasoning")]
    pub reasoning_content: Option<String>,

    /// Tool call updates.
    #[serde(default)]
    pub tool_calls: Option<Vec<StreamingToolCall>>,
}

/// Incremental tool call inside a chunk delta. The first fragment for a call
/// carries `id` and `function.name`; later fragments carry only argument text
/// and are correlated by `index` (or by `id` when the server repeats it).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingToolCall {
    /// Position of this call in the assistant's tool_calls array.
    #[serde(default)]
    pub index: Option<usize>,

    /// Call id, present on the first fragment.
    #[serde(default)]
    pub id: Option<String>,

    /// Function name and argument fragment.
    #[serde(default)]
    pub function: Option<StreamingFunction>,
}

/// Function fragment of a streaming tool call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamingFunction {
    /// Present on the first fragment.
    #[serde(default)]
    pub name: Option<String>,

    /// Argument text to append.
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Usage block of a streaming chunk.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_tokens: u32,

    /// Completion tokens.
    #[serde(default)]
    pub completion_tokens: u32,
}
