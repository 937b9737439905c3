//! Bidirectional translation between the Anthropic message model and the
//! OpenAI chat-completion model.
//!
//! Both directions are pure functions. The Anthropic→OpenAI direction also
//! owns the system-prompt pipeline: block concatenation, optional
//! tool-instruction injection, then the truncation safety net. Injection
//! runs first so the token budget bounds the final prompt.

pub(crate) mod request;
pub(crate) mod response;

use thiserror::Error;

pub use request::chat_request;
pub use response::{ConvertIssue, ConvertedConversation, messages_from_openai};

use crate::schema::SchemaDialect;
use config::{BackendConfig, ToolInstructionStyle, TruncationStrategy};

/// Message translation failures. All of these are client errors: the request
/// cannot be expressed in the backend's dialect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    /// A content block variant has no OpenAI equivalent.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(&'static str),

    /// A tool_result references a tool_use id never seen in the conversation.
    #[error("tool_result references unknown tool_use_id '{0}'")]
    ToolResultOrphan(String),

    /// More than one system block arrived while strict mode is on.
    #[error("more than one system prompt block in strict mode")]
    SystemPromptTooMany,
}

/// Knobs for the Anthropic→OpenAI direction, derived from the backend
/// configuration plus per-backend dialect facts.
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// Schema dialect of the target model.
    pub dialect: SchemaDialect,
    /// Reject multi-block system prompts instead of concatenating.
    pub strict_system: bool,
    /// Apply the system-prompt safety net.
    pub truncate_system_prompt: bool,
    /// Token budget for the system prompt.
    pub system_prompt_max_tokens: usize,
    /// How to cut the prompt when over budget.
    pub truncation_strategy: TruncationStrategy,
    /// Append a tool-usage hint for weaker models.
    pub inject_tool_instructions: bool,
    /// Register of the hint.
    pub tool_instruction_style: ToolInstructionStyle,
    /// Inject only while the assistant's tool-use ratio stays below this.
    pub injection_threshold: f32,
    /// Stop nudging after this many turns into a conversation.
    pub max_injections_per_conversation: u32,
    /// Collapse newlines in the system prompt for backends that choke on them.
    pub collapse_system_newlines: bool,
}

impl TranslateOptions {
    /// Derive options from the backend configuration for a concrete model.
    pub fn from_backend(config: &BackendConfig, model: &str) -> Self {
        let dialect = SchemaDialect::for_model(model);

        Self {
            dialect,
            strict_system: false,
            truncate_system_prompt: config.truncate_system_prompt,
            system_prompt_max_tokens: config.system_prompt_max_tokens,
            truncation_strategy: config.truncation_strategy,
            inject_tool_instructions: config.inject_tool_instructions,
            tool_instruction_style: config.tool_instruction_style,
            injection_threshold: config.injection_threshold,
            max_injections_per_conversation: config.max_injections_per_conversation,
            collapse_system_newlines: dialect == SchemaDialect::Mistral,
        }
    }

    /// Plain options with every safety net off, for the given dialect.
    pub fn plain(dialect: SchemaDialect) -> Self {
        Self {
            dialect,
            strict_system: false,
            truncate_system_prompt: false,
            system_prompt_max_tokens: usize::MAX,
            truncation_strategy: TruncationStrategy::PrefixKeep,
            inject_tool_instructions: false,
            tool_instruction_style: ToolInstructionStyle::Explicit,
            injection_threshold: 0.5,
            max_injections_per_conversation: 3,
            collapse_system_newlines: false,
        }
    }
}

/// Rough token estimate used by the system-prompt safety net. Four characters
/// per token tracks the common BPE vocabularies closely enough for a bound.
pub(crate) fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
