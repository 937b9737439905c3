//! Backend selection and request translation settings.

use secrecy::SecretString;
use serde::Deserialize;

/// Which upstream the proxy translates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Anthropic's own endpoint, passed through without translation.
    Claude,
    /// A local OpenAI-compatible inference server (llama.cpp, vLLM, ...).
    Local,
    /// An OpenAI-compatible cloud gateway.
    Openrouter,
    /// A cluster of local inference nodes behind the cluster router.
    MlxCluster,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Local
    }
}

impl BackendKind {
    /// Whether requests for this backend go through the cluster router.
    pub fn is_cluster(self) -> bool {
        matches!(self, Self::MlxCluster)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Local => write!(f, "local"),
            Self::Openrouter => write!(f, "openrouter"),
            Self::MlxCluster => write!(f, "mlx-cluster"),
        }
    }
}

/// How the system prompt is cut down when it exceeds the configured budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TruncationStrategy {
    /// Keep the start of the prompt, drop the tail.
    PrefixKeep,
    /// Keep the end of the prompt, drop the head.
    TailKeep,
    /// Keep head and tail around an elision marker.
    Summary,
}

impl Default for TruncationStrategy {
    fn default() -> Self {
        Self::PrefixKeep
    }
}

/// Register of the tool-usage hint appended for weaker models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolInstructionStyle {
    /// A direct instruction naming the available tools.
    Explicit,
    /// A brief reminder without enumerating tools.
    Subtle,
}

impl Default for ToolInstructionStyle {
    fn default() -> Self {
        Self::Explicit
    }
}

/// Backend selection and translation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Which backend to translate for.
    pub kind: BackendKind,

    /// Override of the backend base URL. Defaults depend on the kind.
    pub url: Option<String>,

    /// API key forwarded to the backend.
    pub api_key: Option<SecretString>,

    /// Default model name when the request omits one.
    pub model: Option<String>,

    /// Apply the system-prompt safety net.
    pub truncate_system_prompt: bool,

    /// Token budget for the system prompt when the safety net is on.
    pub system_prompt_max_tokens: usize,

    /// How the prompt is truncated when over budget.
    pub truncation_strategy: TruncationStrategy,

    /// Append a tool-usage hint to the system prompt when tools are present.
    pub inject_tool_instructions: bool,

    /// Register of the injected hint.
    pub tool_instruction_style: ToolInstructionStyle,

    /// Inject only when the fraction of assistant turns that used tools is
    /// below this threshold.
    pub injection_threshold: f32,

    /// Upper bound on injections for one conversation.
    pub max_injections_per_conversation: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            url: None,
            api_key: None,
            model: None,
            truncate_system_prompt: false,
            system_prompt_max_tokens: 8192,
            truncation_strategy: TruncationStrategy::default(),
            inject_tool_instructions: false,
            tool_instruction_style: ToolInstructionStyle::default(),
            injection_threshold: 0.5,
            max_injections_per_conversation: 3,
        }
    }
}
