//! OpenAI → Anthropic translation for atomic, non-streaming payloads.
//!
//! This inverts the request direction: assistant `tool_calls` become
//! `tool_use` blocks, `tool`-role messages fold back into user messages as
//! `tool_result` blocks. Malformed tool arguments degrade to `{}` and are
//! surfaced as issues instead of aborting the conversion.

use serde_json::Value;

use crate::messages::{anthropic, openai};

/// A converted conversation plus the issues recovered along the way.
#[derive(Debug)]
pub struct ConvertedConversation {
    /// System prompt reassembled from system-role messages.
    pub system: Option<String>,
    /// The conversation in Anthropic shape.
    pub messages: Vec<anthropic::Message>,
    /// Recovered (non-fatal) conversion problems.
    pub issues: Vec<ConvertIssue>,
}

/// Non-fatal problems encountered while converting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertIssue {
    /// A tool call's arguments were not valid JSON; `input` became `{}`.
    ToolArgsMalformed {
        /// The offending tool call id.
        id: String,
    },
}

/// Convert an OpenAI message list back into the Anthropic shape.
pub fn messages_from_openai(messages: Vec<openai::ChatMessage>) -> ConvertedConversation {
    let mut system_parts: Vec<String> = Vec::new();
    let mut converted: Vec<anthropic::Message> = Vec::new();
    let mut issues = Vec::new();

    for message in messages {
        match message.role {
            openai::ChatRole::System => {
                if let Some(text) = content_text(message.content) {
                    system_parts.push(text);
                }
            }
            openai::ChatRole::User => {
                let blocks = user_blocks(message.content);
                push_user_blocks(&mut converted, blocks);
            }
            openai::ChatRole::Assistant => {
                let mut blocks = Vec::new();

                if let Some(text) = content_text(message.content)
                    && !text.is_empty()
                {
                    blocks.push(anthropic::ContentBlock::Text { text });
                }

                for call in message.tool_calls.unwrap_or_default() {
                    let input = match serde_json::from_str::<Value>(&call.function.arguments) {
                        Ok(value) => value,
                        Err(_) => {
                            issues.push(ConvertIssue::ToolArgsMalformed { id: call.id.clone() });
                            Value::Object(Default::default())
                        }
                    };

                    blocks.push(anthropic::ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input,
                    });
                }

                converted.push(anthropic::Message {
                    role: anthropic::Role::Assistant,
                    content: anthropic::MessageContent::Blocks(blocks),
                });
            }
            openai::ChatRole::Tool => {
                let block = anthropic::ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.unwrap_or_default(),
                    content: anthropic::ToolResultContent::Text(content_text(message.content).unwrap_or_default()),
                    is_error: None,
                };
                push_user_blocks(&mut converted, vec![block]);
            }
        }
    }

    ConvertedConversation {
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        messages: converted,
        issues,
    }
}

/// Append blocks to the trailing user message, or start a new one. The
/// request direction splits one Anthropic user turn into tool-role messages
/// plus a user message; merging here restores the original turn structure.
fn push_user_blocks(converted: &mut Vec<anthropic::Message>, blocks: Vec<anthropic::ContentBlock>) {
    if let Some(last) = converted.last_mut()
        && last.role == anthropic::Role::User
        && let anthropic::MessageContent::Blocks(existing) = &mut last.content
    {
        existing.extend(blocks);
        return;
    }

    converted.push(anthropic::Message {
        role: anthropic::Role::User,
        content: anthropic::MessageContent::Blocks(blocks),
    });
}

fn content_text(content: Option<openai::ChatContent>) -> Option<String> {
    match content? {
        openai::ChatContent::Text(text) => Some(text),
        openai::ChatContent::Parts(parts) => {
            let texts: Vec<String> = parts
                .into_iter()
                .filter_map(|part| match part {
                    openai::ContentPart::Text { text } => Some(text),
                    openai::ContentPart::ImageUrl { .. } => None,
                })
                .collect();

            if texts.is_empty() { None } else { Some(texts.join("\n")) }
        }
    }
}

fn user_blocks(content: Option<openai::ChatContent>) -> Vec<anthropic::ContentBlock> {
    match content {
        None => Vec::new(),
        Some(openai::ChatContent::Text(text)) => vec![anthropic::ContentBlock::Text { text }],
        Some(openai::ChatContent::Parts(parts)) => parts
            .into_iter()
            .map(|part| match part {
                openai::ContentPart::Text { text } => anthropic::ContentBlock::Text { text },
                openai::ContentPart::ImageUrl { image_url } => anthropic::ContentBlock::Image {
                    source: media_source(image_url.url),
                },
            })
            .collect(),
    }
}

fn media_source(url: String) -> anthropic::MediaSource {
    // Data URIs unpack back into base64 sources; anything else stays a URL.
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((media_type, data)) = rest.split_once(";base64,")
    {
        return anthropic::MediaSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }

    anthropic::MediaSource::Url { url }
}
