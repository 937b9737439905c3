//! Anthropic → OpenAI request translation.

use std::collections::HashSet;

use super::{ConvertError, TranslateOptions, approx_tokens};
use crate::messages::{anthropic, openai};
use crate::schema;
use config::{ToolInstructionStyle, TruncationStrategy};

/// Translate an Anthropic Messages request into an OpenAI chat-completion
/// request for `model`. Tools whose schemas cannot be adapted are omitted
/// with a warning; everything else is a hard error.
pub fn chat_request(
    request: &anthropic::MessagesRequest,
    model: &str,
    options: &TranslateOptions,
) -> Result<openai::ChatCompletionRequest, ConvertError> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = system_prompt(request, options)? {
        messages.push(openai::ChatMessage::text(openai::ChatRole::System, system));
    }

    let mut seen_tool_ids = HashSet::new();

    for message in &request.messages {
        match message.role {
            anthropic::Role::User => convert_user_message(message, &seen_tool_ids, &mut messages)?,
            anthropic::Role::Assistant => convert_assistant_message(message, &mut seen_tool_ids, &mut messages)?,
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .filter_map(|tool| match schema::adapt_tool(options.dialect, tool) {
                Ok(adapted) => Some(adapted),
                Err(error) => {
                    log::warn!("omitting tool '{}' from request: {error}", tool.name);
                    None
                }
            })
            .collect::<Vec<_>>()
    });

    Ok(openai::ChatCompletionRequest {
        model: model.to_string(),
        messages,
        max_completion_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        stream: None,
        tools: tools.filter(|t| !t.is_empty()),
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
        parallel_tool_calls: None,
        cache_prompt: None,
    })
}

/// Assemble the single outgoing system message: concatenate blocks, inject
/// the tool hint if asked, then apply the truncation safety net.
fn system_prompt(
    request: &anthropic::MessagesRequest,
    options: &TranslateOptions,
) -> Result<Option<String>, ConvertError> {
    let mut prompt = match &request.system {
        None => None,
        Some(anthropic::SystemPrompt::Text(text)) => Some(text.clone()),
        Some(anthropic::SystemPrompt::Blocks(blocks)) => {
            if options.strict_system && blocks.len() > 1 {
                return Err(ConvertError::SystemPromptTooMany);
            }

            // Cache-control hints are discarded here; the prompt-cache signal
            // travels as a request-level flag instead.
            Some(
                blocks
                    .iter()
                    .map(|block| block.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }
    };

    if options.inject_tool_instructions
        && let Some(instruction) = tool_instruction(request, options)
    {
        let mut text = prompt.unwrap_or_default();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&instruction);
        prompt = Some(text);
    }

    if options.truncate_system_prompt
        && let Some(text) = prompt.as_ref()
        && approx_tokens(text) > options.system_prompt_max_tokens
    {
        prompt = Some(truncate(text, options.system_prompt_max_tokens, options.truncation_strategy));
    }

    if options.collapse_system_newlines {
        prompt = prompt.map(|text| {
            text.split('\n')
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join(" ")
        });
    }

    Ok(prompt.filter(|text| !text.is_empty()))
}

/// The nudge appended for models that under-use their tools. Returns None
/// when the conversation does not qualify.
fn tool_instruction(request: &anthropic::MessagesRequest, options: &TranslateOptions) -> Option<String> {
    let tools = request.tools.as_deref().filter(|tools| !tools.is_empty())?;

    let assistant_turns = request
        .messages
        .iter()
        .filter(|message| message.role == anthropic::Role::Assistant)
        .count();

    // Late in a conversation the model has settled into a pattern; stop
    // repeating the hint once the turn budget is spent.
    if assistant_turns as u32 >= options.max_injections_per_conversation {
        return None;
    }

    let turns_with_tools = request
        .messages
        .iter()
        .filter(|message| {
            message.role == anthropic::Role::Assistant
                && matches!(
                    &message.content,
                    anthropic::MessageContent::Blocks(blocks)
                        if blocks.iter().any(|b| matches!(b, anthropic::ContentBlock::ToolUse { .. }))
                )
        })
        .count();

    let ratio = if assistant_turns == 0 {
        0.0
    } else {
        turns_with_tools as f32 / assistant_turns as f32
    };

    if ratio >= options.injection_threshold {
        return None;
    }

    match options.tool_instruction_style {
        ToolInstructionStyle::Explicit => {
            let names = tools.iter().map(|tool| tool.name.as_str()).collect::<Vec<_>>().join(", ");
            Some(format!(
                "You have access to the following tools: {names}. \
                When a task maps onto one of them, call the tool instead of describing what you would do."
            ))
        }
        ToolInstructionStyle::Subtle => {
            Some("Prefer calling an available tool over describing the steps in prose.".to_string())
        }
    }
}

fn truncate(text: &str, max_tokens: usize, strategy: TruncationStrategy) -> String {
    let budget_chars = max_tokens.saturating_mul(4);
    let total = text.chars().count();

    if total <= budget_chars {
        return text.to_string();
    }

    match strategy {
        TruncationStrategy::PrefixKeep => text.chars().take(budget_chars).collect(),
        TruncationStrategy::TailKeep => text.chars().skip(total - budget_chars).collect(),
        TruncationStrategy::Summary => {
            let half = budget_chars / 2;
            let head: String = text.chars().take(half).collect();
            let tail: String = text.chars().skip(total - half).collect();
            format!("{head}\n[... system prompt truncated ...]\n{tail}")
        }
    }
}

/// A user message splits into tool-role messages (one per tool_result, in
/// block order) followed by at most one user message with the remaining
/// parts. Each content block maps to at most one output part.
fn convert_user_message(
    message: &anthropic::Message,
    seen_tool_ids: &HashSet<String>,
    output: &mut Vec<openai::ChatMessage>,
) -> Result<(), ConvertError> {
    let blocks = match &message.content {
        anthropic::MessageContent::Text(text) => {
            output.push(openai::ChatMessage::text(openai::ChatRole::User, text.clone()));
            return Ok(());
        }
        anthropic::MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();

    for block in blocks {
        match block {
            anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if !seen_tool_ids.contains(tool_use_id) {
                    return Err(ConvertError::ToolResultOrphan(tool_use_id.clone()));
                }

                let mut text = content.to_text();
                if is_error.unwrap_or(false) {
                    text = format!("Error: {text}");
                }

                output.push(openai::ChatMessage {
                    role: openai::ChatRole::Tool,
                    content: Some(openai::ChatContent::Text(text)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            anthropic::ContentBlock::Text { text } => {
                parts.push(openai::ContentPart::Text { text: text.clone() });
            }
            anthropic::ContentBlock::Image { source } => {
                parts.push(openai::ContentPart::ImageUrl {
                    image_url: openai::ImageUrl {
                        url: image_url(source),
                    },
                });
            }
            anthropic::ContentBlock::Document { .. } => {
                return Err(ConvertError::UnsupportedContentType("document"));
            }
            anthropic::ContentBlock::Thinking { .. } => {
                return Err(ConvertError::UnsupportedContentType("thinking"));
            }
            anthropic::ContentBlock::ToolUse { .. } => {
                return Err(ConvertError::UnsupportedContentType("tool_use in user message"));
            }
        }
    }

    if !parts.is_empty() {
        // A lone text part collapses to the string form most servers prefer.
        let content = match parts.as_slice() {
            [openai::ContentPart::Text { text }] => openai::ChatContent::Text(text.clone()),
            _ => openai::ChatContent::Parts(parts),
        };

        output.push(openai::ChatMessage {
            role: openai::ChatRole::User,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    Ok(())
}

fn convert_assistant_message(
    message: &anthropic::Message,
    seen_tool_ids: &mut HashSet<String>,
    output: &mut Vec<openai::ChatMessage>,
) -> Result<(), ConvertError> {
    let blocks = match &message.content {
        anthropic::MessageContent::Text(text) => {
            output.push(openai::ChatMessage::text(openai::ChatRole::Assistant, text.clone()));
            return Ok(());
        }
        anthropic::MessageContent::Blocks(blocks) => blocks,
    };

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            anthropic::ContentBlock::Text { text } => texts.push(text.as_str()),
            // Reasoning from an earlier streamed turn; the backend never sees
            // its own scratchpad again.
            anthropic::ContentBlock::Thinking { .. } => {}
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                seen_tool_ids.insert(id.clone());
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    tool_type: openai::ToolType::Function,
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            anthropic::ContentBlock::Image { .. } => {
                return Err(ConvertError::UnsupportedContentType("image in assistant message"));
            }
            anthropic::ContentBlock::Document { .. } => {
                return Err(ConvertError::UnsupportedContentType("document"));
            }
            anthropic::ContentBlock::ToolResult { .. } => {
                return Err(ConvertError::UnsupportedContentType("tool_result in assistant message"));
            }
        }
    }

    output.push(openai::ChatMessage {
        role: openai::ChatRole::Assistant,
        content: if texts.is_empty() {
            None
        } else {
            Some(openai::ChatContent::Text(texts.join("\n")))
        },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id: None,
    });

    Ok(())
}

fn image_url(source: &anthropic::MediaSource) -> String {
    match source {
        anthropic::MediaSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
        anthropic::MediaSource::Url { url } => url.clone(),
    }
}

fn convert_tool_choice(choice: &anthropic::ToolChoice) -> openai::ToolChoice {
    match choice {
        anthropic::ToolChoice::Auto => openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto),
        anthropic::ToolChoice::Any => openai::ToolChoice::Mode(openai::ToolChoiceMode::Required),
        anthropic::ToolChoice::Tool { name } => openai::ToolChoice::Specific {
            tool_type: openai::ToolType::Function,
            function: openai::ToolChoiceFunction { name: name.clone() },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDialect;
    use serde_json::{Value, json};

    fn request_from(value: Value) -> anthropic::MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn plain() -> TranslateOptions {
        TranslateOptions::plain(SchemaDialect::Passthrough)
    }

    #[test]
    fn system_blocks_concatenate_with_newlines() {
        let request = request_from(json!({
            "system": [
                {"type": "text", "text": "Part one.", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "Part two."}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = chat_request(&request, "gpt-4o", &plain()).unwrap();

        assert_eq!(chat.messages[0].role, openai::ChatRole::System);
        let Some(openai::ChatContent::Text(text)) = &chat.messages[0].content else {
            unreachable!("expected text system message");
        };
        assert_eq!(text, "Part one.\nPart two.");
    }

    #[test]
    fn strict_mode_rejects_multiple_system_blocks() {
        let request = request_from(json!({
            "system": [
                {"type": "text", "text": "a"},
                {"type": "text", "text": "b"}
            ],
            "messages": []
        }));

        let mut options = plain();
        options.strict_system = true;

        assert_eq!(
            chat_request(&request, "gpt-4o", &options).unwrap_err(),
            ConvertError::SystemPromptTooMany
        );
    }

    #[test]
    fn emits_at_most_one_system_message() {
        let request = request_from(json!({
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = chat_request(&request, "gpt-4o", &plain()).unwrap();

        let system_count = chat
            .messages
            .iter()
            .filter(|m| m.role == openai::ChatRole::System)
            .count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn tool_use_and_result_round_through_roles() {
        let request = request_from(json!({
            "messages": [
                {"role": "user", "content": "read /a"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Reading."},
                    {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/a"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "contents"}
                ]}
            ]
        }));

        let chat = chat_request(&request, "gpt-4o", &plain()).unwrap();

        assert_eq!(chat.messages.len(), 3);

        let assistant = &chat.messages[1];
        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].function.name, "Read");
        assert_eq!(
            serde_json::from_str::<Value>(&calls[0].function.arguments).unwrap(),
            json!({"file_path": "/a"})
        );

        let tool = &chat.messages[2];
        assert_eq!(tool.role, openai::ChatRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn orphan_tool_result_is_rejected() {
        let request = request_from(json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_missing", "content": "x"}
                ]}
            ]
        }));

        assert_eq!(
            chat_request(&request, "gpt-4o", &plain()).unwrap_err(),
            ConvertError::ToolResultOrphan("toolu_missing".to_string())
        );
    }

    #[test]
    fn error_tool_results_are_prefixed() {
        let request = request_from(json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "no such file", "is_error": true}
                ]}
            ]
        }));

        let chat = chat_request(&request, "gpt-4o", &plain()).unwrap();
        let Some(openai::ChatContent::Text(text)) = &chat.messages[1].content else {
            unreachable!("expected tool text");
        };
        assert_eq!(text, "Error: no such file");
    }

    #[test]
    fn base64_images_become_data_uris() {
        let request = request_from(json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
                ]}
            ]
        }));

        let chat = chat_request(&request, "gpt-4o", &plain()).unwrap();
        let Some(openai::ChatContent::Parts(parts)) = &chat.messages[0].content else {
            unreachable!("expected parts");
        };
        let openai::ContentPart::ImageUrl { image_url } = &parts[1] else {
            unreachable!("expected image part");
        };
        assert_eq!(image_url.url, "data:image/png;base64,AAAA");
    }

    #[test]
    fn document_blocks_are_unsupported() {
        let request = request_from(json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "document", "source": {"type": "url", "url": "https://a/b.pdf"}}
                ]}
            ]
        }));

        assert_eq!(
            chat_request(&request, "gpt-4o", &plain()).unwrap_err(),
            ConvertError::UnsupportedContentType("document")
        );
    }

    #[test]
    fn injection_fires_on_fresh_conversations_only() {
        let base = json!({
            "system": "base prompt",
            "tools": [{"name": "Read", "description": "read", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "hi"}]
        });

        let mut options = plain();
        options.inject_tool_instructions = true;

        let chat = chat_request(&request_from(base), "gpt-4o", &options).unwrap();
        let Some(openai::ChatContent::Text(system)) = &chat.messages[0].content else {
            unreachable!("expected system text");
        };
        assert!(system.starts_with("base prompt\n"));
        assert!(system.contains("Read"));

        // A conversation already using tools above the threshold gets no hint.
        let active = json!({
            "system": "base prompt",
            "tools": [{"name": "Read", "description": "read", "input_schema": {"type": "object"}}],
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "Read", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
                ]}
            ]
        });

        let chat = chat_request(&request_from(active), "gpt-4o", &options).unwrap();
        let Some(openai::ChatContent::Text(system)) = &chat.messages[0].content else {
            unreachable!("expected system text");
        };
        assert_eq!(system, "base prompt");
    }

    #[test]
    fn injection_happens_before_truncation() {
        let mut options = plain();
        options.inject_tool_instructions = true;
        options.truncate_system_prompt = true;
        options.system_prompt_max_tokens = 8;
        options.truncation_strategy = TruncationStrategy::PrefixKeep;

        let request = request_from(json!({
            "system": "a long base prompt that overflows the tiny budget easily",
            "tools": [{"name": "Read", "description": "read", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = chat_request(&request, "gpt-4o", &options).unwrap();
        let Some(openai::ChatContent::Text(system)) = &chat.messages[0].content else {
            unreachable!("expected system text");
        };

        // The budget bounds the final prompt, injected hint included.
        assert!(approx_tokens(system) <= 8);
    }

    #[test]
    fn truncation_strategies() {
        let text: String = ('a'..='z').cycle().take(100).collect();

        let prefix = truncate(&text, 5, TruncationStrategy::PrefixKeep);
        assert_eq!(prefix.chars().count(), 20);
        assert!(text.starts_with(&prefix));

        let tail = truncate(&text, 5, TruncationStrategy::TailKeep);
        assert_eq!(tail.chars().count(), 20);
        assert!(text.ends_with(&tail));

        let summary = truncate(&text, 5, TruncationStrategy::Summary);
        assert!(summary.contains("[... system prompt truncated ...]"));
    }

    #[test]
    fn newline_collapse_for_fragile_backends() {
        let request = request_from(json!({
            "system": "line one\nline two",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = chat_request(&request, "mistral-small", &TranslateOptions::from_backend(&Default::default(), "mistral-small")).unwrap();

        let Some(openai::ChatContent::Text(system)) = &chat.messages[0].content else {
            unreachable!("expected system text");
        };
        assert_eq!(system, "line one line two");
    }

    #[test]
    fn too_deep_tool_is_omitted_not_fatal() {
        let mut schema = json!({"type": "string"});
        for _ in 0..12 {
            schema = json!({"type": "object", "properties": {"p": schema}});
        }

        let request = request_from(json!({
            "tools": [
                {"name": "deep", "description": "d", "input_schema": schema},
                {"name": "shallow", "description": "s", "input_schema": {"type": "object"}}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let chat = chat_request(&request, "gpt-4o", &plain()).unwrap();
        let tools = chat.tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "shallow");
    }
}
