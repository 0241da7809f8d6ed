//! Translate Anthropic Messages API requests into the two upstream formats:
//! Chat Completions bodies and Responses API bodies.
//!
//! Both translations are pure functions and never fail: content blocks we do
//! not recognize are forwarded as text blocks carrying their JSON form. A
//! single Anthropic message can expand into multiple Chat messages (each
//! `tool_result` block becomes its own `tool`-role message) or multiple
//! Responses input items.

use super::anthropic_types::{
    ContentBlock, Message, MessagesRequest, Role, ToolChoice, ToolResultContent,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatFunctionName, ChatMessage, ChatTool,
    ChatToolCall, ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ContentPart,
    ImageUrlDetail, StreamOptions,
};
use super::responses_types::{
    InputContentPart, InputItem, ResponsesRequest, ResponsesTool, ResponsesToolChoice,
    ResponsesToolChoiceFunction,
};

/// Build a Chat Completions request. `model` is the upstream model id the
/// dispatcher resolved (after any configured override).
pub fn to_chat_completions(req: &MessagesRequest, model: &str) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(ref system) = req.system {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: Some(ChatContent::Text(system.as_text())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in &req.messages {
        messages.extend(chat_messages_for(msg));
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    // Ask for usage on the final chunk so message_delta can report real
    // output token counts.
    let stream_options = req
        .stream
        .filter(|s| *s)
        .map(|_| StreamOptions { include_usage: true });

    ChatCompletionRequest {
        model: model.to_string(),
        messages,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        stream: req.stream,
        stream_options,
        tools,
        tool_choice: req.tool_choice.as_ref().map(chat_tool_choice),
        user: req.metadata.as_ref().and_then(|m| m.user_id.clone()),
    }
}

fn chat_messages_for(msg: &Message) -> Vec<ChatMessage> {
    let blocks = msg.content.blocks();
    match msg.role {
        Role::User => chat_user_messages(&blocks),
        Role::Assistant => chat_assistant_messages(&blocks),
    }
}

fn chat_user_messages(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut parts: Vec<ContentPart> = Vec::new();

    let flush = |parts: &mut Vec<ContentPart>, messages: &mut Vec<ChatMessage>| {
        if !parts.is_empty() {
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: Some(collapse_parts(parts)),
                tool_calls: None,
                tool_call_id: None,
            });
            parts.clear();
        }
    };

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                parts.push(ContentPart::Text { text: text.clone() });
            }
            ContentBlock::Image { source } => {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: format!("data:{};base64,{}", source.media_type, source.data),
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Each tool_result becomes its own tool-role message, ahead
                // of whatever user content follows it.
                flush(&mut parts, &mut messages);
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(tool_result_text(
                        content.as_ref(),
                        *is_error,
                    ))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            ContentBlock::Other(value) => {
                parts.push(ContentPart::Text {
                    text: value.to_string(),
                });
            }
            ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } => {}
        }
    }

    flush(&mut parts, &mut messages);

    if messages.is_empty() {
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(ChatContent::Text(String::new())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    messages
}

fn chat_assistant_messages(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut text = String::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    },
                });
            }
            ContentBlock::Other(value) => text.push_str(&value.to_string()),
            ContentBlock::Thinking { .. }
            | ContentBlock::Image { .. }
            | ContentBlock::ToolResult { .. } => {}
        }
    }

    vec![ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then_some(ChatContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    }]
}

fn collapse_parts(parts: &[ContentPart]) -> ChatContent {
    if let [ContentPart::Text { text }] = parts {
        return ChatContent::Text(text.clone());
    }
    ChatContent::Parts(parts.to_vec())
}

/// Flatten a tool_result payload to the single string the upstream expects:
/// text blocks joined, or the JSON serialization when non-text content is
/// present.
fn tool_result_text(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) { "ERROR: " } else { "" };

    let body = match content {
        None => String::new(),
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Blocks(blocks)) => {
            let all_text = blocks.iter().all(|b| matches!(b, ContentBlock::Text { .. }));
            if all_text {
                blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                serde_json::to_string(blocks).unwrap_or_default()
            }
        }
    };

    format!("{prefix}{body}")
}

fn chat_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto => ChatToolChoice::Mode("auto".to_string()),
        ToolChoice::Any => ChatToolChoice::Mode("required".to_string()),
        ToolChoice::None => ChatToolChoice::Mode("none".to_string()),
        ToolChoice::Tool { name } => ChatToolChoice::Function(ChatToolChoiceFunction {
            choice_type: "function".to_string(),
            function: ChatFunctionName { name: name.clone() },
        }),
    }
}

/// Build a Responses API request for the same Anthropic payload.
pub fn to_responses(req: &MessagesRequest, model: &str) -> ResponsesRequest {
    let mut input = Vec::new();
    for msg in &req.messages {
        input.extend(input_items_for(msg));
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ResponsesTool {
                tool_type: "function".to_string(),
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
                strict: false,
            })
            .collect()
    });

    ResponsesRequest {
        model: model.to_string(),
        input,
        instructions: req.system.as_ref().map(|s| s.as_text()),
        max_output_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        tools,
        tool_choice: req.tool_choice.as_ref().map(responses_tool_choice),
        stream: req.stream,
        store: false,
    }
}

fn input_items_for(msg: &Message) -> Vec<InputItem> {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let mut items = Vec::new();
    let mut parts: Vec<InputContentPart> = Vec::new();

    let flush = |parts: &mut Vec<InputContentPart>, items: &mut Vec<InputItem>| {
        if !parts.is_empty() {
            items.push(InputItem::Message {
                role: role.to_string(),
                content: std::mem::take(parts),
            });
        }
    };

    for block in msg.content.blocks() {
        match block {
            ContentBlock::Text { text } => parts.push(text_part(msg.role, text)),
            ContentBlock::Image { source } => {
                // Forwarded as-is; the upstream decides whether the model
                // accepts images.
                parts.push(InputContentPart::InputImage {
                    image_url: format!("data:{};base64,{}", source.media_type, source.data),
                });
            }
            ContentBlock::ToolUse { id, name, input } => {
                flush(&mut parts, &mut items);
                items.push(InputItem::FunctionCall {
                    id: Some(format!("fc_{id}")),
                    call_id: id,
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_default(),
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                flush(&mut parts, &mut items);
                items.push(InputItem::FunctionCallOutput {
                    call_id: tool_use_id,
                    output: tool_result_text(content.as_ref(), is_error),
                });
            }
            ContentBlock::Other(value) => parts.push(text_part(msg.role, value.to_string())),
            ContentBlock::Thinking { .. } => {}
        }
    }

    flush(&mut parts, &mut items);
    items
}

fn text_part(role: Role, text: String) -> InputContentPart {
    match role {
        Role::User => InputContentPart::InputText { text },
        Role::Assistant => InputContentPart::OutputText { text },
    }
}

fn responses_tool_choice(tc: &ToolChoice) -> ResponsesToolChoice {
    match tc {
        ToolChoice::Auto => ResponsesToolChoice::Mode("auto".to_string()),
        ToolChoice::Any => ResponsesToolChoice::Mode("required".to_string()),
        ToolChoice::None => ResponsesToolChoice::Mode("none".to_string()),
        ToolChoice::Tool { name } => {
            ResponsesToolChoice::Function(ResponsesToolChoiceFunction {
                choice_type: "function".to_string(),
                name: name.clone(),
            })
        }
    }
}
