//! Translate upstream JSON responses back into Anthropic Messages responses,
//! and map upstream error statuses onto the Anthropic error taxonomy.

use super::anthropic_types::{ErrorResponse, MessagesResponse, ResponseContentBlock, Usage};
use super::openai_types::ChatCompletionResponse;
use super::responses_types::{OutputContentPart, OutputItem, ResponsesResponse};

/// Translate a Chat Completions response. `model` is the model string the
/// client originally asked for and is echoed back verbatim.
pub fn chat_to_anthropic(resp: &ChatCompletionResponse, model: &str) -> MessagesResponse {
    let mut content: Vec<ResponseContentBlock> = Vec::new();
    let mut has_tool_calls = false;

    if let Some(choice) = resp.choices.first() {
        if let Some(ref text) = choice.message.content {
            if !text.is_empty() {
                content.push(ResponseContentBlock::Text { text: text.clone() });
            }
        }
        if let Some(ref calls) = choice.message.tool_calls {
            has_tool_calls = !calls.is_empty();
            for call in calls {
                content.push(ResponseContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input: parse_tool_arguments(&call.function.arguments),
                });
            }
        }
    }

    let stop_reason = match resp.choices.first().and_then(|c| c.finish_reason.as_deref()) {
        Some(reason) => map_finish_reason(reason),
        None if has_tool_calls => "tool_use",
        None => "end_turn",
    };

    let usage = resp.usage.map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    assemble(anthropic_message_id(&resp.id), model, content, stop_reason, usage)
}

/// Translate a Responses API response.
pub fn responses_to_anthropic(resp: &ResponsesResponse, model: &str) -> MessagesResponse {
    let mut content: Vec<ResponseContentBlock> = Vec::new();
    let mut has_tool_calls = false;

    for item in &resp.output {
        match item {
            OutputItem::Message { content: parts, .. } => {
                for part in parts {
                    if let OutputContentPart::OutputText { text } = part {
                        if !text.is_empty() {
                            content.push(ResponseContentBlock::Text { text: text.clone() });
                        }
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                has_tool_calls = true;
                content.push(ResponseContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: name.clone(),
                    input: parse_tool_arguments(arguments),
                });
            }
            OutputItem::Other => {}
        }
    }

    let stop_reason = responses_stop_reason(resp, has_tool_calls);

    let usage = resp.usage.map_or_else(Usage::default, |u| Usage {
        input_tokens: u.input_tokens,
        output_tokens: u.output_tokens,
    });

    assemble(anthropic_message_id(&resp.id), model, content, stop_reason, usage)
}

fn assemble(
    id: String,
    model: &str,
    mut content: Vec<ResponseContentBlock>,
    stop_reason: &str,
    usage: Usage,
) -> MessagesResponse {
    // Clients expect at least one content block.
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Derive the stop reason for a Responses result from its `status` and
/// `incomplete_details`.
pub fn responses_stop_reason(resp: &ResponsesResponse, has_tool_calls: bool) -> &'static str {
    if let Some(details) = &resp.incomplete_details {
        if matches!(
            details.reason.as_deref(),
            Some("max_tokens") | Some("max_output_tokens")
        ) {
            return "max_tokens";
        }
    }
    if has_tool_calls {
        return "tool_use";
    }
    match resp.status.as_deref() {
        Some(status) => map_finish_reason(status),
        None => "end_turn",
    }
}

/// Unified upstream finish-token to Anthropic stop_reason mapping. Tokens
/// outside the table collapse to `end_turn` so clients only ever see the
/// documented values.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "stop" | "completed" | "content_filter" => "end_turn",
        "tool_calls" | "function_call" | "requires_action" => "tool_use",
        "length" | "max_output_tokens" => "max_tokens",
        "stop_sequence" => "stop_sequence",
        _ => "end_turn",
    }
}

/// Parse streamed-together tool-call arguments. Malformed JSON is preserved
/// under `_raw` rather than dropped.
pub fn parse_tool_arguments(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "_raw": raw }))
}

/// Upstream message ids are surfaced with Anthropic's `msg_` prefix.
pub fn anthropic_message_id(upstream_id: &str) -> String {
    if upstream_id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else if upstream_id.starts_with("msg_") {
        upstream_id.to_string()
    } else {
        format!("msg_{upstream_id}")
    }
}

/// Map an upstream HTTP status (plus its error message) onto the Anthropic
/// error envelope.
pub fn error_for_status(status: u16, message: &str) -> ErrorResponse {
    let kind = match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        s if s >= 500 && message.to_lowercase().contains("overloaded") => "overloaded_error",
        s if s >= 500 => "api_error",
        _ => "api_error",
    };
    ErrorResponse::new(kind, message)
}
