//! Request dispatch: pick an API flavor, build the upstream body, forward,
//! and translate the result back.
//!
//! The only automatic recovery is the one-shot Chat ↔ Responses retry when
//! the upstream says the model lives behind the other API. Network errors
//! are never retried. For streams the retry window closes as soon as the
//! upstream accepts the request; after that, failures surface as an SSE
//! `error` event followed by `message_stop`.

use crate::config::RouterConfig;
use crate::error::{ProxyError, Result};
use crate::router::ApiFlavor;
use crate::translate::anthropic_types::{
    ErrorBody, ErrorResponse, MessagesRequest, MessagesResponse, StreamEvent,
};
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatCompletionResponse, UpstreamErrorResponse,
};
use crate::translate::request::{to_chat_completions, to_responses};
use crate::translate::response::{chat_to_anthropic, error_for_status, responses_to_anthropic};
use crate::translate::responses_types::{ResponsesResponse, ResponsesStreamEvent};
use crate::translate::streaming::{ChatStreamTranslator, ResponsesStreamTranslator};
use crate::upstream::UpstreamClient;

use bytes::Bytes;
use futures::stream::{self, Stream};
use futures::StreamExt;
use std::pin::Pin;
use tracing::{debug, info, warn};

/// Outcome of a non-streaming dispatch.
pub enum DispatchOutcome {
    /// Translated upstream success.
    Success(MessagesResponse),
    /// Upstream error, mapped to the Anthropic envelope; the status is
    /// propagated downstream unchanged.
    Error(ErrorResponse, u16),
}

/// A single SSE event ready for emission.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

pub type SseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<SseEvent, std::io::Error>> + Send>>;

/// Forward a non-streaming request.
pub async fn dispatch_non_streaming(
    req: &MessagesRequest,
    api_key: &str,
    config: &RouterConfig,
    upstream: &UpstreamClient,
) -> Result<DispatchOutcome> {
    let model = config.upstream_model(&req.model).to_string();
    let mut flavor = config.flavor_for(&model);

    info!(model = %model, flavor = %flavor, "dispatching request");

    let (mut status, mut body) = send(req, &model, flavor, api_key, upstream).await?;

    // Wrong-flavor rejections are 4xx; 5xx failures are never retried.
    if (400..500).contains(&status) {
        if let Some(retry) = flavor_fallback(flavor, &error_message(&body)) {
            info!(from = %flavor, to = %retry, "retrying with the other API flavor");
            flavor = retry;
            (status, body) = send(req, &model, retry, api_key, upstream).await?;
        }
    }

    if status >= 400 {
        let message = error_message(&body);
        let message = if message.is_empty() {
            format!("Upstream returned status {status}")
        } else {
            message
        };
        warn!(status, "upstream error");
        return Ok(DispatchOutcome::Error(
            error_for_status(status, &message),
            status,
        ));
    }

    let response = match flavor {
        ApiFlavor::Chat => {
            let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
            chat_to_anthropic(&parsed, &req.model)
        }
        ApiFlavor::Responses => {
            let parsed: ResponsesResponse = serde_json::from_str(&body)?;
            responses_to_anthropic(&parsed, &req.model)
        }
    };

    debug!(
        input_tokens = response.usage.input_tokens,
        output_tokens = response.usage.output_tokens,
        "request completed"
    );

    Ok(DispatchOutcome::Success(response))
}

/// Forward a streaming request. Always yields a well-formed Anthropic event
/// stream: upstream rejections become an `error` event plus `message_stop`.
pub async fn dispatch_streaming(
    req: &MessagesRequest,
    api_key: &str,
    config: &RouterConfig,
    upstream: &UpstreamClient,
) -> SseStream {
    let model = config.upstream_model(&req.model).to_string();
    let mut flavor = config.flavor_for(&model);

    info!(model = %model, flavor = %flavor, "dispatching streaming request");

    let mut response = match upstream
        .post(flavor, api_key, &build_body(req, &model, flavor))
        .await
    {
        Ok(r) => r,
        Err(e) => return error_stream(ErrorResponse::api_error(e.to_string())),
    };

    if response.status().as_u16() >= 400 {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);

        // Wrong-flavor rejections are 4xx; 5xx failures are never retried.
        let retry = if (400..500).contains(&status) {
            flavor_fallback(flavor, &message)
        } else {
            None
        };
        let Some(retry) = retry else {
            warn!(status, "upstream rejected stream");
            return error_stream(error_for_status(status, &message));
        };

        info!(from = %flavor, to = %retry, "retrying stream with the other API flavor");
        flavor = retry;
        response = match upstream
            .post(retry, api_key, &build_body(req, &model, retry))
            .await
        {
            Ok(r) => r,
            Err(e) => return error_stream(ErrorResponse::api_error(e.to_string())),
        };
        if response.status().as_u16() >= 400 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return error_stream(error_for_status(status, &error_message(&body)));
        }
    }

    let requested_model = req.model.clone();
    Box::pin(translate_sse(response.bytes_stream(), flavor, requested_model))
}

/// Build the upstream body for one flavor. Infallible by construction; the
/// translators never error.
fn build_body(req: &MessagesRequest, model: &str, flavor: ApiFlavor) -> serde_json::Value {
    let value = match flavor {
        ApiFlavor::Chat => serde_json::to_value(to_chat_completions(req, model)),
        ApiFlavor::Responses => serde_json::to_value(to_responses(req, model)),
    };
    value.unwrap_or(serde_json::Value::Null)
}

async fn send(
    req: &MessagesRequest,
    model: &str,
    flavor: ApiFlavor,
    api_key: &str,
    upstream: &UpstreamClient,
) -> Result<(u16, String)> {
    let response = upstream
        .post(flavor, api_key, &build_body(req, model, flavor))
        .await?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ProxyError::upstream(format!("Failed to read upstream body: {e}")))?;
    Ok((status, body))
}

/// Extract `error.message` from an upstream error body, falling back to the
/// (truncated) raw body.
fn error_message(body: &str) -> String {
    if let Ok(err) = serde_json::from_str::<UpstreamErrorResponse>(body) {
        if !err.error.message.is_empty() {
            return err.error.message;
        }
    }
    truncate(body, 500).to_string()
}

/// Does this upstream complaint mean the model lives behind the other API
/// flavor? Case-insensitive substring match on the error message.
fn flavor_fallback(flavor: ApiFlavor, message: &str) -> Option<ApiFlavor> {
    let msg = message.to_lowercase();
    let hints: &[&str] = match flavor {
        ApiFlavor::Chat => &[
            "not a chat model",
            "responses api",
            "v1/responses",
            "not supported in v1/chat/completions",
        ],
        ApiFlavor::Responses => &[
            "v1/chat/completions",
            "chat completions api",
            "not a responses model",
        ],
    };
    hints
        .iter()
        .any(|h| msg.contains(h))
        .then(|| flavor.other())
}

// ---------------------------------------------------------------------------
// Stream plumbing
// ---------------------------------------------------------------------------

/// Flavor-dispatched translator state for one in-flight stream.
enum StreamTranslator {
    Chat(ChatStreamTranslator),
    Responses(ResponsesStreamTranslator),
}

impl StreamTranslator {
    fn new(flavor: ApiFlavor, model: &str) -> Self {
        match flavor {
            ApiFlavor::Chat => Self::Chat(ChatStreamTranslator::new(model)),
            ApiFlavor::Responses => Self::Responses(ResponsesStreamTranslator::new(model)),
        }
    }

    /// Feed one SSE payload line. Unparseable chunks are skipped.
    fn process_data(&mut self, data: &str) -> Vec<StreamEvent> {
        match self {
            Self::Chat(t) => match serde_json::from_str::<ChatCompletionChunk>(data) {
                Ok(chunk) => t.process_chunk(&chunk),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable chat chunk");
                    Vec::new()
                }
            },
            Self::Responses(t) => match serde_json::from_str::<ResponsesStreamEvent>(data) {
                Ok(event) => t.process_event(&event),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable responses event");
                    Vec::new()
                }
            },
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        match self {
            Self::Chat(t) => t.finish(),
            Self::Responses(t) => t.finish(),
        }
    }

    fn fail(&mut self, error: ErrorBody) -> Vec<StreamEvent> {
        match self {
            Self::Chat(t) => t.fail(error),
            Self::Responses(t) => t.fail(error),
        }
    }
}

/// Decode an upstream SSE byte stream and emit translated Anthropic events,
/// flushing each event as soon as it is formed.
fn translate_sse(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    flavor: ApiFlavor,
    model: String,
) -> impl Stream<Item = std::result::Result<SseEvent, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut translator = StreamTranslator::new(flavor, &model);
        let mut buffer = String::new();
        let mut done = false;

        tokio::pin!(byte_stream);

        'outer: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "upstream byte stream failed");
                    for event in translator.fail(ErrorBody {
                        error_type: "api_error".to_string(),
                        message: "Upstream stream interrupted".to_string(),
                    }) {
                        if let Some(sse) = to_sse(&event) {
                            yield Ok(sse);
                        }
                    }
                    done = true;
                    break;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                // Only data lines matter; event names are embedded in the
                // payloads for both flavors.
                let Some(data) = line
                    .strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"))
                    .map(str::trim)
                else {
                    continue;
                };

                if data == "[DONE]" {
                    break 'outer;
                }

                for event in translator.process_data(data) {
                    if let Some(sse) = to_sse(&event) {
                        yield Ok(sse);
                    }
                }
            }
        }

        // Terminal sequence on [DONE], EOF, or a responses-side completed
        // event; a no-op if the stream already closed.
        if !done {
            for event in translator.finish() {
                if let Some(sse) = to_sse(&event) {
                    yield Ok(sse);
                }
            }
        }

        debug!("stream completed");
    }
}

/// A pre-stream failure as a minimal, well-formed Anthropic event stream.
fn error_stream(err: ErrorResponse) -> SseStream {
    let events = [
        StreamEvent::Error { error: err.error },
        StreamEvent::MessageStop,
    ];
    let frames: Vec<std::result::Result<SseEvent, std::io::Error>> =
        events.iter().filter_map(to_sse).map(Ok).collect();
    Box::pin(stream::iter(frames))
}

fn to_sse(event: &StreamEvent) -> Option<SseEvent> {
    let data = serde_json::to_string(event).ok()?;
    Some(SseEvent {
        event: event.event_name().to_string(),
        data,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_fallback_hints() {
        for msg in [
            "This is not a chat model.",
            "This model must use the Responses API.",
            "gpt-5-mini is not supported in v1/chat/completions",
            "This model is only supported in v1/responses.",
        ] {
            assert_eq!(
                flavor_fallback(ApiFlavor::Chat, msg),
                Some(ApiFlavor::Responses),
                "expected fallback for: {msg}"
            );
        }
    }

    #[test]
    fn responses_fallback_hints() {
        assert_eq!(
            flavor_fallback(ApiFlavor::Responses, "Use v1/chat/completions for this model"),
            Some(ApiFlavor::Chat)
        );
    }

    #[test]
    fn unrelated_errors_do_not_fall_back() {
        assert_eq!(flavor_fallback(ApiFlavor::Chat, "Invalid API key"), None);
        assert_eq!(
            flavor_fallback(ApiFlavor::Responses, "rate limit exceeded"),
            None
        );
    }

    #[test]
    fn error_message_prefers_structured_body() {
        let body = r#"{"error":{"message":"boom","type":"invalid_request_error"}}"#;
        assert_eq!(error_message(body), "boom");
        assert_eq!(error_message("plain text failure"), "plain text failure");
    }
}
