//! State machines that translate upstream SSE streams into the Anthropic
//! event sequence.
//!
//! Both translators uphold the same framing contract: exactly one
//! `message_start` before any content and exactly one `message_stop` last;
//! block start/stop events form balanced pairs with dense indices; at most
//! one block is open at any time. Callers feed decoded upstream chunks via
//! `process_*` and must call `finish()` when the upstream ends, which always
//! yields the terminal `message_delta` + `message_stop` pair.

use std::collections::HashMap;

use super::anthropic_types::{
    Delta, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, ResponseContentBlock,
    StreamEvent, Usage,
};
use super::openai_types::ChatCompletionChunk;
use super::response::{map_finish_reason, responses_stop_reason};
use super::responses_types::{OutputItem, ResponsesResponse, ResponsesStreamEvent};

/// Which kind of block is currently open, and at which Anthropic index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(usize),
    Tool(usize),
}

impl OpenBlock {
    fn index(self) -> usize {
        match self {
            OpenBlock::Text(i) | OpenBlock::Tool(i) => i,
        }
    }
}

// ---------------------------------------------------------------------------
// Chat Completions streams
// ---------------------------------------------------------------------------

/// Translates Chat Completions chunks (`choices[0].delta`) into Anthropic
/// stream events.
#[derive(Debug)]
pub struct ChatStreamTranslator {
    model: String,
    msg_id: String,
    started: bool,
    finished: bool,
    next_index: usize,
    open_block: Option<OpenBlock>,
    /// Upstream tool-call ordinal to Anthropic block index. Text blocks may
    /// open first, so the two index spaces differ.
    tool_blocks: HashMap<u64, usize>,
    input_tokens: u64,
    output_tokens: u64,
    finish_reason: Option<String>,
}

impl ChatStreamTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            msg_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            finished: false,
            next_index: 0,
            open_block: None,
            tool_blocks: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: None,
        }
    }

    /// Process one upstream chunk, returning zero or more events to emit.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();

        if let Some(usage) = chunk.usage {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }

        if !self.started {
            events.push(self.message_start());
            events.push(StreamEvent::Ping);
            self.started = true;
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
            let index = self.ensure_text_block(&mut events);
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        for call in choice.delta.tool_calls.iter().flatten() {
            let index = match self.tool_blocks.get(&call.index) {
                Some(&index) => index,
                None => self.open_tool_block(call.index, call, &mut events),
            };
            if let Some(fragment) = call
                .function
                .as_ref()
                .and_then(|f| f.arguments.as_deref())
                .filter(|a| !a.is_empty())
            {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::InputJsonDelta {
                        partial_json: fragment.to_string(),
                    },
                });
            }
        }

        // Record only; blocks close when the stream terminates.
        if let Some(ref reason) = choice.finish_reason {
            self.finish_reason = Some(reason.clone());
        }

        events
    }

    /// Terminal sequence, emitted on `[DONE]` or upstream EOF.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
            self.started = true;
        }
        self.close_open_block(&mut events);

        let reason = self
            .finish_reason
            .as_deref()
            .map_or("end_turn", map_finish_reason);

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(reason.to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    /// Abort mid-stream: an `error` event, then the final `message_stop`.
    pub fn fail(&mut self, error: ErrorBody) -> Vec<StreamEvent> {
        abort_events(&mut self.finished, error)
    }

    fn ensure_text_block(&mut self, events: &mut Vec<StreamEvent>) -> usize {
        if let Some(OpenBlock::Text(index)) = self.open_block {
            return index;
        }
        self.close_open_block(events);
        let index = self.next_index;
        self.next_index += 1;
        self.open_block = Some(OpenBlock::Text(index));
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::Text {
                text: String::new(),
            },
        });
        index
    }

    fn open_tool_block(
        &mut self,
        upstream_index: u64,
        call: &super::openai_types::ChunkToolCall,
        events: &mut Vec<StreamEvent>,
    ) -> usize {
        self.close_open_block(events);
        let index = self.next_index;
        self.next_index += 1;

        let id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("toolu_{upstream_index}"));
        let name = call
            .function
            .as_ref()
            .and_then(|f| f.name.clone())
            .unwrap_or_default();

        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::ToolUse {
                id,
                name,
                input: serde_json::Value::Object(serde_json::Map::new()),
            },
        });
        self.tool_blocks.insert(upstream_index, index);
        self.open_block = Some(OpenBlock::Tool(index));
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop {
                index: open.index(),
            });
        }
    }

    fn message_start(&self) -> StreamEvent {
        message_start_event(&self.msg_id, &self.model, self.input_tokens)
    }
}

// ---------------------------------------------------------------------------
// Responses API streams
// ---------------------------------------------------------------------------

/// Per-tool-call state for a Responses stream: where its block lives and how
/// much of its argument string has been emitted (so
/// `function_call_arguments.done` can reconcile a missed suffix).
#[derive(Debug)]
struct ToolItemState {
    block_index: usize,
    args_seen: String,
}

/// Translates typed Responses API events into Anthropic stream events.
#[derive(Debug)]
pub struct ResponsesStreamTranslator {
    model: String,
    msg_id: Option<String>,
    started: bool,
    finished: bool,
    next_index: usize,
    open_block: Option<OpenBlock>,
    /// Upstream `output_index` of message items to their open text block.
    text_blocks: HashMap<u64, usize>,
    /// Upstream `output_index` of function_call items to their tool block.
    tool_items: HashMap<u64, ToolItemState>,
    saw_tool_call: bool,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<&'static str>,
}

impl ResponsesStreamTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            msg_id: None,
            started: false,
            finished: false,
            next_index: 0,
            open_block: None,
            text_blocks: HashMap::new(),
            tool_items: HashMap::new(),
            saw_tool_call: false,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
        }
    }

    pub fn process_event(&mut self, event: &ResponsesStreamEvent) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        match event {
            ResponsesStreamEvent::Created { response }
            | ResponsesStreamEvent::InProgress { response }
            | ResponsesStreamEvent::Queued { response } => {
                self.start(Some(response), &mut events);
            }
            ResponsesStreamEvent::OutputItemAdded { output_index, item } => {
                self.start(None, &mut events);
                match item {
                    // Text blocks open lazily on the first output_text delta.
                    OutputItem::Message { .. } => {}
                    OutputItem::FunctionCall {
                        call_id,
                        name,
                        arguments,
                        ..
                    } => {
                        self.open_tool_item(*output_index, call_id, name, &mut events);
                        if !arguments.is_empty() {
                            events.extend(self.tool_fragment(*output_index, arguments));
                        }
                    }
                    OutputItem::Other => {}
                }
            }
            ResponsesStreamEvent::OutputTextDelta {
                output_index,
                delta,
            } => {
                self.start(None, &mut events);
                let index = self.ensure_text_block(*output_index, &mut events);
                if !delta.is_empty() {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::TextDelta {
                            text: delta.clone(),
                        },
                    });
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
            } => {
                self.start(None, &mut events);
                if !self.tool_items.contains_key(output_index) {
                    // Fragment before its output_item.added: open with a
                    // synthesized identity.
                    let id = format!("toolu_{output_index}");
                    self.open_tool_item(*output_index, &id, "", &mut events);
                }
                events.extend(self.tool_fragment(*output_index, delta));
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                output_index,
                arguments,
            } => {
                // Emit whatever suffix the deltas did not cover.
                let suffix = self.tool_items.get(output_index).and_then(|state| {
                    (arguments.starts_with(&state.args_seen)
                        && arguments.len() > state.args_seen.len())
                    .then(|| arguments[state.args_seen.len()..].to_string())
                });
                if let Some(suffix) = suffix {
                    events.extend(self.tool_fragment(*output_index, &suffix));
                }
            }
            ResponsesStreamEvent::OutputItemDone { output_index, item } => {
                let block = match item {
                    OutputItem::Message { .. } => self.text_blocks.get(output_index).copied(),
                    OutputItem::FunctionCall { .. } => {
                        self.tool_items.get(output_index).map(|s| s.block_index)
                    }
                    OutputItem::Other => None,
                };
                if let (Some(index), Some(open)) = (block, self.open_block) {
                    if open.index() == index {
                        self.open_block = None;
                        events.push(StreamEvent::ContentBlockStop { index });
                    }
                }
            }
            ResponsesStreamEvent::Completed { response }
            | ResponsesStreamEvent::Incomplete { response }
            | ResponsesStreamEvent::Failed { response } => {
                self.start(Some(response), &mut events);
                if let Some(usage) = response.usage {
                    self.input_tokens = usage.input_tokens;
                    self.output_tokens = usage.output_tokens;
                }
                self.stop_reason = Some(responses_stop_reason(response, self.saw_tool_call));
                events.extend(self.finish());
            }
            ResponsesStreamEvent::Error { message, .. } => {
                events.extend(self.fail(ErrorBody {
                    error_type: "api_error".to_string(),
                    message: message.clone(),
                }));
            }
            ResponsesStreamEvent::Other => {}
        }
        events
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
            self.started = true;
        }
        if let Some(open) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop {
                index: open.index(),
            });
        }

        let reason = self.stop_reason.unwrap_or(if self.saw_tool_call {
            "tool_use"
        } else {
            "end_turn"
        });

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(reason.to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    pub fn fail(&mut self, error: ErrorBody) -> Vec<StreamEvent> {
        abort_events(&mut self.finished, error)
    }

    fn start(&mut self, response: Option<&ResponsesResponse>, events: &mut Vec<StreamEvent>) {
        if let Some(resp) = response {
            if self.msg_id.is_none() && !resp.id.is_empty() {
                self.msg_id = Some(format!("msg_{}", resp.id));
            }
            if let Some(usage) = resp.usage {
                self.input_tokens = usage.input_tokens;
            }
        }
        if !self.started {
            events.push(self.message_start());
            events.push(StreamEvent::Ping);
            self.started = true;
        }
    }

    fn message_start(&self) -> StreamEvent {
        let id = self
            .msg_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));
        message_start_event(&id, &self.model, self.input_tokens)
    }

    fn ensure_text_block(&mut self, output_index: u64, events: &mut Vec<StreamEvent>) -> usize {
        if let Some(&index) = self.text_blocks.get(&output_index) {
            if self.open_block == Some(OpenBlock::Text(index)) {
                return index;
            }
        }
        if let Some(open) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop {
                index: open.index(),
            });
        }
        let index = self.next_index;
        self.next_index += 1;
        self.text_blocks.insert(output_index, index);
        self.open_block = Some(OpenBlock::Text(index));
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::Text {
                text: String::new(),
            },
        });
        index
    }

    fn open_tool_item(
        &mut self,
        output_index: u64,
        call_id: &str,
        name: &str,
        events: &mut Vec<StreamEvent>,
    ) {
        if self.tool_items.contains_key(&output_index) {
            return;
        }
        if let Some(open) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop {
                index: open.index(),
            });
        }
        let index = self.next_index;
        self.next_index += 1;

        let id = if call_id.is_empty() {
            format!("toolu_{output_index}")
        } else {
            call_id.to_string()
        };

        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::ToolUse {
                id,
                name: name.to_string(),
                input: serde_json::Value::Object(serde_json::Map::new()),
            },
        });
        self.tool_items.insert(
            output_index,
            ToolItemState {
                block_index: index,
                args_seen: String::new(),
            },
        );
        self.open_block = Some(OpenBlock::Tool(index));
        self.saw_tool_call = true;
    }

    fn tool_fragment(&mut self, output_index: u64, fragment: &str) -> Vec<StreamEvent> {
        let Some(state) = self.tool_items.get_mut(&output_index) else {
            return Vec::new();
        };
        if fragment.is_empty() {
            return Vec::new();
        }
        state.args_seen.push_str(fragment);
        vec![StreamEvent::ContentBlockDelta {
            index: state.block_index,
            delta: Delta::InputJsonDelta {
                partial_json: fragment.to_string(),
            },
        }]
    }
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

fn message_start_event(id: &str, model: &str, input_tokens: u64) -> StreamEvent {
    StreamEvent::MessageStart {
        message: MessagesResponse {
            id: id.to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model: model.to_string(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage {
                input_tokens,
                output_tokens: 0,
            },
        },
    }
}

fn abort_events(finished: &mut bool, error: ErrorBody) -> Vec<StreamEvent> {
    if *finished {
        return Vec::new();
    }
    *finished = true;
    vec![StreamEvent::Error { error }, StreamEvent::MessageStop]
}
