use serde_json::{Value, json};
use tracing::warn;

use crate::error::ParleyError;
use crate::providers::common::{Flow, SseParser};
use crate::sse::SseEvent;
use crate::types::Content;

struct OpenToolUse {
    index: u64,
    id: String,
    name: String,
    partial_json: String,
}

/// Block-structured event parser for the Messages streaming API.
#[derive(Default)]
pub(super) struct AnthropicEventParser {
    tool_use: Option<OpenToolUse>,
    tool_call_emitted: bool,
}

impl SseParser for AnthropicEventParser {
    fn on_event(&mut self, event: SseEvent, out: &mut Vec<Content>) -> Result<Flow, ParleyError> {
        let payload: Value = serde_json::from_str(&event.data).map_err(|error| {
            ParleyError::protocol(format!("Invalid Anthropic SSE event: {error}"))
                .with_details(json!({ "event": event.data }))
        })?;
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .or(event.event.as_deref())
            .unwrap_or_default();

        match event_type {
            "content_block_start" => {
                let block = payload.get("content_block").ok_or_else(|| {
                    ParleyError::protocol("content_block_start missing `content_block`")
                        .with_details(json!({ "event": payload }))
                })?;
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return Ok(Flow::Continue);
                }

                let id = str_field(block, "id");
                let name = str_field(block, "name");
                if self.tool_call_emitted || self.tool_use.is_some() {
                    warn!(
                        tool_name = name.as_str(),
                        call_id = id.as_str(),
                        "only the first tool call per turn is supported; dropping tool_use block"
                    );
                    return Ok(Flow::Continue);
                }
                self.tool_use = Some(OpenToolUse {
                    index: block_index(&payload),
                    id,
                    name,
                    partial_json: String::new(),
                });
            }
            "content_block_delta" => {
                let index = block_index(&payload);
                let delta = payload.get("delta").ok_or_else(|| {
                    ParleyError::protocol("content_block_delta missing `delta`")
                        .with_details(json!({ "event": payload }))
                })?;
                match delta.get("type").and_then(Value::as_str) {
                    Some("input_json_delta") => {
                        if let Some(tool_use) = self.tool_use.as_mut() {
                            if tool_use.index == index {
                                tool_use
                                    .partial_json
                                    .push_str(&str_field(delta, "partial_json"));
                            }
                        }
                    }
                    _ => {
                        let text = str_field(delta, "text");
                        if !text.is_empty() {
                            out.push(Content::Text { text });
                        }
                    }
                }
            }
            "content_block_stop" => {
                let index = block_index(&payload);
                if self
                    .tool_use
                    .as_ref()
                    .is_some_and(|tool_use| tool_use.index == index)
                {
                    if let Some(tool_use) = self.tool_use.take() {
                        out.push(Content::tool_call(
                            tool_use.id,
                            tool_use.name,
                            tool_use.partial_json,
                        ));
                        self.tool_call_emitted = true;
                    }
                }
            }
            "message_stop" => return Ok(Flow::Stop),
            "error" => {
                let error = payload.get("error").cloned().unwrap_or(Value::Null);
                return Err(ParleyError::protocol(format!(
                    "anthropic error {}: {}",
                    str_field(&error, "type"),
                    str_field(&error, "message"),
                ))
                .with_details(payload));
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }
}

fn block_index(payload: &Value) -> u64 {
    payload.get("index").and_then(Value::as_u64).unwrap_or(0)
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
