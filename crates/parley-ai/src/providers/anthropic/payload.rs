use serde_json::{Map, Value, json};

use crate::error::ParleyError;
use crate::params::ParameterSet;
use crate::providers::common::{
    assistant_content_error, blob_base64, document_text, raw_json_value,
    user_content_error,
};
use crate::types::{Content, Message, ResourceContents, Role, ToolDescriptor};

pub(super) struct AnthropicRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub max_tokens: u32,
    pub params: &'a ParameterSet,
    pub stream: bool,
}

pub(super) fn build_anthropic_payload(
    request: &AnthropicRequest<'_>,
    messages: &[Message],
    tools: &[ToolDescriptor],
) -> Result<Value, ParleyError> {
    let mut payload = json!({
        "model": request.model,
        "messages": convert_messages(messages)?,
        "system": request.system_prompt,
        "max_tokens": request.max_tokens,
        "stream": request.stream,
    });

    if !tools.is_empty() {
        payload["tools"] = Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect(),
        );
    }

    let params = request.params;
    if let Some(stop) = params.stop.as_ref() {
        let stop_sequences = sanitize_stop_sequences(stop);
        if !stop_sequences.is_empty() {
            payload["stop_sequences"] = json!(stop_sequences);
        }
    }
    if let Some(temperature) = params.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_k) = params.top_k {
        payload["top_k"] = json!(top_k);
    }
    if let Some(top_p) = params.top_p {
        payload["top_p"] = json!(top_p);
    }

    Ok(payload)
}

/// Anthropic rejects stop sequences padded with blanks: strip surrounding
/// spaces and tabs and drop anything left empty.
pub(super) fn sanitize_stop_sequences(stop: &[String]) -> Vec<String> {
    stop.iter()
        .map(|sequence| sequence.trim_matches(|c| c == ' ' || c == '\t'))
        .filter(|sequence| !sequence.is_empty())
        .map(str::to_string)
        .collect()
}

fn convert_messages(messages: &[Message]) -> Result<Vec<Value>, ParleyError> {
    let mut converted = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::User => {
                let blocks = user_blocks(&message.contents)?;
                if !blocks.is_empty() {
                    converted.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => converted.extend(assistant_messages(&message.contents)?),
        }
    }
    Ok(converted)
}

fn user_blocks(contents: &[Content]) -> Result<Vec<Value>, ParleyError> {
    let mut blocks = Vec::with_capacity(contents.len());
    for content in contents {
        match content {
            Content::Text { text } => {
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
            }
            Content::Resource { resources } => blocks.extend(resources.iter().map(resource_block)),
            Content::ToolCall { .. } | Content::ToolResult { .. } => {
                return Err(user_content_error(content));
            }
        }
    }
    Ok(blocks)
}

fn resource_block(resource: &ResourceContents) -> Value {
    if resource.is_image() {
        return json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": resource.mime(),
                "data": blob_base64(resource),
            },
        });
    }
    if resource.mime() == "application/pdf" && resource.blob.is_some() {
        return json!({
            "type": "document",
            "source": {
                "type": "base64",
                "media_type": "application/pdf",
                "data": blob_base64(resource),
            },
        });
    }
    json!({ "type": "text", "text": document_text(resource) })
}

/// Each `tool_use` closes the assistant message it belongs to and each tool
/// result travels back as its own user message.
fn assistant_messages(contents: &[Content]) -> Result<Vec<Value>, ParleyError> {
    let mut messages = Vec::new();
    let mut blocks: Vec<Value> = Vec::new();

    for content in contents {
        match content {
            Content::Text { text } => {
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
            }
            Content::ToolCall {
                id,
                name,
                arguments,
            } => {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": raw_json_value(arguments),
                }));
                messages.push(assistant_message(std::mem::take(&mut blocks)));
            }
            Content::ToolResult {
                call_id,
                result,
                failed,
            } => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "is_error": failed,
                        "content": raw_json_value(result),
                    }],
                }));
            }
            Content::Resource { .. } => return Err(assistant_content_error(content)),
        }
    }

    if !blocks.is_empty() {
        messages.push(assistant_message(blocks));
    }
    Ok(messages)
}

fn assistant_message(blocks: Vec<Value>) -> Value {
    let mut message = Map::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    message.insert("content".to_string(), Value::Array(blocks));
    Value::Object(message)
}
