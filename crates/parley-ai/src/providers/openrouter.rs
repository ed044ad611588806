use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use crate::cancel::CancelSignal;
use crate::error::ParleyError;
use crate::params::ParameterSet;
use crate::provider::{ChatProvider, ContentStream, ProviderConfig};
use crate::providers::common::{
    Flow, SseParser, ToolCallAccumulator, assistant_content_error, blob_base64, document_text,
    failed_stream, join_url, resolve_api_key, send_checked, shared_http_client,
    sse_content_stream, user_content_error,
};
use crate::sse::SseEvent;
use crate::types::{Content, Message, Role, ToolDescriptor};

pub(crate) const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DONE_SENTINEL: &str = "[DONE]";
const APP_REFERER: &str = "http://localhost";
const APP_TITLE: &str = "parley";

pub struct OpenRouterProvider {
    config: ProviderConfig,
    api_key: String,
    base_url: String,
}

impl OpenRouterProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ParleyError> {
        let api_key =
            resolve_api_key(config.api_key.as_deref(), "OPENROUTER_API_KEY", "openrouter")?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            config,
            api_key,
            base_url,
        })
    }

    fn request(&self, payload: &Value) -> reqwest::RequestBuilder {
        shared_http_client(&self.base_url)
            .post(join_url(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(payload)
    }
}

#[async_trait]
impl ChatProvider for OpenRouterProvider {
    fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDescriptor>,
        signal: CancelSignal,
    ) -> ContentStream {
        let payload = match build_openrouter_payload(&self.config, &messages, &tools, true) {
            Ok(payload) => payload,
            Err(error) => return failed_stream(error),
        };
        debug!(provider = "openrouter", payload = %payload, "sending chat request");
        let request = self.request(&payload);
        sse_content_stream(
            "OpenRouter",
            async move { send_checked(request, "OpenRouter").await },
            OpenRouterEventParser::default(),
            signal,
        )
    }

    async fn generate_title(&self, text: &str) -> Result<String, ParleyError> {
        let payload =
            build_openrouter_payload(&self.config, &[Message::user_text(text)], &[], false)?;
        let response = send_checked(self.request(&payload), "OpenRouter").await?;
        let body: Value = response.json().await.map_err(|error| {
            ParleyError::protocol(format!("OpenRouter title response is not JSON: {error}"))
        })?;
        if let Some(error) = error_envelope(&body) {
            return Err(error);
        }

        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ParleyError::protocol("OpenRouter title response has no choices")
                    .with_details(body.clone())
            })
    }
}

fn build_openrouter_payload(
    config: &ProviderConfig,
    messages: &[Message],
    tools: &[ToolDescriptor],
    stream: bool,
) -> Result<Value, ParleyError> {
    let mut wire_messages = vec![json!({ "role": "system", "content": config.system_prompt })];
    for message in messages {
        match message.role {
            Role::User => wire_messages.push(user_message(&message.contents)?),
            Role::Assistant => wire_messages.extend(assistant_messages(&message.contents)?),
        }
    }

    let mut payload = json!({
        "model": config.model,
        "messages": wire_messages,
        "stream": stream,
    });
    if !tools.is_empty() {
        payload["tools"] = Value::Array(tools.iter().map(tool_definition).collect());
    }

    let mut params = config.params.clone();
    if config.max_tokens.is_some() {
        params.max_tokens = config.max_tokens;
    }
    apply_params(&mut payload, &params);
    Ok(payload)
}

/// Tools whose schema has no properties are sent without `parameters`.
fn tool_definition(tool: &ToolDescriptor) -> Value {
    let mut function = json!({
        "name": tool.name,
        "description": tool.description,
    });
    let has_properties = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|properties| !properties.is_empty());
    if has_properties {
        function["parameters"] = tool.input_schema.clone();
    }
    json!({ "type": "function", "function": function })
}

fn apply_params(payload: &mut Value, params: &ParameterSet) {
    let Some(object) = payload.as_object_mut() else {
        return;
    };
    let mut set = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            object.insert(key.to_string(), value);
        }
    };
    set("temperature", params.temperature.map(|v| json!(v)));
    set("top_p", params.top_p.map(|v| json!(v)));
    set("top_k", params.top_k.map(|v| json!(v)));
    set("frequency_penalty", params.frequency_penalty.map(|v| json!(v)));
    set("presence_penalty", params.presence_penalty.map(|v| json!(v)));
    set("repetition_penalty", params.repetition_penalty.map(|v| json!(v)));
    set("min_p", params.min_p.map(|v| json!(v)));
    set("top_a", params.top_a.map(|v| json!(v)));
    set("seed", params.seed.map(|v| json!(v)));
    set("max_tokens", params.max_tokens.map(|v| json!(v)));
    set("logit_bias", params.logit_bias.as_ref().map(|v| json!(v)));
    set("logprobs", params.logprobs.map(|v| json!(v)));
    set("top_logprobs", params.top_logprobs.map(|v| json!(v)));
    set("stop", params.stop.as_ref().map(|v| json!(v)));
    set("include_reasoning", params.include_reasoning.map(|v| json!(v)));
}

fn user_message(contents: &[Content]) -> Result<Value, ParleyError> {
    let mut parts = Vec::new();
    let mut has_image = false;
    for content in contents {
        match content {
            Content::Text { text } => parts.push(json!({ "type": "text", "text": text })),
            Content::Resource { resources } => {
                for resource in resources {
                    if resource.is_image() {
                        has_image = true;
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": {
                                "url": format!(
                                    "data:{};base64,{}",
                                    resource.mime(),
                                    blob_base64(resource)
                                ),
                            },
                        }));
                    } else {
                        parts.push(json!({ "type": "text", "text": document_text(resource) }));
                    }
                }
            }
            Content::ToolCall { .. } | Content::ToolResult { .. } => {
                return Err(user_content_error(content));
            }
        }
    }

    if has_image {
        return Ok(json!({ "role": "user", "content": parts }));
    }
    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(json!({ "role": "user", "content": text }))
}

fn assistant_messages(contents: &[Content]) -> Result<Vec<Value>, ParleyError> {
    let mut messages = Vec::new();
    let mut text = String::new();
    for content in contents {
        match content {
            Content::Text { text: delta } => text.push_str(delta),
            Content::ToolCall {
                id,
                name,
                arguments,
            } => {
                let mut message = Map::new();
                message.insert("role".to_string(), json!("assistant"));
                message.insert("content".to_string(), json!(std::mem::take(&mut text)));
                message.insert(
                    "tool_calls".to_string(),
                    json!([{
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments },
                    }]),
                );
                messages.push(Value::Object(message));
            }
            Content::ToolResult {
                call_id, result, ..
            } => messages.push(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": result,
            })),
            Content::Resource { .. } => return Err(assistant_content_error(content)),
        }
    }
    if !text.is_empty() {
        messages.push(json!({ "role": "assistant", "content": text }));
    }
    Ok(messages)
}

/// The stream carries both deltas and `{"error":{...}}` envelopes; a non-zero
/// code marks the latter.
fn error_envelope(payload: &Value) -> Option<ParleyError> {
    let envelope = payload.get("error")?.as_object()?;
    let code = envelope.get("code")?;
    let is_error = match code {
        Value::Number(number) => number.as_i64() != Some(0),
        Value::String(text) => !text.is_empty() && text != "0",
        _ => false,
    };
    if !is_error {
        return None;
    }
    let message = envelope
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(
        ParleyError::protocol(format!("openrouter error {code}: {message}"))
            .with_details(payload.get("error").cloned().unwrap_or(Value::Null)),
    )
}

#[derive(Default)]
struct OpenRouterEventParser {
    tool_call: ToolCallAccumulator,
}

impl SseParser for OpenRouterEventParser {
    fn on_event(&mut self, event: SseEvent, out: &mut Vec<Content>) -> Result<Flow, ParleyError> {
        let data = event.data.trim();
        if data == DONE_SENTINEL {
            return Ok(Flow::Stop);
        }

        let payload: Value = serde_json::from_str(data).map_err(|error| {
            ParleyError::protocol(format!("Invalid OpenRouter SSE payload: {error}"))
                .with_details(json!({ "event": data }))
        })?;
        if let Some(envelope) = error_envelope(&payload) {
            error!(error = %envelope, "openrouter streaming error");
            return Err(envelope);
        }

        let Some(delta) = payload.pointer("/choices/0/delta") else {
            return Ok(Flow::Continue);
        };
        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, call) in tool_calls.iter().enumerate() {
                self.tool_call.push(
                    call.get("index")
                        .and_then(Value::as_u64)
                        .or(Some(position as u64)),
                    call.get("id").and_then(Value::as_str),
                    call.pointer("/function/name").and_then(Value::as_str),
                    call.pointer("/function/arguments").and_then(Value::as_str),
                );
            }
        }
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push(Content::text(text));
            }
        }
        Ok(Flow::Continue)
    }

    fn on_end(&mut self, out: &mut Vec<Content>) -> Result<(), ParleyError> {
        if let Some(call) = self.tool_call.finish() {
            debug!(call = %call, "openrouter tool call");
            out.push(call);
        }
        Ok(())
    }
}
