mod client;

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use self::client::{
    CallbackFlow, ChatRequest, ChatResponse, OllamaClient, OllamaFunctionCall, OllamaMessage,
    OllamaToolCall,
};
use crate::cancel::CancelSignal;
use crate::error::ParleyError;
use crate::provider::{ChatProvider, ContentStream, ProviderConfig};
use crate::providers::common::{
    assistant_content_error, blob_base64, document_text, failed_stream, user_content_error,
};
use crate::types::{Content, Message, Role, ToolDescriptor, normalize_tool_arguments};

pub(crate) const DEFAULT_HOST: &str = "http://localhost:11434";

pub struct OllamaProvider {
    config: ProviderConfig,
    client: OllamaClient,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let host = config
            .base_url
            .clone()
            .or_else(|| env::var("OLLAMA_HOST").ok())
            .filter(|host| !host.trim().is_empty())
            .map(|host| with_scheme(&host))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        Self {
            client: OllamaClient::new(host),
            config,
        }
    }

    fn request(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> Result<ChatRequest, ParleyError> {
        Ok(ChatRequest {
            model: self.config.model.clone(),
            messages: convert_messages(&self.config.system_prompt, messages)?,
            tools: tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        },
                    })
                })
                .collect(),
            stream,
            options: self.options(),
        })
    }

    fn options(&self) -> Map<String, Value> {
        let params = &self.config.params;
        let mut options = Map::new();
        let mut set = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                options.insert(key.to_string(), value);
            }
        };
        set("temperature", params.temperature.map(|v| json!(v)));
        set("seed", params.seed.map(|v| json!(v)));
        set("stop", params.stop.as_ref().map(|v| json!(v)));
        set("top_k", params.top_k.map(|v| json!(v)));
        set("top_p", params.top_p.map(|v| json!(v)));
        set("min_p", params.min_p.map(|v| json!(v)));
        set(
            "num_predict",
            self.config.max_tokens.or(params.max_tokens).map(|v| json!(v)),
        );
        options
    }
}

fn with_scheme(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// Sets the stop flag and tears down the host call once the pulling side
/// goes away.
struct StopOnDrop {
    stop: Arc<AtomicBool>,
    worker: AbortHandle,
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.worker.abort();
    }
}

/// Turns one pushed response into canonical content. Ollama does not assign
/// call ids, so one is minted here.
fn translate_response(response: ChatResponse, tool_call_emitted: &mut bool) -> Vec<Content> {
    let mut contents = Vec::new();
    if !response.message.content.is_empty() {
        contents.push(Content::Text {
            text: response.message.content,
        });
    }
    for call in response.message.tool_calls {
        if *tool_call_emitted {
            warn!(
                tool_name = call.function.name.as_str(),
                "only the first tool call per turn is supported; dropping tool call"
            );
            continue;
        }
        *tool_call_emitted = true;
        let arguments = match &call.function.arguments {
            Value::Null => String::new(),
            value => value.to_string(),
        };
        contents.push(Content::ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: call.function.name,
            arguments: normalize_tool_arguments(arguments),
        });
    }
    contents
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDescriptor>,
        signal: CancelSignal,
    ) -> ContentStream {
        let request = match self.request(&messages, &tools, true) {
            Ok(request) => request,
            Err(error) => return failed_stream(error),
        };
        let client = self.client.clone();

        Box::pin(async_stream::stream! {
            let stop = Arc::new(AtomicBool::new(false));
            let (tx, mut rx) = mpsc::channel::<Result<Content, ParleyError>>(1);

            let worker_stop = Arc::clone(&stop);
            let worker_signal = signal.clone();
            let worker = tokio::spawn(async move {
                let error_tx = tx.clone();
                let mut tool_call_emitted = false;
                let callback = move |response: ChatResponse| {
                    let contents = translate_response(response, &mut tool_call_emitted);
                    let tx = tx.clone();
                    let stop = Arc::clone(&worker_stop);
                    async move {
                        for content in contents {
                            if stop.load(Ordering::SeqCst) {
                                return CallbackFlow::Stop;
                            }
                            if tx.send(Ok(content)).await.is_err() {
                                stop.store(true, Ordering::SeqCst);
                                return CallbackFlow::Stop;
                            }
                        }
                        if stop.load(Ordering::SeqCst) {
                            CallbackFlow::Stop
                        } else {
                            CallbackFlow::Continue
                        }
                    }
                };

                let result = tokio::select! {
                    _ = worker_signal.cancelled() => Ok(()),
                    result = client.chat(&request, callback) => result,
                };
                if let Err(error) = result {
                    let _ = error_tx.send(Err(error)).await;
                }
            });
            let _guard = StopOnDrop {
                stop: Arc::clone(&stop),
                worker: worker.abort_handle(),
            };

            loop {
                let item = tokio::select! {
                    _ = signal.cancelled() => {
                        debug!(provider = "ollama", "stream cancelled");
                        stop.store(true, Ordering::SeqCst);
                        return;
                    }
                    item = rx.recv() => item,
                };
                match item {
                    Some(Ok(content)) => yield Ok(content),
                    Some(Err(error)) => {
                        yield Err(error);
                        return;
                    }
                    None => return,
                }
            }
        })
    }

    async fn generate_title(&self, text: &str) -> Result<String, ParleyError> {
        let request = self.request(&[Message::user_text(text)], &[], false)?;
        let mut title = String::new();
        self.client
            .chat(&request, |response| {
                title.push_str(&response.message.content);
                async { CallbackFlow::Continue }
            })
            .await?;
        Ok(title)
    }
}

fn convert_messages(
    system_prompt: &str,
    messages: &[Message],
) -> Result<Vec<OllamaMessage>, ParleyError> {
    let mut converted = vec![OllamaMessage {
        role: "system".to_string(),
        content: system_prompt.to_string(),
        ..OllamaMessage::default()
    }];
    for message in messages {
        match message.role {
            Role::User => converted.push(user_message(&message.contents)?),
            Role::Assistant => converted.extend(assistant_messages(&message.contents)?),
        }
    }
    Ok(converted)
}

fn user_message(contents: &[Content]) -> Result<OllamaMessage, ParleyError> {
    let mut texts = Vec::new();
    let mut images = Vec::new();
    for content in contents {
        match content {
            Content::Text { text } => texts.push(text.clone()),
            Content::Resource { resources } => {
                for resource in resources {
                    if resource.is_image() {
                        images.push(blob_base64(resource));
                    } else {
                        texts.push(document_text(resource));
                    }
                }
            }
            Content::ToolCall { .. } | Content::ToolResult { .. } => {
                return Err(user_content_error(content));
            }
        }
    }
    Ok(OllamaMessage {
        role: "user".to_string(),
        content: texts.join("\n\n"),
        images,
        ..OllamaMessage::default()
    })
}

fn assistant_messages(contents: &[Content]) -> Result<Vec<OllamaMessage>, ParleyError> {
    let mut messages = Vec::new();
    let mut text = String::new();
    for content in contents {
        match content {
            Content::Text { text: delta } => text.push_str(delta),
            Content::ToolCall {
                name, arguments, ..
            } => messages.push(OllamaMessage {
                role: "assistant".to_string(),
                content: std::mem::take(&mut text),
                tool_calls: vec![OllamaToolCall {
                    function: OllamaFunctionCall {
                        name: name.clone(),
                        arguments: serde_json::from_str(arguments)
                            .unwrap_or_else(|_| Value::Object(Map::new())),
                    },
                }],
                ..OllamaMessage::default()
            }),
            Content::ToolResult { result, .. } => messages.push(OllamaMessage {
                role: "tool".to_string(),
                content: result.clone(),
                ..OllamaMessage::default()
            }),
            Content::Resource { .. } => return Err(assistant_content_error(content)),
        }
    }
    if !text.is_empty() {
        messages.push(OllamaMessage {
            role: "assistant".to_string(),
            content: text,
            ..OllamaMessage::default()
        });
    }
    Ok(messages)
}
