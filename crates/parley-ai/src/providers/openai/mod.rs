mod client;

use async_trait::async_trait;
use tracing::debug;

use self::client::{
    AssistantToolCall, ChatCompletionRequest, ChatMessage, ChatTool, ContentPart, FunctionCall,
    FunctionDefinition, ImageUrl, OpenAiClient, UserMessageContent,
};
use crate::cancel::CancelSignal;
use crate::error::ParleyError;
use crate::provider::{ChatProvider, ContentStream, ProviderConfig};
use crate::providers::common::{
    ToolCallAccumulator, assistant_content_error, blob_base64, document_text, failed_stream,
    resolve_api_key, user_content_error,
};
use crate::types::{Content, Message, Role, ToolDescriptor};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    config: ProviderConfig,
    client: OpenAiClient,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ParleyError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), "OPENAI_API_KEY", "openai")?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            client: OpenAiClient::new(base_url, api_key),
            config,
        })
    }

    fn request(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> Result<ChatCompletionRequest, ParleyError> {
        let params = &self.config.params;
        Ok(ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: convert_messages(&self.config.system_prompt, messages)?,
            tools: tools
                .iter()
                .map(|tool| ChatTool {
                    kind: "function",
                    function: FunctionDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
                .collect(),
            stream,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop.clone(),
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            seed: params.seed,
            max_tokens: self.config.max_tokens.or(params.max_tokens),
            logit_bias: params.logit_bias.clone(),
            logprobs: params.logprobs,
            top_logprobs: params.top_logprobs,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
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
            let opened = tokio::select! {
                _ = signal.cancelled() => return,
                opened = client.create_chat_completion_stream(&request) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            let mut tool_call = ToolCallAccumulator::default();
            loop {
                let chunk = tokio::select! {
                    _ = signal.cancelled() => {
                        debug!(provider = "openai", "stream cancelled");
                        return;
                    }
                    chunk = stream.recv() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(error)) => {
                        yield Err(error);
                        return;
                    }
                    None => break,
                };

                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };
                for (position, call) in choice.delta.tool_calls.unwrap_or_default().iter().enumerate() {
                    let function = call.function.as_ref();
                    tool_call.push(
                        call.index.or(Some(position as u64)),
                        call.id.as_deref(),
                        function.and_then(|function| function.name.as_deref()),
                        function.and_then(|function| function.arguments.as_deref()),
                    );
                }
                if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                    yield Ok(Content::Text { text });
                }
            }

            if let Some(call) = tool_call.finish() {
                yield Ok(call);
            }
        })
    }

    async fn generate_title(&self, text: &str) -> Result<String, ParleyError> {
        let request = self.request(&[Message::user_text(text)], &[], false)?;
        let response = self.client.create_chat_completion(&request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ParleyError::protocol("OpenAI title response has no choices"))
    }
}

fn convert_messages(
    system_prompt: &str,
    messages: &[Message],
) -> Result<Vec<ChatMessage>, ParleyError> {
    let mut converted = vec![ChatMessage::System {
        content: system_prompt.to_string(),
    }];
    for message in messages {
        match message.role {
            Role::User => converted.push(user_message(&message.contents)?),
            Role::Assistant => converted.extend(assistant_messages(&message.contents)?),
        }
    }
    Ok(converted)
}

/// Plain text when nothing is attached, multi-part content otherwise.
fn user_message(contents: &[Content]) -> Result<ChatMessage, ParleyError> {
    let mut texts = Vec::new();
    let mut parts = Vec::new();
    let mut has_resources = false;
    for content in contents {
        match content {
            Content::Text { text } => {
                texts.push(text.clone());
                parts.push(ContentPart::Text { text: text.clone() });
            }
            Content::Resource { resources } => {
                has_resources = true;
                for resource in resources {
                    if resource.is_image() {
                        parts.push(ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: format!(
                                    "data:{};base64,{}",
                                    resource.mime(),
                                    blob_base64(resource)
                                ),
                            },
                        });
                    } else {
                        parts.push(ContentPart::Text {
                            text: document_text(resource),
                        });
                    }
                }
            }
            Content::ToolCall { .. } | Content::ToolResult { .. } => {
                return Err(user_content_error(content));
            }
        }
    }

    let content = if has_resources {
        UserMessageContent::Parts(parts)
    } else {
        UserMessageContent::Text(texts.join("\n\n"))
    };
    Ok(ChatMessage::User { content })
}

fn assistant_messages(contents: &[Content]) -> Result<Vec<ChatMessage>, ParleyError> {
    let mut messages = Vec::new();
    let mut text = String::new();
    for content in contents {
        match content {
            Content::Text { text: delta } => text.push_str(delta),
            Content::ToolCall {
                id,
                name,
                arguments,
            } => messages.push(ChatMessage::Assistant {
                content: Some(std::mem::take(&mut text)).filter(|text| !text.is_empty()),
                tool_calls: vec![AssistantToolCall {
                    id: id.clone(),
                    kind: "function",
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: arguments.clone(),
                    },
                }],
            }),
            Content::ToolResult {
                call_id, result, ..
            } => messages.push(ChatMessage::Tool {
                content: result.clone(),
                tool_call_id: call_id.clone(),
            }),
            Content::Resource { .. } => return Err(assistant_content_error(content)),
        }
    }
    if !text.is_empty() {
        messages.push(ChatMessage::Assistant {
            content: Some(text),
            tool_calls: Vec::new(),
        });
    }
    Ok(messages)
}
