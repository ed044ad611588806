//! Thin typed client for the chat-completions endpoint, shaped like the
//! official SDKs: build a request struct, get back either a response or a
//! chunk stream you `recv()` from until it returns `None`.

use std::collections::{BTreeMap, VecDeque};

use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ParleyError;
use crate::providers::common::{join_url, send_checked, shared_http_client};
use crate::sse::{SseDecoder, SseEvent};

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatTool>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<BTreeMap<String, i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub(crate) enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: UserMessageContent,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<AssistantToolCall>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub(crate) enum UserMessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct AssistantToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ChatTool {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseChoice {
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct OpenAiClient {
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub(crate) fn new(base_url: String, api_key: String) -> Self {
        Self { base_url, api_key }
    }

    async fn post(&self, request: &ChatCompletionRequest) -> Result<Response, ParleyError> {
        let builder = shared_http_client(&self.base_url)
            .post(join_url(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(request);
        send_checked(builder, "OpenAI").await
    }

    pub(crate) async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ParleyError> {
        let response = self.post(request).await?;
        response.json().await.map_err(|error| {
            ParleyError::protocol(format!("OpenAI response is not a chat completion: {error}"))
        })
    }

    pub(crate) async fn create_chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionStream, ParleyError> {
        let response = self.post(request).await?;
        Ok(ChatCompletionStream {
            response,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            finished: false,
        })
    }
}

pub(crate) struct ChatCompletionStream {
    response: Response,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl ChatCompletionStream {
    /// Next chunk, or `None` once the server closes the stream.
    pub(crate) async fn recv(&mut self) -> Option<Result<ChatCompletionChunk, ParleyError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                let data = event.data.trim();
                if data == "[DONE]" {
                    self.finished = true;
                    self.pending.clear();
                    return None;
                }
                return Some(decode_chunk(data));
            }
            if self.finished {
                return None;
            }

            match self.response.chunk().await {
                Ok(Some(bytes)) => self.pending.extend(self.decoder.push(&bytes)),
                Ok(None) => {
                    self.finished = true;
                    self.pending.extend(self.decoder.finish());
                }
                Err(error) => {
                    self.finished = true;
                    return Some(Err(ParleyError::transport(format!(
                        "OpenAI stream read failed: {error}"
                    ))));
                }
            }
        }
    }
}

/// Servers report failures mid-stream as a chunk carrying a top-level
/// `error` object instead of choices.
fn decode_chunk(data: &str) -> Result<ChatCompletionChunk, ParleyError> {
    let payload: Value = serde_json::from_str(data).map_err(|error| {
        ParleyError::protocol(format!("Invalid OpenAI stream chunk: {error}"))
            .with_details(json!({ "event": data }))
    })?;
    if let Some(error) = payload.get("error").filter(|error| error.is_object()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(
            ParleyError::protocol(format!("OpenAI stream error: {message}"))
                .with_details(error.clone()),
        );
    }
    serde_json::from_value(payload).map_err(|error| {
        ParleyError::protocol(format!("Invalid OpenAI stream chunk: {error}"))
            .with_details(json!({ "event": data }))
    })
}
