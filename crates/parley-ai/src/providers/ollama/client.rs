//! Callback-driven client for the `/api/chat` endpoint. The host pushes each
//! decoded response line into a caller-supplied callback, which decides
//! whether the call keeps going.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{ParleyError, ParleyErrorCode};
use crate::providers::common::{join_url, send_checked, shared_http_client};
use crate::sse::LineDecoder;

/// Returned by a chat callback. `Stop` halts the underlying request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackFlow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct OllamaMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct OllamaToolCall {
    pub function: OllamaFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct OllamaFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub message: OllamaMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct OllamaClient {
    host: String,
}

impl OllamaClient {
    pub(crate) fn new(host: String) -> Self {
        Self { host }
    }

    pub(crate) async fn chat<F, Fut>(
        &self,
        request: &ChatRequest,
        mut on_response: F,
    ) -> Result<(), ParleyError>
    where
        F: FnMut(ChatResponse) -> Fut,
        Fut: Future<Output = CallbackFlow>,
    {
        let builder = shared_http_client(&self.host)
            .post(join_url(&self.host, "api/chat"))
            .json(request);
        let mut response = send_checked(builder, "Ollama").await?;
        let mut lines = LineDecoder::default();

        loop {
            let (batch, ended) = match response.chunk().await {
                Ok(Some(bytes)) => (lines.push(&bytes), false),
                Ok(None) => (lines.finish().into_iter().collect::<Vec<_>>(), true),
                Err(error) => {
                    return Err(ParleyError::transport(format!(
                        "Ollama stream read failed: {error}"
                    )));
                }
            };

            for line in batch {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: ChatResponse = serde_json::from_str(&line).map_err(|error| {
                    ParleyError::protocol(format!("Invalid Ollama response line: {error}"))
                        .with_details(json!({ "line": line }))
                })?;
                if let Some(message) = parsed.error {
                    return Err(ParleyError::new(
                        ParleyErrorCode::ProviderHttp,
                        format!("Ollama error: {message}"),
                    ));
                }
                if on_response(parsed).await == CallbackFlow::Stop {
                    return Ok(());
                }
            }

            if ended {
                return Ok(());
            }
        }
    }
}
