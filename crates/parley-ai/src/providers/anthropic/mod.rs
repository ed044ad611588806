mod parser;
mod payload;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use self::parser::AnthropicEventParser;
use self::payload::{AnthropicRequest, build_anthropic_payload};
use crate::cancel::CancelSignal;
use crate::error::{ParleyError, ParleyErrorCode};
use crate::provider::{ChatProvider, ContentStream, ProviderConfig};
use crate::providers::common::{
    failed_stream, join_url, resolve_api_key, send_checked, shared_http_client, sse_content_stream,
};
use crate::types::{Message, ToolDescriptor};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    config: ProviderConfig,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ParleyError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), "ANTHROPIC_API_KEY", "anthropic")?;
        let max_tokens = config
            .max_tokens
            .or(config.params.max_tokens)
            .ok_or_else(|| {
                ParleyError::new(
                    ParleyErrorCode::ProviderConfig,
                    "anthropic provider requires max_tokens",
                )
            })?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            config,
            api_key,
            base_url,
            max_tokens,
        })
    }

    fn payload(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> Result<Value, ParleyError> {
        build_anthropic_payload(
            &AnthropicRequest {
                model: &self.config.model,
                system_prompt: &self.config.system_prompt,
                max_tokens: self.max_tokens,
                params: &self.config.params,
                stream,
            },
            messages,
            tools,
        )
    }

    fn request(&self, payload: &Value) -> reqwest::RequestBuilder {
        shared_http_client(&self.base_url)
            .post(join_url(&self.base_url, "messages"))
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(payload)
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDescriptor>,
        signal: CancelSignal,
    ) -> ContentStream {
        let payload = match self.payload(&messages, &tools, true) {
            Ok(payload) => payload,
            Err(error) => return failed_stream(error),
        };
        debug!(provider = "anthropic", payload = %payload, "sending chat request");
        let request = self.request(&payload);
        sse_content_stream(
            "Anthropic",
            async move { send_checked(request, "Anthropic").await },
            AnthropicEventParser::default(),
            signal,
        )
    }

    async fn generate_title(&self, text: &str) -> Result<String, ParleyError> {
        let payload = self.payload(&[Message::user_text(text)], &[], false)?;
        let response = send_checked(self.request(&payload), "Anthropic").await?;
        let body: Value = response.json().await.map_err(|error| {
            ParleyError::protocol(format!("Anthropic title response is not JSON: {error}"))
        })?;

        body.get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ParleyError::protocol("Anthropic title response has empty content")
                    .with_details(body.clone())
            })
    }
}
