use std::fmt::{Display, Formatter};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelSignal;
use crate::error::{ParleyError, ParleyErrorCode};
use crate::params::ParameterSet;
use crate::providers;
use crate::types::{Message, ToolDescriptor};

/// Lazy, consumer-pulled sequence of canonical content deltas.
///
/// Dropping the stream releases the underlying connection. A tripped
/// [`CancelSignal`] ends the stream without yielding an error.
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<crate::Content, ParleyError>> + Send>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDescriptor>,
        signal: CancelSignal,
    ) -> ContentStream;

    /// Single-shot, non-streaming completion of `text` under the provider's
    /// system prompt.
    async fn generate_title(&self, text: &str) -> Result<String, ParleyError>;
}

pub type ChatProviderRef = Arc<dyn ChatProvider>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    Anthropic,
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenRouter => "openrouter",
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParleyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            other => Err(ParleyError::new(
                ParleyErrorCode::ProviderConfig,
                format!("unknown provider '{other}'"),
            )),
        }
    }
}

/// Everything an adapter needs, already resolved by the caller.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    /// Host for ollama, API base URL for the others. `None` picks the
    /// provider's public default.
    pub base_url: Option<String>,
    /// `None` falls back to the provider's conventional environment variable.
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub system_prompt: String,
    pub params: ParameterSet,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            base_url: None,
            api_key: None,
            max_tokens: None,
            system_prompt: String::new(),
            params: ParameterSet::default(),
        }
    }
}

/// Picks the adapter for `config.kind`. Selection happens once, by name.
pub fn build_provider(config: ProviderConfig) -> Result<ChatProviderRef, ParleyError> {
    if config.model.trim().is_empty() {
        return Err(ParleyError::new(
            ParleyErrorCode::ProviderConfig,
            format!("{} provider requires a model", config.kind),
        ));
    }

    let provider: ChatProviderRef = match config.kind {
        ProviderKind::Ollama => Arc::new(providers::ollama::OllamaProvider::new(config)),
        ProviderKind::OpenAi => Arc::new(providers::openai::OpenAiProvider::new(config)?),
        ProviderKind::Anthropic => Arc::new(providers::anthropic::AnthropicProvider::new(config)?),
        ProviderKind::OpenRouter => {
            Arc::new(providers::openrouter::OpenRouterProvider::new(config)?)
        }
    };
    Ok(provider)
}
