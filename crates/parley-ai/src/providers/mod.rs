pub(crate) mod anthropic;
pub(crate) mod common;
pub(crate) mod ollama;
pub(crate) mod openai;
pub(crate) mod openrouter;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;
