//! Provider-agnostic streaming chat: the canonical content model, sampling
//! parameters and the adapters that translate them to each provider's wire
//! protocol.

mod cancel;
mod error;
mod params;
mod provider;
mod providers;
mod render;
mod sse;
mod types;

pub use cancel::{CancelController, CancelSignal};
pub use error::{ParleyError, ParleyErrorCode};
pub use params::ParameterSet;
pub use provider::{
    ChatProvider, ChatProviderRef, ContentStream, ProviderConfig, ProviderKind, build_provider,
};
pub use providers::{AnthropicProvider, OllamaProvider, OpenAiProvider, OpenRouterProvider};
pub use render::render_markdown;
pub use types::{
    Content, Conversation, Message, ResourceContents, Role, ToolDescriptor, new_id, now_millis,
    normalize_tool_arguments,
};
