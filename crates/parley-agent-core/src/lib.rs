//! Conversation orchestration on top of `parley-ai`: persistence contract,
//! tool routing, snapshot fan-out and the streaming tool-use loop.

mod broadcast;
mod chat_service;
mod orchestrator;
mod recovery;
mod store;
mod tool_gateway;

pub use broadcast::{BroadcastEvent, Broadcaster, Subscription, Topic};
pub use chat_service::{ChatService, PromptRequest, SubmitInput, SubmitOutcome};
pub use orchestrator::{ChatLoop, TurnOutcome, TurnState};
pub use recovery::continue_chat;
pub use store::{ChatStore, ChatStoreRef, MemoryStore};
pub use tool_gateway::{
    PromptDescriptor, PromptMessage, ResourceDescriptor, ToolCallOutput, ToolGateway,
    ToolInvocation, ToolProvider, ToolProviderRef, error_payload,
};
