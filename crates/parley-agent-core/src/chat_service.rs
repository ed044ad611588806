use std::collections::BTreeMap;
use std::sync::Arc;

use parley_ai::{
    CancelController, ChatProviderRef, Conversation, Message, ParleyError, ParleyErrorCode, Role,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastEvent, Broadcaster, Topic};
use crate::orchestrator::{ChatLoop, TurnOutcome};
use crate::recovery::continue_chat;
use crate::store::ChatStoreRef;
use crate::tool_gateway::ToolGateway;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptRequest {
    pub name: String,
    pub arguments: BTreeMap<String, String>,
}

/// One user submission. Either `message` or `prompt` supplies the text;
/// attached resource URIs ride on the last user message.
#[derive(Debug, Clone, Default)]
pub struct SubmitInput {
    /// Existing chat to continue; `None` starts a new one.
    pub chat_id: Option<String>,
    pub message: String,
    pub prompt: Option<PromptRequest>,
    pub attached_resources: Vec<String>,
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub chat_id: String,
    pub added_message_ids: Vec<String>,
    pub assistant_message_id: String,
    /// The running turn.
    pub turn: JoinHandle<TurnOutcome>,
    /// Title generation, spawned for new chats only.
    pub title: Option<JoinHandle<()>>,
}

/// Front door for chat submissions: resolves the conversation, stores the
/// user input and starts the turn in the background.
#[derive(Clone)]
pub struct ChatService {
    store: ChatStoreRef,
    gateway: Arc<ToolGateway>,
    title_provider: ChatProviderRef,
    broadcaster: Broadcaster,
    chat_loop: ChatLoop,
}

impl ChatService {
    pub fn new(
        store: ChatStoreRef,
        gateway: Arc<ToolGateway>,
        provider: ChatProviderRef,
        title_provider: ChatProviderRef,
        broadcaster: Broadcaster,
    ) -> Self {
        let chat_loop = ChatLoop::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            provider,
            broadcaster.clone(),
        );
        Self {
            store,
            gateway,
            title_provider,
            broadcaster,
            chat_loop,
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn store(&self) -> &ChatStoreRef {
        &self.store
    }

    pub async fn submit(&self, input: SubmitInput) -> Result<SubmitOutcome, ParleyError> {
        let added = self.input_messages(&input).await?;

        let (chat_id, is_new) = match input.chat_id.filter(|id| !id.trim().is_empty()) {
            Some(chat_id) => {
                self.ensure_chat(&chat_id).await?;
                continue_chat(self.store.as_ref(), &self.gateway, &chat_id).await?;
                (chat_id, false)
            }
            None => {
                let chat_id = self.store.add_chat(Conversation::default()).await?;
                info!(chat_id = chat_id.as_str(), "chat created");
                publish_chats(&self.store, &self.broadcaster).await;
                (chat_id, true)
            }
        };

        let mut added_message_ids = Vec::with_capacity(added.len());
        for message in &added {
            added_message_ids.push(self.store.add_message(&chat_id, message.clone()).await?);
        }
        let transcript = self.store.messages(&chat_id).await?;

        let assistant = Message::empty_assistant();
        let assistant_message_id = self.store.add_message(&chat_id, assistant.clone()).await?;

        let controller = CancelController::new();
        self.broadcaster.bind_cancel(
            Topic::Message(assistant_message_id.clone()),
            controller.clone(),
        );
        let turn = {
            let chat_loop = self.chat_loop.clone();
            let chat_id = chat_id.clone();
            tokio::spawn(async move {
                chat_loop
                    .run_turn(&chat_id, transcript, assistant, controller.signal())
                    .await
            })
        };

        let title = if is_new {
            added
                .iter()
                .filter(|message| message.role == Role::User)
                .find_map(|message| message.first_text())
                .map(|text| self.spawn_title(chat_id.clone(), text.to_string()))
        } else {
            None
        };

        Ok(SubmitOutcome {
            chat_id,
            added_message_ids,
            assistant_message_id,
            turn,
            title,
        })
    }

    /// Regenerates the title from the chat's first user text.
    pub async fn refresh_title(&self, chat_id: &str) -> Result<String, ParleyError> {
        let messages = self.store.messages(chat_id).await?;
        let text = messages
            .iter()
            .filter(|message| message.role == Role::User)
            .find_map(|message| message.first_text())
            .ok_or_else(|| {
                ParleyError::new(
                    ParleyErrorCode::InvalidInput,
                    format!("chat {chat_id} has no user text to title"),
                )
            })?
            .to_string();
        retitle(
            &self.store,
            &self.title_provider,
            &self.broadcaster,
            chat_id,
            &text,
        )
        .await
    }

    async fn input_messages(&self, input: &SubmitInput) -> Result<Vec<Message>, ParleyError> {
        let mut messages = match &input.prompt {
            Some(prompt) => {
                self.gateway
                    .prompt_messages(&prompt.name, &prompt.arguments)
                    .await?
            }
            None if !input.message.is_empty() => vec![Message::user_text(&input.message)],
            None => Vec::new(),
        };

        if !input.attached_resources.is_empty() {
            let resource = self
                .gateway
                .read_resources(&input.attached_resources)
                .await?;
            match messages.last_mut() {
                Some(last) if last.role == Role::User => last.contents.push(resource),
                _ => messages.push(Message::new(Role::User, vec![resource])),
            }
        }

        if messages.is_empty() {
            return Err(ParleyError::new(
                ParleyErrorCode::InvalidInput,
                "nothing to submit: message, prompt and resources are all empty",
            ));
        }
        Ok(messages)
    }

    async fn ensure_chat(&self, chat_id: &str) -> Result<(), ParleyError> {
        let chats = self.store.chats().await?;
        if chats.iter().any(|chat| chat.id == chat_id) {
            Ok(())
        } else {
            Err(ParleyError::new(
                ParleyErrorCode::NotFound,
                format!("chat {chat_id} not found"),
            ))
        }
    }

    fn spawn_title(&self, chat_id: String, text: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let provider = Arc::clone(&self.title_provider);
        let broadcaster = self.broadcaster.clone();
        tokio::spawn(async move {
            if let Err(error) = retitle(&store, &provider, &broadcaster, &chat_id, &text).await {
                warn!(chat_id = chat_id.as_str(), error = %error, "title generation failed");
            }
        })
    }
}

async fn retitle(
    store: &ChatStoreRef,
    provider: &ChatProviderRef,
    broadcaster: &Broadcaster,
    chat_id: &str,
    text: &str,
) -> Result<String, ParleyError> {
    let title = provider.generate_title(text).await?.trim().to_string();
    store
        .update_chat(Conversation {
            id: chat_id.to_string(),
            title: title.clone(),
        })
        .await?;
    debug!(chat_id, title = title.as_str(), "title updated");
    publish_chats(store, broadcaster).await;
    Ok(title)
}

async fn publish_chats(store: &ChatStoreRef, broadcaster: &Broadcaster) {
    match store.chats().await {
        Ok(chats) => {
            broadcaster.publish(&Topic::Chats, BroadcastEvent::Chats(chats));
        }
        Err(error) => warn!(error = %error, "failed to load chats for broadcast"),
    }
}
