use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parley_ai::{Conversation, Message, ParleyError, ParleyErrorCode, new_id};
use tokio::sync::RwLock;

/// Persistence contract for conversations and their messages.
///
/// Implementations must be safe to call concurrently for different chats.
/// Within one chat the loop writes strictly in order.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn chats(&self) -> Result<Vec<Conversation>, ParleyError>;

    /// Stores `chat`, minting an id when it has none, and returns the id.
    async fn add_chat(&self, chat: Conversation) -> Result<String, ParleyError>;

    async fn update_chat(&self, chat: Conversation) -> Result<(), ParleyError>;

    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, ParleyError>;

    async fn add_message(&self, chat_id: &str, message: Message) -> Result<String, ParleyError>;

    /// Replaces the stored message that has the same id.
    async fn update_message(&self, chat_id: &str, message: Message) -> Result<(), ParleyError>;
}

pub type ChatStoreRef = Arc<dyn ChatStore>;

#[derive(Default)]
struct MemoryState {
    chats: Vec<Conversation>,
    messages: HashMap<String, Vec<Message>>,
}

/// Process-local store; contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn chat_not_found(chat_id: &str) -> ParleyError {
    ParleyError::new(ParleyErrorCode::NotFound, format!("chat {chat_id} not found"))
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn chats(&self) -> Result<Vec<Conversation>, ParleyError> {
        Ok(self.state.read().await.chats.clone())
    }

    async fn add_chat(&self, mut chat: Conversation) -> Result<String, ParleyError> {
        if chat.id.is_empty() {
            chat.id = new_id();
        }
        let id = chat.id.clone();
        let mut state = self.state.write().await;
        if state.messages.contains_key(&id) {
            return Err(ParleyError::new(
                ParleyErrorCode::InvalidInput,
                format!("chat {id} already exists"),
            ));
        }
        state.messages.insert(id.clone(), Vec::new());
        state.chats.push(chat);
        Ok(id)
    }

    async fn update_chat(&self, chat: Conversation) -> Result<(), ParleyError> {
        let mut state = self.state.write().await;
        let stored = state
            .chats
            .iter_mut()
            .find(|stored| stored.id == chat.id)
            .ok_or_else(|| chat_not_found(&chat.id))?;
        *stored = chat;
        Ok(())
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, ParleyError> {
        self.state
            .read()
            .await
            .messages
            .get(chat_id)
            .cloned()
            .ok_or_else(|| chat_not_found(chat_id))
    }

    async fn add_message(&self, chat_id: &str, message: Message) -> Result<String, ParleyError> {
        let mut state = self.state.write().await;
        let messages = state
            .messages
            .get_mut(chat_id)
            .ok_or_else(|| chat_not_found(chat_id))?;
        let id = message.id.clone();
        messages.push(message);
        Ok(id)
    }

    async fn update_message(&self, chat_id: &str, message: Message) -> Result<(), ParleyError> {
        let mut state = self.state.write().await;
        let messages = state
            .messages
            .get_mut(chat_id)
            .ok_or_else(|| chat_not_found(chat_id))?;
        let stored = messages
            .iter_mut()
            .find(|stored| stored.id == message.id)
            .ok_or_else(|| {
                ParleyError::new(
                    ParleyErrorCode::NotFound,
                    format!("message {} not found in chat {chat_id}", message.id),
                )
            })?;
        *stored = message;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parley_ai::Content;

    use super::*;

    #[tokio::test]
    async fn messages_keep_insertion_order_and_updates_replace_in_place() {
        let store = MemoryStore::new();
        let chat_id = store
            .add_chat(Conversation::default())
            .await
            .expect("chat added");
        assert!(!chat_id.is_empty());

        let user = Message::user_text("hi");
        let mut assistant = Message::empty_assistant();
        store.add_message(&chat_id, user.clone()).await.expect("user");
        store
            .add_message(&chat_id, assistant.clone())
            .await
            .expect("assistant");

        assistant.contents.push(Content::text("hello"));
        store
            .update_message(&chat_id, assistant.clone())
            .await
            .expect("update");

        let messages = store.messages(&chat_id).await.expect("messages");
        assert_eq!(messages, vec![user, assistant]);
    }

    #[tokio::test]
    async fn unknown_chats_and_messages_are_not_found() {
        let store = MemoryStore::new();
        let error = store.messages("nope").await.expect_err("missing chat");
        assert_eq!(error.code, ParleyErrorCode::NotFound);

        let chat_id = store
            .add_chat(Conversation::default())
            .await
            .expect("chat added");
        let error = store
            .update_message(&chat_id, Message::user_text("never added"))
            .await
            .expect_err("missing message");
        assert_eq!(error.code, ParleyErrorCode::NotFound);
    }

    #[tokio::test]
    async fn titles_are_updated_by_id() {
        let store = MemoryStore::new();
        let chat_id = store
            .add_chat(Conversation::default())
            .await
            .expect("chat added");
        store
            .update_chat(Conversation {
                id: chat_id.clone(),
                title: "Greetings".to_string(),
            })
            .await
            .expect("update");

        let chats = store.chats().await.expect("chats");
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].title, "Greetings");
    }
}
