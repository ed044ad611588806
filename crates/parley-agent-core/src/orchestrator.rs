use std::sync::Arc;

use futures_util::StreamExt;
use parley_ai::{
    CancelSignal, ChatProviderRef, Content, Message, ParleyError, ParleyErrorCode, render_markdown,
};
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::broadcast::{BroadcastEvent, Broadcaster, Topic};
use crate::store::ChatStoreRef;
use crate::tool_gateway::{ToolGateway, ToolInvocation};

/// Where a turn currently is. `Completed` and `Fatal` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Streaming,
    ToolCallDetected,
    Invoking,
    ResultAppended,
    Completed,
    Fatal,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Fatal)
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// The assistant message as last persisted.
    pub message: Message,
    pub error: Option<ParleyError>,
    /// Number of provider streaming passes the turn made.
    pub passes: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Everything a turn needs: where to persist, where to call tools, which
/// model to stream from and where to publish snapshots.
#[derive(Clone)]
pub struct ChatLoop {
    store: ChatStoreRef,
    gateway: Arc<ToolGateway>,
    provider: ChatProviderRef,
    broadcaster: Broadcaster,
}

impl ChatLoop {
    pub fn new(
        store: ChatStoreRef,
        gateway: Arc<ToolGateway>,
        provider: ChatProviderRef,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            store,
            gateway,
            provider,
            broadcaster,
        }
    }

    /// Streams the assistant reply to `transcript` into `assistant`, invoking
    /// tools until a streaming pass produces no tool call. `assistant` must
    /// already be stored. A close event is published on the message topic
    /// whatever the outcome.
    pub async fn run_turn(
        &self,
        chat_id: &str,
        transcript: Vec<Message>,
        assistant: Message,
        signal: CancelSignal,
    ) -> TurnOutcome {
        let topic = Topic::Message(assistant.id.clone());
        let outcome = TurnRunner {
            chat: self,
            chat_id,
            topic: topic.clone(),
            transcript,
            assistant,
            signal,
            state: TurnState::Streaming,
            pending: None,
            passes: 0,
        }
        .run()
        .await;

        self.broadcaster.publish(&topic, BroadcastEvent::Close);
        self.broadcaster.release(&topic);
        outcome
    }
}

struct TurnRunner<'a> {
    chat: &'a ChatLoop,
    chat_id: &'a str,
    topic: Topic,
    transcript: Vec<Message>,
    assistant: Message,
    signal: CancelSignal,
    state: TurnState,
    pending: Option<PendingCall>,
    passes: usize,
}

impl TurnRunner<'_> {
    async fn run(mut self) -> TurnOutcome {
        let mut failure = None;
        while !self.state.is_terminal() {
            let step = match self.state {
                TurnState::Streaming => self.stream_pass().await,
                TurnState::ToolCallDetected => self.record_tool_call().await,
                TurnState::Invoking => self.invoke_tool().await,
                TurnState::ResultAppended => Ok(self.after_result()),
                TurnState::Completed | TurnState::Fatal => break,
            };
            let step = match step {
                Err(cause) if !cause.code.is_fatal_for_turn() => {
                    self.answer_failed_call(cause).await
                }
                other => other,
            };
            match step {
                Ok(next) => self.state = next,
                Err(cause) => {
                    error!(
                        chat_id = self.chat_id,
                        message_id = self.assistant.id.as_str(),
                        error = %cause,
                        "turn failed"
                    );
                    self.chat.broadcaster.publish(
                        &self.topic,
                        BroadcastEvent::Error {
                            message: cause.message.clone(),
                        },
                    );
                    failure = Some(cause);
                    self.state = TurnState::Fatal;
                }
            }
        }

        TurnOutcome {
            state: self.state,
            message: self.assistant,
            error: failure,
            passes: self.passes,
            cancelled: self.signal.is_cancelled(),
        }
    }

    async fn stream_pass(&mut self) -> Result<TurnState, ParleyError> {
        self.passes += 1;
        let mut messages = self.transcript.clone();
        if !self.assistant.contents.is_empty() {
            messages.push(self.assistant.clone());
        }
        debug!(
            chat_id = self.chat_id,
            message_id = self.assistant.id.as_str(),
            pass = self.passes,
            "streaming"
        );

        let mut stream = self.chat.provider.chat(
            messages,
            self.chat.gateway.catalog().to_vec(),
            self.signal.clone(),
        );
        while let Some(item) = stream.next().await {
            match item? {
                Content::Text { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    self.append_text(&text);
                    self.checkpoint().await?;
                }
                Content::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    self.pending = Some(PendingCall {
                        id,
                        name,
                        arguments,
                    });
                    return Ok(TurnState::ToolCallDetected);
                }
                other => {
                    warn!(
                        message_id = self.assistant.id.as_str(),
                        kind = other.kind(),
                        "provider yielded content an assistant cannot author; ignoring"
                    );
                }
            }
        }

        if self.signal.is_cancelled() {
            debug!(message_id = self.assistant.id.as_str(), "turn cancelled");
        }
        Ok(TurnState::Completed)
    }

    /// The open text item keeps growing until something else follows it.
    fn append_text(&mut self, delta: &str) {
        if let Some(Content::Text { text }) = self.assistant.contents.last_mut() {
            text.push_str(delta);
        } else {
            self.assistant.contents.push(Content::text(delta));
        }
    }

    /// Stores the call. Unparseable arguments are stored as `{}` and reported
    /// as `ToolArgumentsInvalid`, which the loop answers with a failed result.
    async fn record_tool_call(&mut self) -> Result<TurnState, ParleyError> {
        let Some(call) = self.pending.clone() else {
            return Ok(TurnState::Streaming);
        };

        if serde_json::from_str::<Value>(&call.arguments).is_err() {
            self.pending = None;
            self.assistant
                .contents
                .push(Content::tool_call(call.id, call.name, "{}"));
            self.checkpoint().await?;
            return Err(ParleyError::new(
                ParleyErrorCode::ToolArgumentsInvalid,
                format!("tool input {} is not valid json", call.arguments),
            ));
        }

        self.assistant.contents.push(Content::ToolCall {
            id: call.id,
            name: call.name,
            arguments: call.arguments,
        });
        self.checkpoint().await?;
        if self.signal.is_cancelled() {
            // Left unresolved on purpose; continuation picks it up.
            return Ok(TurnState::Completed);
        }
        Ok(TurnState::Invoking)
    }

    async fn invoke_tool(&mut self) -> Result<TurnState, ParleyError> {
        let Some(call) = self.pending.take() else {
            return Ok(TurnState::Streaming);
        };
        debug!(
            chat_id = self.chat_id,
            tool_name = call.name.as_str(),
            call_id = call.id.as_str(),
            "invoking tool"
        );
        let invocation = self
            .chat
            .gateway
            .try_invoke(&call.name, &call.arguments)
            .await?;
        self.append_result(&call.id, invocation).await?;
        Ok(TurnState::ResultAppended)
    }

    /// Tool-coded failures never end the turn: the open call gets a failed
    /// result carrying the error text so the model can react to it.
    async fn answer_failed_call(&mut self, cause: ParleyError) -> Result<TurnState, ParleyError> {
        let Some((call_id, name, _)) = self.assistant.pending_tool_call() else {
            return Err(cause);
        };
        let call_id = call_id.to_string();
        warn!(
            chat_id = self.chat_id,
            tool_name = name,
            code = ?cause.code,
            error = %cause,
            "tool call failed; answering the model with the error"
        );
        self.append_result(&call_id, ToolInvocation::failed(&cause.message))
            .await?;
        Ok(TurnState::ResultAppended)
    }

    async fn append_result(
        &mut self,
        call_id: &str,
        invocation: ToolInvocation,
    ) -> Result<(), ParleyError> {
        self.assistant.contents.push(Content::tool_result(
            call_id,
            invocation.result,
            !invocation.success,
        ));
        self.checkpoint().await
    }

    fn after_result(&self) -> TurnState {
        if self.signal.is_cancelled() {
            TurnState::Completed
        } else {
            TurnState::Streaming
        }
    }

    /// Persists the whole assistant message and publishes its rendering.
    async fn checkpoint(&mut self) -> Result<(), ParleyError> {
        self.chat
            .store
            .update_message(self.chat_id, self.assistant.clone())
            .await
            .map_err(|cause| {
                ParleyError::persistence(format!("failed to persist message: {}", cause.message))
                    .with_details(json!({ "code": cause.code }))
            })?;
        self.chat.broadcaster.publish(
            &self.topic,
            BroadcastEvent::Snapshot {
                message_id: self.assistant.id.clone(),
                markdown: render_markdown(&self.assistant.contents),
            },
        );
        Ok(())
    }
}
