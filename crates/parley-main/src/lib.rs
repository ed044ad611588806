//! Terminal front-end: loads `parley.toml`, submits one prompt and prints
//! the assistant reply as it streams.

pub mod config;
pub mod logging;

use std::io::Write;
use std::sync::Arc;

use parley_agent_core::{
    BroadcastEvent, Broadcaster, ChatService, MemoryStore, SubmitInput, Subscription, ToolGateway,
    Topic, TurnState,
};
use parley_ai::{ParleyError, build_provider, render_markdown};
use thiserror::Error;
use tracing::info;

use crate::config::{AppConfig, ConfigError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Chat(#[from] ParleyError),
    #[error("turn task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("terminal i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What still needs printing to extend `printed` into `markdown`. Snapshots
/// normally only grow; anything else is reprinted whole on a fresh line.
pub fn snapshot_delta(printed: &str, markdown: &str) -> String {
    match markdown.strip_prefix(printed) {
        Some(suffix) => suffix.to_string(),
        None => format!("\n{markdown}"),
    }
}

/// Runs one prompt to completion. Ctrl-C unsubscribes, which cancels the
/// turn; whatever streamed so far is kept.
pub async fn run_prompt(config: AppConfig, prompt: String) -> Result<(), AppError> {
    let provider = build_provider(config.chat)?;
    let title_provider = build_provider(config.title)?;
    let store = Arc::new(MemoryStore::new());
    let service = ChatService::new(
        store,
        Arc::new(ToolGateway::empty()),
        provider,
        title_provider,
        Broadcaster::new(),
    );

    let outcome = service
        .submit(SubmitInput {
            message: prompt,
            ..SubmitInput::default()
        })
        .await?;
    info!(
        chat_id = outcome.chat_id.as_str(),
        message_id = outcome.assistant_message_id.as_str(),
        "prompt submitted"
    );

    let mut subscription = Some(
        service
            .broadcaster()
            .subscribe(Topic::Message(outcome.assistant_message_id.clone())),
    );
    let mut printed = String::new();
    let mut stdout = std::io::stdout();
    let mut turn = outcome.turn;

    let turn_outcome = loop {
        tokio::select! {
            joined = &mut turn => break joined?,
            event = next_event(&mut subscription) => match event {
                Some(BroadcastEvent::Snapshot { markdown, .. }) => {
                    write!(stdout, "{}", snapshot_delta(&printed, &markdown))?;
                    stdout.flush()?;
                    printed = markdown;
                }
                Some(BroadcastEvent::Error { message }) => eprintln!("\nerror: {message}"),
                Some(BroadcastEvent::Chats(_)) => {}
                Some(BroadcastEvent::Close) | None => subscription = None,
            },
            _ = tokio::signal::ctrl_c(), if subscription.is_some() => {
                eprintln!("\ninterrupted");
                subscription = None;
            }
        }
    };

    let markdown = render_markdown(&turn_outcome.message.contents);
    write!(stdout, "{}", snapshot_delta(&printed, &markdown))?;
    writeln!(stdout)?;

    if let Some(title) = outcome.title {
        title.await?;
        let chats = service.store().chats().await?;
        if let Some(chat) = chats.iter().find(|chat| chat.id == outcome.chat_id) {
            if !chat.title.is_empty() {
                eprintln!("[{}]", chat.title);
            }
        }
    }

    match (turn_outcome.state, turn_outcome.error) {
        (TurnState::Fatal, Some(error)) => Err(error.into()),
        _ => Ok(()),
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<BroadcastEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
