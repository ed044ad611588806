//! Topic-keyed fan-out of rendered snapshots to live observers.
//!
//! Nothing is retained for absent subscribers: an observer that reconnects
//! reads current state from the store instead of replaying events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_ai::{CancelController, Conversation};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Streaming snapshots of one message.
    Message(String),
    /// Changes to the conversation list.
    Chats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    /// Fresh markdown rendering of the whole message.
    Snapshot { message_id: String, markdown: String },
    Error { message: String },
    Chats(Vec<Conversation>),
    /// The turn behind a message topic has finished.
    Close,
}

struct TopicState {
    sender: broadcast::Sender<BroadcastEvent>,
    subscribers: usize,
    cancel: Option<CancelController>,
    generation: u64,
}

/// Topic table. A released topic that gets subscribed again starts a new
/// generation so stale subscriptions cannot touch it.
#[derive(Default)]
struct Topics {
    states: HashMap<Topic, TopicState>,
    next_generation: u64,
}

impl Topics {
    fn entry(&mut self, topic: Topic) -> &mut TopicState {
        let next_generation = &mut self.next_generation;
        self.states.entry(topic).or_insert_with(|| {
            *next_generation += 1;
            let (sender, _) = broadcast::channel(TOPIC_CAPACITY);
            TopicState {
                sender,
                subscribers: 0,
                cancel: None,
                generation: *next_generation,
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    topics: Arc<Mutex<Topics>>,
}

fn lock(topics: &Mutex<Topics>) -> MutexGuard<'_, Topics> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `event` to everyone currently subscribed to `topic` and returns
    /// how many receivers it reached.
    pub fn publish(&self, topic: &Topic, event: BroadcastEvent) -> usize {
        let topics = lock(&self.topics);
        match topics.states.get(topic) {
            Some(state) => state.sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut topics = lock(&self.topics);
        let state = topics.entry(topic.clone());
        state.subscribers += 1;
        let receiver = state.sender.subscribe();
        let generation = state.generation;
        debug!(?topic, subscribers = state.subscribers, "subscribed");
        Subscription {
            topic,
            generation,
            receiver,
            topics: Arc::clone(&self.topics),
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        lock(&self.topics)
            .states
            .get(topic)
            .map_or(0, |state| state.subscribers)
    }

    /// Cancels `controller` once the last subscriber of `topic` goes away.
    /// A topic nobody ever subscribed to never fires.
    pub fn bind_cancel(&self, topic: Topic, controller: CancelController) {
        let mut topics = lock(&self.topics);
        topics.entry(topic).cancel = Some(controller);
    }

    /// Forgets the topic and its cancel binding. Subscribers still attached
    /// drain what was sent and then see the end.
    pub fn release(&self, topic: &Topic) {
        lock(&self.topics).states.remove(topic);
    }
}

/// A live receiver for one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    generation: u64,
    receiver: broadcast::Receiver<BroadcastEvent>,
    topics: Arc<Mutex<Topics>>,
}

impl Subscription {
    /// Next event, or `None` once the topic is released.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = ?self.topic, skipped, "subscriber lagged; snapshots skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = lock(&self.topics);
        let Some(state) = topics
            .states
            .get_mut(&self.topic)
            .filter(|state| state.generation == self.generation)
        else {
            return;
        };
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers > 0 {
            return;
        }
        if let Some(cancel) = state.cancel.take() {
            debug!(topic = ?self.topic, "last subscriber left; cancelling");
            cancel.cancel();
        }
        topics.states.remove(&self.topic);
    }
}
