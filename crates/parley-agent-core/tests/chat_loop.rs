use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use parley_agent_core::{
    BroadcastEvent, Broadcaster, ChatLoop, ChatService, ChatStore, ChatStoreRef, MemoryStore,
    PromptDescriptor, PromptMessage, PromptRequest, ResourceDescriptor, SubmitInput,
    ToolCallOutput, ToolGateway, ToolProvider, ToolProviderRef, Topic, TurnState, continue_chat,
};
use parley_ai::{
    CancelSignal, ChatProvider, ChatProviderRef, Content, ContentStream, Conversation, Message,
    ParleyError, ParleyErrorCode, ResourceContents, Role, ToolDescriptor,
};
use serde_json::{Value, json};
use tokio::time::timeout;

type Pass = Vec<Result<Content, ParleyError>>;

/// Replays one scripted pass per `chat` call and records every transcript.
struct ScriptedProvider {
    passes: Mutex<VecDeque<Pass>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    fn new(passes: Vec<Pass>) -> Arc<Self> {
        Arc::new(Self {
            passes: Mutex::new(passes.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn transcripts(&self) -> Vec<Vec<Message>> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn chat(
        &self,
        messages: Vec<Message>,
        _tools: Vec<ToolDescriptor>,
        _signal: CancelSignal,
    ) -> ContentStream {
        self.seen.lock().expect("seen lock").push(messages);
        let pass = self
            .passes
            .lock()
            .expect("passes lock")
            .pop_front()
            .unwrap_or_default();
        Box::pin(stream::iter(pass))
    }

    async fn generate_title(&self, text: &str) -> Result<String, ParleyError> {
        Ok(format!("  About {text}  "))
    }
}

/// Yields one text delta, then waits until the turn is cancelled.
struct StallingProvider;

#[async_trait]
impl ChatProvider for StallingProvider {
    fn chat(
        &self,
        _messages: Vec<Message>,
        _tools: Vec<ToolDescriptor>,
        signal: CancelSignal,
    ) -> ContentStream {
        let first = stream::iter(vec![Ok(Content::text("partial"))]);
        let rest = stream::once(async move {
            signal.cancelled().await;
            None::<Result<Content, ParleyError>>
        })
        .filter_map(futures_util::future::ready);
        Box::pin(first.chain(rest))
    }

    async fn generate_title(&self, _text: &str) -> Result<String, ParleyError> {
        Err(ParleyError::transport("titles are not scripted"))
    }
}

struct FakeTools {
    name: &'static str,
    tools: Vec<&'static str>,
    fail: bool,
    calls: AtomicUsize,
    last_arguments: Mutex<Option<Value>>,
}

impl FakeTools {
    fn new(name: &'static str, tools: Vec<&'static str>, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            tools,
            fail,
            calls: AtomicUsize::new(0),
            last_arguments: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolProvider for FakeTools {
    fn name(&self) -> &str {
        self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ParleyError> {
        Ok(self
            .tools
            .iter()
            .map(|name| ToolDescriptor {
                name: name.to_string(),
                description: format!("{name} from {}", self.name),
                input_schema: json!({"type":"object","properties":{"q":{"type":"string"}}}),
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ParleyError> {
        Ok(vec![ResourceDescriptor {
            uri: "file:///notes.txt".to_string(),
            name: "notes".to_string(),
            mime_type: Some("text/plain".to_string()),
        }])
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, ParleyError> {
        Ok(vec![
            PromptDescriptor {
                name: "greet".to_string(),
                description: "greets someone".to_string(),
                arguments: vec!["who".to_string()],
            },
            PromptDescriptor {
                name: "persona".to_string(),
                description: "greets someone in character".to_string(),
                arguments: vec!["who".to_string()],
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutput, ParleyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_arguments.lock().expect("args lock") = Some(arguments);
        if self.fail {
            return Err(ParleyError::new(
                ParleyErrorCode::ToolExecutionFailed,
                "lookup backend down",
            ));
        }
        Ok(ToolCallOutput {
            content: vec![json!({"type":"text","text": format!("{} answered {name}", self.name)})],
            is_error: false,
        })
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, ParleyError> {
        Ok(vec![ResourceContents {
            uri: uri.to_string(),
            mime_type: Some("text/plain".to_string()),
            text: Some("remember the milk".to_string()),
            blob: None,
        }])
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> Result<Vec<PromptMessage>, ParleyError> {
        let who = arguments.get("who").cloned().unwrap_or_default();
        let mut messages = Vec::new();
        if name == "persona" {
            messages.push(PromptMessage {
                role: Role::Assistant,
                text: "I only speak in rhymes".to_string(),
            });
        }
        messages.push(PromptMessage {
            role: Role::User,
            text: format!("Say hi to {who}"),
        });
        Ok(messages)
    }
}

/// Accepts chats and messages but refuses every message update.
#[derive(Default)]
struct ReadOnlyStore {
    inner: MemoryStore,
}

#[async_trait]
impl ChatStore for ReadOnlyStore {
    async fn chats(&self) -> Result<Vec<Conversation>, ParleyError> {
        self.inner.chats().await
    }

    async fn add_chat(&self, chat: Conversation) -> Result<String, ParleyError> {
        self.inner.add_chat(chat).await
    }

    async fn update_chat(&self, chat: Conversation) -> Result<(), ParleyError> {
        self.inner.update_chat(chat).await
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, ParleyError> {
        self.inner.messages(chat_id).await
    }

    async fn add_message(&self, chat_id: &str, message: Message) -> Result<String, ParleyError> {
        self.inner.add_message(chat_id, message).await
    }

    async fn update_message(&self, _chat_id: &str, _message: Message) -> Result<(), ParleyError> {
        Err(ParleyError::persistence("disk full"))
    }
}

async fn gateway(providers: Vec<Arc<FakeTools>>) -> Arc<ToolGateway> {
    let providers = providers
        .into_iter()
        .map(|provider| provider as ToolProviderRef)
        .collect();
    Arc::new(ToolGateway::build(providers).await.expect("gateway builds"))
}

fn service(
    store: ChatStoreRef,
    gateway: Arc<ToolGateway>,
    provider: ChatProviderRef,
) -> ChatService {
    ChatService::new(
        store,
        gateway,
        Arc::clone(&provider),
        provider,
        Broadcaster::new(),
    )
}

fn submit_text(text: &str) -> SubmitInput {
    SubmitInput {
        message: text.to_string(),
        ..SubmitInput::default()
    }
}

/// Every tool call is answered by its own result, except possibly the last
/// content item.
fn assert_calls_resolved(contents: &[Content]) {
    for (position, content) in contents.iter().enumerate() {
        if let Content::ToolCall { id, .. } = content {
            match contents.get(position + 1) {
                None => {}
                Some(Content::ToolResult { call_id, .. }) => assert_eq!(call_id, id),
                Some(other) => panic!("tool call {id} followed by {other}"),
            }
        }
    }
}

#[tokio::test]
async fn hello_creates_a_chat_and_streams_text_into_one_item() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new(vec![vec![
        Ok(Content::text("Hel")),
        Ok(Content::text("lo")),
        Ok(Content::text(" there")),
    ]]);
    let service = service(Arc::clone(&store), gateway(vec![]).await, provider.clone());

    let outcome = service.submit(submit_text("Hello")).await.expect("submitted");
    let turn = outcome.turn.await.expect("turn joins");
    assert_eq!(turn.state, TurnState::Completed);
    assert_eq!(turn.passes, 1);
    assert!(turn.error.is_none());

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].contents, vec![Content::text("Hello")]);
    assert_eq!(outcome.added_message_ids, vec![messages[0].id.clone()]);
    assert_eq!(messages[1].id, outcome.assistant_message_id);
    assert_eq!(messages[1].contents, vec![Content::text("Hello there")]);

    let transcripts = provider.transcripts();
    assert_eq!(transcripts.len(), 1);
    assert_eq!(transcripts[0].len(), 1, "empty assistant message is not sent");

    outcome
        .title
        .expect("new chats get a title")
        .await
        .expect("title task joins");
    let chats = store.chats().await.expect("chats");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].title, "About Hello");
}

#[tokio::test]
async fn failed_lookup_is_persisted_and_the_loop_streams_again() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let tools = FakeTools::new("search", vec!["lookup"], true);
    let provider = ScriptedProvider::new(vec![
        vec![
            Ok(Content::text("Let me check.")),
            Ok(Content::tool_call("call_1", "lookup", r#"{"q":"x"}"#)),
        ],
        vec![Ok(Content::text("The lookup failed."))],
    ]);
    let service = service(
        Arc::clone(&store),
        gateway(vec![tools.clone()]).await,
        provider.clone(),
    );

    let outcome = service.submit(submit_text("find x")).await.expect("submitted");
    let turn = outcome.turn.await.expect("turn joins");
    assert_eq!(turn.state, TurnState::Completed);
    assert_eq!(turn.passes, 2);
    assert_eq!(tools.calls(), 1);
    assert_eq!(
        *tools.last_arguments.lock().expect("args"),
        Some(json!({"q":"x"}))
    );

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    let contents = &messages[1].contents;
    assert_eq!(contents.len(), 4);
    assert_eq!(contents[0], Content::text("Let me check."));
    assert_eq!(contents[1], Content::tool_call("call_1", "lookup", r#"{"q":"x"}"#));
    match &contents[2] {
        Content::ToolResult {
            call_id,
            result,
            failed,
        } => {
            assert_eq!(call_id, "call_1");
            assert!(*failed);
            assert!(result.contains("lookup backend down"), "{result}");
        }
        other => panic!("expected tool result, got {other}"),
    }
    assert_eq!(contents[3], Content::text("The lookup failed."));
    assert_calls_resolved(contents);

    let transcripts = provider.transcripts();
    let second_pass_tail = transcripts[1].last().expect("assistant message sent");
    assert_eq!(second_pass_tail.role, Role::Assistant);
    assert!(matches!(
        second_pass_tail.contents.last(),
        Some(Content::ToolResult { failed: true, .. })
    ));
}

#[tokio::test]
async fn invalid_tool_arguments_never_reach_the_gateway() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let tools = FakeTools::new("search", vec!["lookup"], false);
    let provider = ScriptedProvider::new(vec![
        vec![Ok(Content::tool_call("call_1", "lookup", "not-json"))],
        vec![Ok(Content::text("retrying"))],
    ]);
    let service = service(
        Arc::clone(&store),
        gateway(vec![tools.clone()]).await,
        provider,
    );

    let outcome = service.submit(submit_text("find x")).await.expect("submitted");
    let turn = outcome.turn.await.expect("turn joins");
    assert_eq!(turn.state, TurnState::Completed);
    assert!(turn.error.is_none(), "{:?}", turn.error);
    assert_eq!(tools.calls(), 0);

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    let contents = &messages[1].contents;
    assert_eq!(contents[0], Content::tool_call("call_1", "lookup", "{}"));
    match &contents[1] {
        Content::ToolResult {
            call_id,
            result,
            failed,
        } => {
            assert_eq!(call_id, "call_1");
            assert!(*failed);
            assert!(result.contains("not valid json"), "{result}");
        }
        other => panic!("expected tool result, got {other}"),
    }
    assert_eq!(contents[2], Content::text("retrying"));
}

#[tokio::test]
async fn continuation_resolves_a_trailing_call_exactly_once() {
    let store = MemoryStore::new();
    let tools = FakeTools::new("search", vec!["lookup"], false);
    let gateway = gateway(vec![tools.clone()]).await;

    let chat_id = store
        .add_chat(Conversation::default())
        .await
        .expect("chat");
    store
        .add_message(&chat_id, Message::user_text("find x"))
        .await
        .expect("user");
    let mut assistant = Message::empty_assistant();
    assistant.contents = vec![
        Content::text("checking"),
        Content::tool_call("call_9", "lookup", r#"{"q":"x"}"#),
    ];
    store
        .add_message(&chat_id, assistant.clone())
        .await
        .expect("assistant");

    let repaired = continue_chat(&store, &gateway, &chat_id)
        .await
        .expect("continues")
        .expect("call resolved");
    assert_eq!(repaired.id, assistant.id);
    match repaired.contents.last() {
        Some(Content::ToolResult {
            call_id,
            result,
            failed,
        }) => {
            assert_eq!(call_id, "call_9");
            assert!(!failed);
            let payload: Value = serde_json::from_str(result).expect("result is json");
            assert_eq!(payload, json!([{"type":"text","text":"search answered lookup"}]));
        }
        other => panic!("expected tool result, got {other:?}"),
    }

    let second = continue_chat(&store, &gateway, &chat_id)
        .await
        .expect("continues");
    assert!(second.is_none());
    assert_eq!(tools.calls(), 1);

    let stored = store.messages(&chat_id).await.expect("messages");
    assert_eq!(stored[1], repaired);
    assert_calls_resolved(&stored[1].contents);
}

#[tokio::test]
async fn continuation_ignores_chats_without_a_pending_call() {
    let store = MemoryStore::new();
    let gateway = gateway(vec![]).await;
    let chat_id = store
        .add_chat(Conversation::default())
        .await
        .expect("chat");
    assert!(
        continue_chat(&store, &gateway, &chat_id)
            .await
            .expect("empty chat")
            .is_none()
    );

    store
        .add_message(&chat_id, Message::user_text("hi"))
        .await
        .expect("user");
    assert!(
        continue_chat(&store, &gateway, &chat_id)
            .await
            .expect("user tail")
            .is_none()
    );

    store
        .add_message(&chat_id, Message::empty_assistant())
        .await
        .expect("assistant");
    assert!(
        continue_chat(&store, &gateway, &chat_id)
            .await
            .expect("empty assistant")
            .is_none()
    );
}

#[tokio::test]
async fn submitting_to_an_interrupted_chat_repairs_it_before_streaming() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let tools = FakeTools::new("search", vec!["lookup"], false);
    let provider = ScriptedProvider::new(vec![vec![Ok(Content::text("ok"))]]);
    let service = service(
        Arc::clone(&store),
        gateway(vec![tools.clone()]).await,
        provider.clone(),
    );

    let chat_id = store
        .add_chat(Conversation::default())
        .await
        .expect("chat");
    store
        .add_message(&chat_id, Message::user_text("find x"))
        .await
        .expect("user");
    let mut interrupted = Message::empty_assistant();
    interrupted.contents = vec![Content::tool_call("call_1", "lookup", r#"{"q":"x"}"#)];
    store
        .add_message(&chat_id, interrupted)
        .await
        .expect("assistant");

    let outcome = service
        .submit(SubmitInput {
            chat_id: Some(chat_id.clone()),
            message: "and y?".to_string(),
            ..SubmitInput::default()
        })
        .await
        .expect("submitted");
    assert!(outcome.title.is_none());
    outcome.turn.await.expect("turn joins");
    assert_eq!(tools.calls(), 1);

    let transcript = &provider.transcripts()[0];
    assert_eq!(transcript.len(), 3);
    assert!(matches!(
        transcript[1].contents.last(),
        Some(Content::ToolResult { failed: false, .. })
    ));
    assert_eq!(transcript[2].contents, vec![Content::text("and y?")]);
}

#[tokio::test]
async fn first_registered_provider_owns_a_shared_tool_name() {
    let alpha = FakeTools::new("alpha", vec!["lookup", "fetch"], false);
    let beta = FakeTools::new("beta", vec!["lookup", "write"], false);
    let gateway = gateway(vec![alpha.clone(), beta.clone()]).await;

    let names: Vec<&str> = gateway
        .catalog()
        .iter()
        .map(|tool| tool.name.as_str())
        .collect();
    assert_eq!(names, vec!["lookup", "fetch", "write"]);
    assert_eq!(gateway.catalog()[0].description, "lookup from alpha");

    let invocation = gateway.invoke("lookup", "{}").await;
    assert!(invocation.success);
    assert!(invocation.result.contains("alpha answered lookup"));
    assert_eq!(alpha.calls(), 1);
    assert_eq!(beta.calls(), 0);

    let invocation = gateway.invoke("write", "{}").await;
    assert!(invocation.result.contains("beta answered write"));
}

#[tokio::test]
async fn gateway_failures_become_error_payloads() {
    let tools = FakeTools::new("search", vec!["lookup"], true);
    let gateway = gateway(vec![tools]).await;

    let missing = gateway.invoke("nope", "{}").await;
    assert!(!missing.success);
    let payload: Value = serde_json::from_str(&missing.result).expect("payload is json");
    assert_eq!(payload[0]["text"], "tool nope is not found");

    let failed = gateway.invoke("lookup", r#"{"q":"x"}"#).await;
    assert!(!failed.success);
    let payload: Value = serde_json::from_str(&failed.result).expect("payload is json");
    assert_eq!(payload[0]["text"], "tool call failed: lookup backend down");

    let coded = gateway
        .try_invoke("lookup", r#"{"q":"x"}"#)
        .await
        .expect_err("backend failure");
    assert_eq!(coded.code, ParleyErrorCode::ToolExecutionFailed);
    assert!(!coded.code.is_fatal_for_turn());

    let coded = gateway
        .try_invoke("lookup", "{oops")
        .await
        .expect_err("bad arguments");
    assert_eq!(coded.code, ParleyErrorCode::ToolArgumentsInvalid);
}

#[tokio::test]
async fn calls_to_unknown_tools_are_answered_and_the_turn_goes_on() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let tools = FakeTools::new("search", vec!["lookup"], false);
    let provider = ScriptedProvider::new(vec![
        vec![Ok(Content::tool_call("call_1", "vanished", "{}"))],
        vec![Ok(Content::text("that tool is gone"))],
    ]);
    let service = service(
        Arc::clone(&store),
        gateway(vec![tools.clone()]).await,
        provider,
    );

    let outcome = service.submit(submit_text("use it")).await.expect("submitted");
    let turn = outcome.turn.await.expect("turn joins");
    assert_eq!(turn.state, TurnState::Completed);
    assert!(turn.error.is_none(), "{:?}", turn.error);
    assert_eq!(turn.passes, 2);
    assert_eq!(tools.calls(), 0);

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    let contents = &messages[1].contents;
    assert_eq!(contents.len(), 3);
    match &contents[1] {
        Content::ToolResult { result, failed, .. } => {
            assert!(*failed);
            assert!(result.contains("tool vanished is not found"), "{result}");
        }
        other => panic!("expected tool result, got {other}"),
    }
    assert_eq!(contents[2], Content::text("that tool is gone"));
    assert_calls_resolved(contents);
}

#[tokio::test]
async fn prompts_and_resources_build_the_user_message() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let tools = FakeTools::new("notes", vec![], false);
    let provider = ScriptedProvider::new(vec![vec![Ok(Content::text("Hi Ada!"))]]);
    let service = service(
        Arc::clone(&store),
        gateway(vec![tools]).await,
        provider.clone(),
    );

    let outcome = service
        .submit(SubmitInput {
            prompt: Some(PromptRequest {
                name: "greet".to_string(),
                arguments: BTreeMap::from([("who".to_string(), "Ada".to_string())]),
            }),
            attached_resources: vec!["file:///notes.txt".to_string()],
            ..SubmitInput::default()
        })
        .await
        .expect("submitted");
    outcome.turn.await.expect("turn joins");

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    assert_eq!(messages[0].contents[0], Content::text("Say hi to Ada"));
    match &messages[0].contents[1] {
        Content::Resource { resources } => {
            assert_eq!(resources[0].text.as_deref(), Some("remember the milk"));
        }
        other => panic!("expected resource, got {other}"),
    }
}

#[tokio::test]
async fn new_chat_titles_come_from_user_text_only() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new(vec![vec![Ok(Content::text("Hi Ada, in rhyme"))]]);
    let service = service(
        Arc::clone(&store),
        gateway(vec![FakeTools::new("notes", vec![], false)]).await,
        provider,
    );

    let outcome = service
        .submit(SubmitInput {
            prompt: Some(PromptRequest {
                name: "persona".to_string(),
                arguments: BTreeMap::from([("who".to_string(), "Ada".to_string())]),
            }),
            ..SubmitInput::default()
        })
        .await
        .expect("submitted");
    outcome.turn.await.expect("turn joins");

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    assert_eq!(messages[0].role, Role::Assistant);
    assert_eq!(messages[1].role, Role::User);

    outcome
        .title
        .expect("new chats get a title")
        .await
        .expect("title task joins");
    let chats = store.chats().await.expect("chats");
    assert_eq!(chats[0].title, "About Say hi to Ada");
}

#[tokio::test]
async fn empty_submissions_and_unknown_resources_are_rejected() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new(vec![]);
    let service = service(Arc::clone(&store), gateway(vec![]).await, provider);

    let error = service
        .submit(SubmitInput::default())
        .await
        .expect_err("empty input");
    assert_eq!(error.code, ParleyErrorCode::InvalidInput);

    let error = service
        .submit(SubmitInput {
            message: "look".to_string(),
            attached_resources: vec!["file:///missing".to_string()],
            ..SubmitInput::default()
        })
        .await
        .expect_err("unknown resource");
    assert_eq!(error.message, "resource not found: file:///missing");

    assert!(store.chats().await.expect("chats").is_empty());
}

#[tokio::test]
async fn the_loop_publishes_a_snapshot_per_delta_then_closes() {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Broadcaster::new();
    let provider = ScriptedProvider::new(vec![vec![
        Ok(Content::text("Hel")),
        Ok(Content::text("lo")),
    ]]);
    let chat_loop = ChatLoop::new(
        store.clone(),
        gateway(vec![]).await,
        provider,
        broadcaster.clone(),
    );

    let chat_id = store
        .add_chat(Conversation::default())
        .await
        .expect("chat");
    let user = Message::user_text("Hello");
    store.add_message(&chat_id, user.clone()).await.expect("user");
    let assistant = Message::empty_assistant();
    store
        .add_message(&chat_id, assistant.clone())
        .await
        .expect("assistant");

    let mut subscription = broadcaster.subscribe(Topic::Message(assistant.id.clone()));
    let turn = chat_loop
        .run_turn(&chat_id, vec![user], assistant.clone(), CancelSignal::never())
        .await;
    assert_eq!(turn.state, TurnState::Completed);

    let mut events = Vec::new();
    while let Some(event) = subscription.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            BroadcastEvent::Snapshot {
                message_id: assistant.id.clone(),
                markdown: "Hel".to_string(),
            },
            BroadcastEvent::Snapshot {
                message_id: assistant.id.clone(),
                markdown: "Hello".to_string(),
            },
            BroadcastEvent::Close,
        ]
    );
}

#[tokio::test]
async fn persistence_failures_end_the_turn() {
    let store = Arc::new(ReadOnlyStore::default());
    let broadcaster = Broadcaster::new();
    let provider = ScriptedProvider::new(vec![
        vec![Ok(Content::text("never stored")), Ok(Content::text("or sent"))],
        vec![Ok(Content::text("no second pass"))],
    ]);
    let chat_loop = ChatLoop::new(
        store.clone(),
        gateway(vec![]).await,
        provider.clone(),
        broadcaster.clone(),
    );

    let chat_id = store
        .add_chat(Conversation::default())
        .await
        .expect("chat");
    let assistant = Message::empty_assistant();
    store
        .add_message(&chat_id, assistant.clone())
        .await
        .expect("assistant");

    let mut subscription = broadcaster.subscribe(Topic::Message(assistant.id.clone()));
    let turn = chat_loop
        .run_turn(
            &chat_id,
            vec![Message::user_text("hi")],
            assistant,
            CancelSignal::never(),
        )
        .await;

    assert_eq!(turn.state, TurnState::Fatal);
    assert_eq!(
        turn.error.map(|error| error.code),
        Some(ParleyErrorCode::Persistence)
    );
    assert_eq!(provider.transcripts().len(), 1);
    assert!(matches!(
        subscription.recv().await,
        Some(BroadcastEvent::Error { .. })
    ));
    assert_eq!(subscription.recv().await, Some(BroadcastEvent::Close));
}

#[tokio::test]
async fn provider_errors_are_fatal_but_keep_partial_content() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new(vec![vec![
        Ok(Content::text("half an ans")),
        Err(ParleyError::transport("connection reset")),
    ]]);
    let service = service(Arc::clone(&store), gateway(vec![]).await, provider);

    let outcome = service.submit(submit_text("hi")).await.expect("submitted");
    let turn = outcome.turn.await.expect("turn joins");
    assert_eq!(turn.state, TurnState::Fatal);
    assert_eq!(
        turn.error.map(|error| error.code),
        Some(ParleyErrorCode::ProviderTransport)
    );

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    assert_eq!(messages[1].contents, vec![Content::text("half an ans")]);
}

#[tokio::test]
async fn last_subscriber_leaving_cancels_the_turn() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let service = service(
        Arc::clone(&store),
        gateway(vec![]).await,
        Arc::new(StallingProvider),
    );

    let outcome = service.submit(submit_text("hi")).await.expect("submitted");
    let mut subscription = service
        .broadcaster()
        .subscribe(Topic::Message(outcome.assistant_message_id.clone()));

    let first = timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("snapshot arrives");
    assert!(matches!(first, Some(BroadcastEvent::Snapshot { .. })));
    drop(subscription);

    let turn = timeout(Duration::from_secs(2), outcome.turn)
        .await
        .expect("turn stops after cancellation")
        .expect("turn joins");
    assert_eq!(turn.state, TurnState::Completed);
    assert!(turn.cancelled);

    let messages = store.messages(&outcome.chat_id).await.expect("messages");
    assert_eq!(messages[1].contents, vec![Content::text("partial")]);
}

#[tokio::test]
async fn refresh_title_uses_the_first_user_text() {
    let store: ChatStoreRef = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new(vec![]);
    let service = service(Arc::clone(&store), gateway(vec![]).await, provider);
    let mut chats = service.broadcaster().subscribe(Topic::Chats);

    let chat_id = store
        .add_chat(Conversation::default())
        .await
        .expect("chat");
    store
        .add_message(&chat_id, Message::user_text("weather in Oslo"))
        .await
        .expect("user");

    let title = service.refresh_title(&chat_id).await.expect("title");
    assert_eq!(title, "About weather in Oslo");
    match chats.recv().await {
        Some(BroadcastEvent::Chats(list)) => assert_eq!(list[0].title, title),
        other => panic!("expected chats event, got {other:?}"),
    }
}
