use std::env;
use std::future::Future;
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::{ParleyError, ParleyErrorCode};
use crate::provider::ContentStream;
use crate::sse::{SseDecoder, SseEvent};
use crate::types::{Content, ResourceContents, Role, normalize_tool_arguments};

/// Longest textual rendering of a non-image attachment, in characters.
pub(crate) const MAX_RESOURCE_TEXT_CHARS: usize = 64 * 1024;

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

pub(crate) fn shared_http_client(base_url: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_base_url(base_url) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "[::1]"
}

pub(crate) fn resolve_api_key(
    explicit: Option<&str>,
    env_var: &str,
    provider: &str,
) -> Result<String, ParleyError> {
    if let Some(api_key) = explicit.filter(|value| !value.trim().is_empty()) {
        return Ok(api_key.to_string());
    }
    if let Ok(value) = env::var(env_var) {
        if !value.trim().is_empty() {
            return Ok(value);
        }
    }
    Err(ParleyError::new(
        ParleyErrorCode::ProviderAuthMissing,
        format!("Missing API key for provider '{provider}'. Set `api_key` or {env_var}."),
    ))
}

/// Sends the request and turns transport failures and non-2xx statuses into
/// provider errors.
pub(crate) async fn send_checked(
    request: RequestBuilder,
    provider: &str,
) -> Result<Response, ParleyError> {
    let response = request.send().await.map_err(|error| {
        ParleyError::transport(format!("{provider} transport failed: {error}"))
    })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error body".to_string());
        return Err(ParleyError::new(
            ParleyErrorCode::ProviderHttp,
            format!("{provider} HTTP {status}: {body}"),
        ));
    }
    Ok(response)
}

/// A stream that yields `error` once, for requests that cannot be built.
pub(crate) fn failed_stream(error: ParleyError) -> ContentStream {
    Box::pin(futures_util::stream::once(async move { Err(error) }))
}

/// What an event parser wants the driver to do after one event.
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) trait SseParser: Send + 'static {
    fn on_event(&mut self, event: SseEvent, out: &mut Vec<Content>) -> Result<Flow, ParleyError>;

    /// Called once when the stream ends, either on a `Stop` or at end of body.
    fn on_end(&mut self, _out: &mut Vec<Content>) -> Result<(), ParleyError> {
        Ok(())
    }
}

/// Drives an event-stream response through `parser`, yielding whatever
/// content it produces. Cancellation ends the stream silently.
pub(crate) fn sse_content_stream<F, P>(
    provider: &'static str,
    send: F,
    mut parser: P,
    signal: CancelSignal,
) -> ContentStream
where
    F: Future<Output = Result<Response, ParleyError>> + Send + 'static,
    P: SseParser,
{
    Box::pin(async_stream::stream! {
        let response = tokio::select! {
            _ = signal.cancelled() => return,
            response = send => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                yield Err(error);
                return;
            }
        };

        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::default();
        let mut produced = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = signal.cancelled() => {
                    debug!(provider, "stream cancelled");
                    return;
                }
                chunk = body.next() => chunk,
            };

            let (events, ended) = match chunk {
                Some(Ok(bytes)) => (decoder.push(&bytes), false),
                Some(Err(error)) => {
                    yield Err(ParleyError::transport(format!(
                        "{provider} stream read failed: {error}"
                    )));
                    return;
                }
                None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
            };

            let mut stop = ended;
            for event in events {
                match parser.on_event(event, &mut produced) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => stop = true,
                    Err(error) => {
                        for content in produced.drain(..) {
                            yield Ok(content);
                        }
                        yield Err(error);
                        return;
                    }
                }
                for content in produced.drain(..) {
                    yield Ok(content);
                }
                if stop {
                    break;
                }
            }

            if stop {
                if let Err(error) = parser.on_end(&mut produced) {
                    yield Err(error);
                    return;
                }
                for content in produced.drain(..) {
                    yield Ok(content);
                }
                return;
            }
        }
    })
}

/// Accumulates streamed tool-call fragments. The first call (by index) wins;
/// fragments for any other call are logged and dropped.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    index: Option<u64>,
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

impl ToolCallAccumulator {
    pub(crate) fn push(
        &mut self,
        index: Option<u64>,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        if !self.started {
            self.started = true;
            self.index = index;
        } else if index.is_some() && self.index.is_some() && index != self.index {
            warn!(
                index = index.unwrap_or_default(),
                name = name.unwrap_or_default(),
                "only the first tool call per turn is supported; dropping fragment"
            );
            return;
        }

        if self.id.is_empty() {
            if let Some(id) = id.filter(|id| !id.is_empty()) {
                self.id = id.to_string();
            }
        }
        if self.name.is_empty() {
            if let Some(name) = name.filter(|name| !name.is_empty()) {
                self.name = name.to_string();
            }
        }
        if let Some(arguments) = arguments {
            self.arguments.push_str(arguments);
        }
    }

    pub(crate) fn finish(&mut self) -> Option<Content> {
        if !self.started {
            return None;
        }
        self.started = false;
        Some(Content::ToolCall {
            id: std::mem::take(&mut self.id),
            name: std::mem::take(&mut self.name),
            arguments: normalize_tool_arguments(std::mem::take(&mut self.arguments)),
        })
    }
}

pub(crate) fn assistant_content_error(content: &Content) -> ParleyError {
    ParleyError::new(
        ParleyErrorCode::ContentType,
        format!(
            "content type {} is not supported for {} messages",
            content.kind(),
            Role::Assistant.as_str()
        ),
    )
}

pub(crate) fn user_content_error(content: &Content) -> ParleyError {
    ParleyError::new(
        ParleyErrorCode::ContentType,
        format!(
            "content type {} is not supported for {} messages",
            content.kind(),
            Role::User.as_str()
        ),
    )
}

pub(crate) fn is_base64(value: &str) -> bool {
    STANDARD.decode(value).is_ok()
}

/// Base64 payload of a resource blob, encoding it if the host did not.
pub(crate) fn blob_base64(resource: &ResourceContents) -> String {
    let blob = resource.blob.as_deref().unwrap_or_default();
    if is_base64(blob) {
        blob.to_string()
    } else {
        STANDARD.encode(blob.as_bytes())
    }
}

/// Bounded textual stand-in for a non-image attachment; empty when the
/// resource carries neither text nor blob.
pub(crate) fn document_text(resource: &ResourceContents) -> String {
    let body = match (&resource.text, &resource.blob) {
        (Some(text), _) if !text.is_empty() => text.clone(),
        (_, Some(blob)) if !blob.is_empty() => blob_base64(resource),
        _ => return String::new(),
    };
    format!(
        "[Document of type {}]\n{}",
        resource.mime(),
        truncate_chars(&body, MAX_RESOURCE_TEXT_CHARS)
    )
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…[truncated]", &value[..cut]),
        None => value.to_string(),
    }
}

/// Raw JSON text as a value, falling back to a JSON string when the text is
/// not valid JSON.
pub(crate) fn raw_json_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
