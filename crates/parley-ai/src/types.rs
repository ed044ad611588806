use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One piece of an attached external resource. Exactly one of `text` / `blob`
/// is expected to be set; `blob` holds base64 (or raw bytes rendered as text
/// by hosts that do not encode).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl ResourceContents {
    pub fn mime(&self) -> &str {
        self.mime_type.as_deref().unwrap_or_default()
    }

    pub fn is_image(&self) -> bool {
        self.mime().starts_with("image/")
    }
}

/// Canonical unit of conversation content shared by adapters, the loop, the
/// tool gateway and the broadcaster.
///
/// Tool arguments and results are kept as raw JSON text so that whatever the
/// model emitted can be persisted and replayed byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Resource {
        resources: Vec<ResourceContents>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        call_id: String,
        result: String,
        failed: bool,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Content::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: normalize_tool_arguments(arguments.into()),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, result: impl Into<String>, failed: bool) -> Self {
        Content::ToolResult {
            call_id: call_id.into(),
            result: result.into(),
            failed,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Content::Text { .. } => "text",
            Content::Resource { .. } => "resource",
            Content::ToolCall { .. } => "tool_call",
            Content::ToolResult { .. } => "tool_result",
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, Content::ToolCall { .. })
    }
}

/// Blank argument payloads become `{}`.
pub fn normalize_tool_arguments(arguments: String) -> String {
    if arguments.trim().is_empty() {
        "{}".to_string()
    } else {
        arguments
    }
}

impl Display for Content {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Text { text } => write!(f, "Text {{ text: {text:?} }}"),
            Content::Resource { resources } => {
                write!(f, "Resource {{ ")?;
                for (index, resource) in resources.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} ({})", resource.uri, resource.mime())?;
                    if let Some(text) = &resource.text {
                        write!(f, " text: {text:?}")?;
                    }
                    if let Some(blob) = &resource.blob {
                        write!(f, " blob: {} chars", blob.len())?;
                    }
                }
                write!(f, " }}")
            }
            Content::ToolCall {
                id,
                name,
                arguments,
            } => write!(
                f,
                "ToolCall {{ id: {id}, name: {name}, arguments: {arguments} }}"
            ),
            Content::ToolResult {
                call_id,
                result,
                failed,
            } => write!(
                f,
                "ToolResult {{ call_id: {call_id}, failed: {failed}, result: {result} }}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub contents: Vec<Content>,
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: Role, contents: Vec<Content>) -> Self {
        Self {
            id: new_id(),
            role,
            contents,
            timestamp: now_millis(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Content::text(text)])
    }

    pub fn empty_assistant() -> Self {
        Self::new(Role::Assistant, Vec::new())
    }

    /// The trailing tool call that has no result after it, if any.
    pub fn pending_tool_call(&self) -> Option<(&str, &str, &str)> {
        match self.contents.last() {
            Some(Content::ToolCall {
                id,
                name,
                arguments,
            }) => Some((id.as_str(), name.as_str(), arguments.as_str())),
            _ => None,
        }
    }

    pub fn first_text(&self) -> Option<&str> {
        self.contents.iter().find_map(|content| match content {
            Content::Text { text } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_tool_arguments_become_empty_object() {
        let content = Content::tool_call("call_1", "lookup", "  ");
        assert_eq!(
            content,
            Content::ToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: "{}".to_string(),
            }
        );
    }

    #[test]
    fn pending_tool_call_only_looks_at_the_tail() {
        let mut message = Message::empty_assistant();
        message.contents.push(Content::tool_call("c1", "lookup", "{}"));
        assert_eq!(message.pending_tool_call(), Some(("c1", "lookup", "{}")));

        message
            .contents
            .push(Content::tool_result("c1", "[]", false));
        assert_eq!(message.pending_tool_call(), None);
    }

    #[test]
    fn display_renders_raw_payloads_as_text() {
        let rendered = Content::tool_result("c1", r#"[{"type":"text","text":"ok"}]"#, true).to_string();
        assert!(rendered.contains(r#"{"type":"text","text":"ok"}"#));
        assert!(rendered.contains("failed: true"));
    }

    #[test]
    fn content_serializes_with_snake_case_tag() {
        let value = serde_json::to_value(Content::tool_call("c1", "lookup", "{}")).expect("json");
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["name"], "lookup");
    }
}
