use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parley_ai::{
    Content, Message, ParleyError, ParleyErrorCode, ResourceContents, Role, ToolDescriptor,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Result of a tool call as reported by the external tool host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutput {
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub text: String,
}

/// An external host of tools, resources and prompts.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ParleyError>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ParleyError> {
        Ok(Vec::new())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, ParleyError> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutput, ParleyError>;

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, ParleyError> {
        Err(ParleyError::new(
            ParleyErrorCode::NotFound,
            format!("resource not found: {uri}"),
        ))
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: &BTreeMap<String, String>,
    ) -> Result<Vec<PromptMessage>, ParleyError> {
        Err(ParleyError::new(
            ParleyErrorCode::NotFound,
            format!("prompt not found: {name}"),
        ))
    }
}

pub type ToolProviderRef = Arc<dyn ToolProvider>;

/// What the gateway hands back for one invocation: a payload ready to be
/// stored as a tool result, and whether the call succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub result: String,
    pub success: bool,
}

impl ToolInvocation {
    pub fn failed(message: impl AsRef<str>) -> Self {
        Self {
            result: error_payload(message.as_ref()),
            success: false,
        }
    }
}

/// Textual error payload in the shape tool hosts use for their own content.
pub fn error_payload(message: &str) -> String {
    json!([{ "type": "text", "text": message }]).to_string()
}

/// Routes tool, resource and prompt names to the provider that advertised
/// them. Tables are built once; on a name collision the provider registered
/// first keeps the name.
#[derive(Default)]
pub struct ToolGateway {
    tools: Vec<ToolDescriptor>,
    tool_routes: HashMap<String, ToolProviderRef>,
    resource_routes: HashMap<String, ToolProviderRef>,
    prompt_routes: HashMap<String, ToolProviderRef>,
}

impl ToolGateway {
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn build(providers: Vec<ToolProviderRef>) -> Result<Self, ParleyError> {
        let mut gateway = Self::default();
        for provider in providers {
            for tool in provider.list_tools().await? {
                if let Some(owner) = gateway.tool_routes.get(&tool.name) {
                    warn!(
                        tool_name = tool.name.as_str(),
                        owner = owner.name(),
                        ignored = provider.name(),
                        "tool name already registered; keeping first provider"
                    );
                    continue;
                }
                gateway
                    .tool_routes
                    .insert(tool.name.clone(), Arc::clone(&provider));
                gateway.tools.push(tool);
            }

            for resource in provider.list_resources().await? {
                register(
                    &mut gateway.resource_routes,
                    resource.uri,
                    &provider,
                    "resource",
                );
            }
            for prompt in provider.list_prompts().await? {
                register(&mut gateway.prompt_routes, prompt.name, &provider, "prompt");
            }
        }
        debug!(
            tools = gateway.tools.len(),
            resources = gateway.resource_routes.len(),
            prompts = gateway.prompt_routes.len(),
            "tool gateway ready"
        );
        Ok(gateway)
    }

    /// Merged tool list, in registration order.
    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Calls `name` with the raw argument text. Every failure comes back as a
    /// failed invocation with an error payload; this never returns an error.
    pub async fn invoke(&self, name: &str, raw_arguments: &str) -> ToolInvocation {
        self.try_invoke(name, raw_arguments)
            .await
            .unwrap_or_else(|error| ToolInvocation::failed(&error.message))
    }

    /// Like [`ToolGateway::invoke`], but reports routing, argument, host and
    /// encoding failures as tool-coded errors. A host that answers with
    /// `is_error` is still an `Ok` invocation with `success == false`.
    pub async fn try_invoke(
        &self,
        name: &str,
        raw_arguments: &str,
    ) -> Result<ToolInvocation, ParleyError> {
        let provider = self.tool_routes.get(name).ok_or_else(|| {
            warn!(tool_name = name, "tool not found");
            ParleyError::new(
                ParleyErrorCode::ToolNotFound,
                format!("tool {name} is not found"),
            )
        })?;

        let arguments: Value = serde_json::from_str(raw_arguments).map_err(|_| {
            ParleyError::new(
                ParleyErrorCode::ToolArgumentsInvalid,
                format!("tool input {raw_arguments} is not valid json"),
            )
        })?;

        debug!(tool_name = name, provider = provider.name(), "calling tool");
        let output = provider.call_tool(name, arguments).await.map_err(|error| {
            warn!(tool_name = name, error = %error, "tool call failed");
            ParleyError::new(
                ParleyErrorCode::ToolExecutionFailed,
                format!("tool call failed: {}", error.message),
            )
            .with_details(json!({ "code": error.code }))
        })?;

        let result = serde_json::to_string(&output.content).map_err(|error| {
            ParleyError::new(
                ParleyErrorCode::ToolResultEncoding,
                format!("failed to marshal content: {error}"),
            )
        })?;
        Ok(ToolInvocation {
            result,
            success: !output.is_error,
        })
    }

    /// Reads every attached URI into one resource content item.
    pub async fn read_resources(&self, uris: &[String]) -> Result<Content, ParleyError> {
        let mut resources = Vec::new();
        for uri in uris {
            let provider = self.resource_routes.get(uri).ok_or_else(|| {
                ParleyError::new(ParleyErrorCode::NotFound, format!("resource not found: {uri}"))
            })?;
            resources.extend(provider.read_resource(uri).await?);
        }
        Ok(Content::Resource { resources })
    }

    /// Expands a provider prompt into transcript messages.
    pub async fn prompt_messages(
        &self,
        name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> Result<Vec<Message>, ParleyError> {
        let provider = self.prompt_routes.get(name).ok_or_else(|| {
            ParleyError::new(ParleyErrorCode::NotFound, format!("prompt not found: {name}"))
        })?;
        let messages = provider.get_prompt(name, arguments).await?;
        Ok(messages
            .into_iter()
            .map(|message| Message::new(message.role, vec![Content::text(message.text)]))
            .collect())
    }
}

fn register(
    routes: &mut HashMap<String, ToolProviderRef>,
    key: String,
    provider: &ToolProviderRef,
    what: &str,
) {
    if let Some(owner) = routes.get(&key) {
        warn!(
            key = key.as_str(),
            kind = what,
            owner = owner.name(),
            ignored = provider.name(),
            "name already registered; keeping first provider"
        );
        return;
    }
    routes.insert(key, Arc::clone(provider));
}
