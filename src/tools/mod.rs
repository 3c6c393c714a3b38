//! Tool advertising and dispatch.
//!
//! Tools come from two places: a local registry of in-process handlers, and
//! remote MCP servers ([`mcp::RemoteToolRegistry`]). Remote tool names are
//! prefixed with the server's auth mode and index so a call can be routed
//! back without a lookup table.

pub mod mcp;

use crate::assemble::{ContentPart, ConversationMessage};
use crate::completion::{CompletionProvider, ToolCall};
use crate::config::McpAuth;
use crate::error::CompletionError;
use futures::future::BoxFuture;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// A tool advertised to the model. Serializes to the chat-completions
/// function-tool wire shape.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl Serialize for ToolSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut function = serde_json::Map::new();
        function.insert("name".into(), self.name.clone().into());
        if let Some(description) = &self.description {
            function.insert("description".into(), description.clone().into());
        }
        function.insert("parameters".into(), self.parameters.clone());

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

/// Separator used in encoded remote tool names. Gemini models reject `-` in
/// function names at some proxies, so they get `.`.
pub fn tool_name_separator(model: &str) -> char {
    if model.starts_with("gemini") {
        '.'
    } else {
        '-'
    }
}

fn auth_abbreviation(auth: &McpAuth) -> &'static str {
    match auth {
        McpAuth::None => "n",
        McpAuth::Bearer => "u",
    }
}

/// Routing key of a remote tool: auth mode, server index, raw tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteToolName {
    pub auth: McpAuth,
    pub server_index: usize,
    pub name: String,
}

impl RemoteToolName {
    pub fn encode(&self, separator: char) -> String {
        format!(
            "{}{separator}{}{separator}{}",
            auth_abbreviation(&self.auth),
            self.server_index,
            self.name
        )
    }

    /// Parse an encoded name. `None` means the name is not a remote tool.
    pub fn parse(encoded: &str, separator: char) -> Option<Self> {
        let (abbrev, rest) = encoded.split_once(separator)?;
        let auth = match abbrev {
            "n" => McpAuth::None,
            "u" => McpAuth::Bearer,
            _ => return None,
        };
        let (index, name) = rest.split_once(separator)?;
        let server_index = index.parse().ok()?;
        Some(Self {
            auth,
            server_index,
            name: name.to_string(),
        })
    }
}

/// Why a tool call could not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum ToolDispatchError {
    /// The remote server rejected the session's credentials.
    #[error("tool authentication failed")]
    Auth,

    #[error("tool call failed: {0}")]
    Failed(String),
}

type LocalHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// In-process tools, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, (ToolSchema, LocalHandler)>,
}

impl ToolRegistry {
    pub fn register<F>(&mut self, schema: ToolSchema, handler: F)
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<String>>
            + Send
            + Sync
            + 'static,
    {
        self.tools
            .insert(schema.name.clone(), (schema, Arc::new(handler)));
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|(schema, _)| schema.clone()).collect()
    }

    async fn call(&self, name: &str, arguments: serde_json::Value) -> Option<Result<String, ToolDispatchError>> {
        let (_, handler) = self.tools.get(name)?;
        Some(
            handler(arguments)
                .await
                .map_err(|e| ToolDispatchError::Failed(e.to_string())),
        )
    }
}

/// Everything the reply engine needs to advertise and run tools, plus the
/// compute-once token cost of advertising them.
pub struct ToolEnvironment {
    local: ToolRegistry,
    remote: Option<Arc<mcp::RemoteToolRegistry>>,
    model: String,
    tools_tokens: OnceCell<usize>,
}

impl ToolEnvironment {
    pub fn new(
        local: ToolRegistry,
        remote: Option<Arc<mcp::RemoteToolRegistry>>,
        model: String,
    ) -> Self {
        Self {
            local,
            remote,
            model,
            tools_tokens: OnceCell::new(),
        }
    }

    /// All tool schemas to advertise, remote names encoded for routing.
    pub fn all_schemas(&self) -> Vec<ToolSchema> {
        let separator = tool_name_separator(&self.model);
        let mut schemas = self.local.schemas();
        if let Some(remote) = &self.remote {
            schemas.extend(remote.encoded_schemas(separator));
        }
        schemas
    }

    /// Fixed prompt-token cost of advertising the tool schemas, measured by
    /// differencing two one-message probe completions. Computed once.
    pub async fn tools_token_cost(
        &self,
        provider: &dyn CompletionProvider,
    ) -> Result<usize, CompletionError> {
        let cost = self
            .tools_tokens
            .get_or_try_init(|| async {
                let schemas = self.all_schemas();
                if schemas.is_empty() {
                    return Ok::<_, CompletionError>(0);
                }
                let probe = vec![ConversationMessage::user(vec![ContentPart::text("hello")])];
                let with_tools = provider
                    .count_prompt_tokens(&probe, &self.model, "system", &schemas)
                    .await?;
                let without_tools = provider
                    .count_prompt_tokens(&probe, &self.model, "system", &[])
                    .await?;
                let cost = with_tools.saturating_sub(without_tools);
                info!(cost, "measured tool schema token cost");
                Ok(cost)
            })
            .await?;
        Ok(*cost)
    }

    /// Run one tool call and return its textual result.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<String, ToolDispatchError> {
        let arguments: serde_json::Value = if call.function.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                ToolDispatchError::Failed(format!("arguments are not valid JSON: {e}"))
            })?
        };

        let separator = tool_name_separator(&self.model);
        if let Some(remote_name) = RemoteToolName::parse(&call.function.name, separator) {
            if let Some(remote) = &self.remote {
                return remote.call(&remote_name, arguments).await;
            }
        }
        match self.local.call(&call.function.name, arguments).await {
            Some(result) => result,
            None => {
                warn!(name = %call.function.name, "model requested an unknown tool");
                Err(ToolDispatchError::Failed(format!(
                    "unknown tool: {}",
                    call.function.name
                )))
            }
        }
    }
}
