//! Remote tools over MCP (streamable HTTP).
//!
//! The registry keeps one session per configured server and republishes the
//! full tool snapshot on every refresh, so a server that goes away takes its
//! tools with it. Listing failures are per-server: one unreachable server
//! never empties the others' tools.

use crate::config::{McpAuth, McpServerConfig};
use crate::tools::{RemoteToolName, ToolDispatchError, ToolSchema};
use anyhow::{Context as _, Result, anyhow};
use arc_swap::ArcSwap;
use http::{HeaderName, HeaderValue};
use rmcp::ClientHandler;
use rmcp::service::{RoleClient, RunningService, ServiceError};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

type McpSession = RunningService<RoleClient, McpClientHandler>;

#[derive(Clone)]
struct McpClientHandler {
    client_info: rmcp::model::ClientInfo,
}

impl McpClientHandler {
    fn new() -> Self {
        let mut client_info = rmcp::model::ClientInfo::default();
        client_info.protocol_version = rmcp::model::ProtocolVersion::default();
        client_info.capabilities = rmcp::model::ClientCapabilities::default();
        client_info.client_info =
            rmcp::model::Implementation::new("chatrelay", env!("CARGO_PKG_VERSION"))
                .with_description("Chatrelay MCP client");
        Self { client_info }
    }
}

impl ClientHandler for McpClientHandler {
    fn get_info(&self) -> rmcp::model::ClientInfo {
        self.client_info.clone()
    }
}

/// One discovered remote tool, with its routing key.
#[derive(Debug, Clone)]
struct RemoteTool {
    routing: RemoteToolName,
    schema: ToolSchema,
}

struct ServerHandle {
    config: McpServerConfig,
    bearer_token: Option<String>,
    session: Mutex<Option<McpSession>>,
}

impl ServerHandle {
    async fn connect(&self) -> Result<McpSession> {
        let mut custom_headers = HashMap::new();
        if self.config.auth == McpAuth::Bearer {
            let token = self
                .bearer_token
                .as_deref()
                .ok_or_else(|| anyhow!("no bearer token configured for '{}'", self.config.name))?;
            custom_headers.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("bearer token is not a valid header value")?,
            );
        }

        let transport_config =
            rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                self.config.url.clone(),
            )
            .custom_headers(custom_headers);
        let transport = rmcp::transport::StreamableHttpClientTransport::from_config(transport_config);

        rmcp::serve_client(McpClientHandler::new(), transport)
            .await
            .with_context(|| format!("failed to initialize mcp server '{}'", self.config.name))
    }

    /// List the server's tools, connecting first if needed. Drops the session
    /// on failure so the next attempt reconnects.
    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>> {
        let mut session_guard = self.session.lock().await;
        if session_guard.is_none() {
            *session_guard = Some(self.connect().await?);
        }
        let session = session_guard.as_ref().ok_or_else(|| {
            anyhow!("mcp server '{}' is not connected", self.config.name)
        })?;
        match session.list_all_tools().await {
            Ok(tools) => Ok(tools),
            Err(error) => {
                *session_guard = None;
                Err(anyhow!(error.to_string()))
            }
        }
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<rmcp::model::CallToolResult> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        };

        let mut session_guard = self.session.lock().await;
        if session_guard.is_none() {
            *session_guard = Some(self.connect().await?);
        }
        let session = session_guard
            .as_ref()
            .ok_or_else(|| anyhow!("mcp server '{}' is not connected", self.config.name))?;

        let mut params =
            rmcp::model::CallToolRequestParams::new(Cow::<'static, str>::Owned(tool_name.to_string()));
        params.arguments = arguments;
        let result = session.call_tool(params).await.map_err(service_error_to_anyhow);
        if result.is_err() {
            *session_guard = None;
        }
        result
    }
}

/// Registry of tools discovered from remote MCP servers. The published
/// snapshot is replaced wholesale on refresh.
pub struct RemoteToolRegistry {
    servers: Vec<ServerHandle>,
    snapshot: ArcSwap<Vec<RemoteTool>>,
    /// Cleared when a bearer-auth server rejects the token; set again by the
    /// next successful refresh.
    session_valid: AtomicBool,
}

impl RemoteToolRegistry {
    pub fn new(configs: Vec<McpServerConfig>, bearer_token: Option<String>) -> Self {
        let servers = configs
            .into_iter()
            .map(|config| ServerHandle {
                config,
                bearer_token: bearer_token.clone(),
                session: Mutex::new(None),
            })
            .collect();
        Self {
            servers,
            snapshot: ArcSwap::from_pointee(Vec::new()),
            session_valid: AtomicBool::new(true),
        }
    }

    /// The current tool schemas, names encoded for routing.
    pub fn encoded_schemas(&self, separator: char) -> Vec<ToolSchema> {
        self.snapshot
            .load()
            .iter()
            .map(|tool| ToolSchema {
                name: tool.routing.encode(separator),
                description: tool.schema.description.clone(),
                parameters: tool.schema.parameters.clone(),
            })
            .collect()
    }

    /// Re-list every server's tools and republish the snapshot. A server
    /// that fails to list is logged and contributes nothing this round.
    pub async fn refresh(&self) {
        let mut tools = Vec::new();
        let mut any_succeeded = false;
        for (server_index, server) in self.servers.iter().enumerate() {
            match server.list_tools().await {
                Ok(listed) => {
                    any_succeeded = true;
                    for tool in listed {
                        let parameters = tool.schema_as_json_value();
                        let name = tool.name.into_owned();
                        tools.push(RemoteTool {
                            routing: RemoteToolName {
                                auth: server.config.auth.clone(),
                                server_index,
                                name: name.clone(),
                            },
                            schema: ToolSchema {
                                name,
                                description: tool.description.map(|d| d.into_owned()),
                                parameters,
                            },
                        });
                    }
                }
                Err(error) => {
                    warn!(server = %server.config.name, %error, "failed to list mcp tools");
                }
            }
        }
        if any_succeeded || self.servers.is_empty() {
            info!(count = tools.len(), "refreshed remote tool registry");
            self.snapshot.store(Arc::new(tools));
            self.session_valid.store(true, Ordering::SeqCst);
        }
    }

    /// Run one remote tool call.
    pub async fn call(
        &self,
        name: &RemoteToolName,
        arguments: serde_json::Value,
    ) -> Result<String, ToolDispatchError> {
        let server = self
            .servers
            .get(name.server_index)
            .filter(|server| server.config.auth == name.auth)
            .ok_or_else(|| {
                ToolDispatchError::Failed(format!("no such tool server: {}", name.server_index))
            })?;

        if name.auth == McpAuth::Bearer && !self.session_valid.load(Ordering::SeqCst) {
            return Err(ToolDispatchError::Auth);
        }

        let result = server.call_tool(&name.name, arguments).await.map_err(|error| {
            let message = error.to_string();
            if name.auth == McpAuth::Bearer && looks_like_auth_failure(&message) {
                self.session_valid.store(false, Ordering::SeqCst);
                ToolDispatchError::Auth
            } else {
                ToolDispatchError::Failed(message)
            }
        })?;

        let output = collect_result_text(&result);
        if result.is_error.unwrap_or(false) {
            let message = if output.is_empty() {
                format!(
                    "mcp server '{}' reported an error calling '{}'",
                    server.config.name, name.name
                )
            } else {
                output
            };
            return Err(ToolDispatchError::Failed(message));
        }
        if output.is_empty() {
            return Ok("[tool returned no content]".to_string());
        }
        Ok(output)
    }

    /// Refresh periodically until the task is aborted.
    pub fn spawn_refresh_task(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }
}

fn service_error_to_anyhow(error: ServiceError) -> anyhow::Error {
    anyhow!(error.to_string())
}

fn looks_like_auth_failure(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("401") || lowered.contains("unauthorized") || lowered.contains("forbidden")
}

fn collect_result_text(result: &rmcp::model::CallToolResult) -> String {
    let mut blocks = result
        .content
        .iter()
        .map(|content| match &content.raw {
            rmcp::model::RawContent::Text(text) => text.text.clone(),
            rmcp::model::RawContent::Resource(resource) => match &resource.resource {
                rmcp::model::ResourceContents::TextResourceContents { text, .. } => text.clone(),
                _ => serde_json::to_string(&content.raw)
                    .unwrap_or_else(|_| "[unsupported resource content]".to_string()),
            },
            other => serde_json::to_string(other)
                .unwrap_or_else(|_| "[unsupported mcp content]".to_string()),
        })
        .collect::<Vec<_>>();

    if let Some(structured_content) = &result.structured_content {
        blocks.push(structured_content.to_string());
    }

    blocks.join("\n")
}
