//! Configuration loading and validation.
//!
//! All options come from environment variables, mirroring the deployment
//! surface of a container-hosted bot. Every knob has a default; only the
//! Slack tokens are required.

use crate::error::{ConfigError, Result};
use std::time::Duration;

pub const DEFAULT_SYSTEM_TEXT: &str = "\
You are a bot in a slack chat room. You might receive messages from multiple people.
Format bold text *like this*, italic text _like this_ and strikethrough text ~like this~.
Slack user IDs match the regex `<@U.*?>`.
Your Slack user ID is <@{bot_user_id}>.
Each message has the author's Slack user ID prepended, like the regex `^<@U.*?>: ` followed by the message text.
Only mention users (e.g., `<@U12345>`) when you are explicitly instructed to do so. Otherwise, do not mention users.
";

pub const DEFAULT_LOADING_TEXT: &str = ":hourglass_flowing_sand: Wait a second, please ...";
pub const DEFAULT_LOADING_GLYPH: &str = " ... :writing_hand:";

/// Chatrelay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub slack: SlackConfig,
    pub model: ModelConfig,
    pub reply: ReplyConfig,
    pub features: FeatureFlags,
    pub redaction: RedactionConfig,
    pub tools: ToolsConfig,
}

/// Slack credentials (Socket Mode).
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub app_token: String,
}

/// Completion-provider settings.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Model identifier sent to the provider (e.g. `gpt-4o`).
    pub model: String,
    pub temperature: f32,
    /// Output-token reservation subtracted from the context budget.
    pub max_output_tokens: u32,
    /// Wall-clock budget for one whole reply session, tool rounds included.
    pub timeout: Duration,
    /// OpenAI-compatible chat-completions endpoint base URL.
    pub api_base: String,
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            temperature: 1.0,
            max_output_tokens: 1024,
            timeout: Duration::from_secs(30),
            api_base: "https://api.openai.com/v1".into(),
            api_key: None,
        }
    }
}

/// Rendering and pacing of the in-progress Slack reply.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    /// System prompt template with a `{bot_user_id}` placeholder.
    pub system_text: String,
    /// Placeholder text posted before any content has streamed in.
    pub loading_text: String,
    /// Suffix appended to intermediate flushes while the stream is live.
    pub loading_glyph: String,
    /// Minimum buffered characters before an intermediate flush fires.
    pub flush_buffer_chars: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            system_text: DEFAULT_SYSTEM_TEXT.into(),
            loading_text: DEFAULT_LOADING_TEXT.into(),
            loading_glyph: DEFAULT_LOADING_GLYPH.into(),
            flush_buffer_chars: 20,
        }
    }
}

/// Feature flags, all off by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    pub translate_markdown: bool,
    pub redaction_enabled: bool,
    pub image_file_access: bool,
    pub pdf_file_access: bool,
    pub prompt_caching: bool,
}

/// Redaction regex sources, applied in declaration order.
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub email_pattern: String,
    pub credit_card_pattern: String,
    pub phone_pattern: String,
    pub ssn_pattern: String,
    /// User-supplied extra pattern; the default never matches anything.
    pub user_defined_pattern: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            email_pattern: r"\b[A-Za-z0-9.*%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b".into(),
            credit_card_pattern: r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b".into(),
            phone_pattern: r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b".into(),
            ssn_pattern: r"\b\d{3}[- ]?\d{2}[- ]?\d{4}\b".into(),
            // [^\s\S] matches nothing: the empty intersection of \s and \S.
            user_defined_pattern: r"[^\s\S]".into(),
        }
    }
}

/// Remote tool-server configuration.
#[derive(Debug, Clone, Default)]
pub struct ToolsConfig {
    pub mcp_servers: Vec<McpServerConfig>,
    /// Refresh interval for the remote tool registry.
    pub mcp_refresh_interval: Duration,
    /// Token sent to bearer-auth MCP servers.
    pub mcp_bearer_token: Option<String>,
}

/// One MCP server reachable over streamable HTTP.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
    pub auth: McpAuth,
}

/// Remote tool server authentication mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpAuth {
    None,
    /// Bearer token for servers behind per-user authentication.
    Bearer,
}

impl Config {
    /// Load the full configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let slack = SlackConfig {
            bot_token: require_env("SLACK_BOT_TOKEN")?,
            app_token: require_env("SLACK_APP_TOKEN")?,
        };

        let model_defaults = ModelConfig::default();
        let model = ModelConfig {
            model: env_or("CHATRELAY_MODEL", &model_defaults.model),
            temperature: parse_env("CHATRELAY_TEMPERATURE", model_defaults.temperature)?,
            max_output_tokens: parse_env(
                "CHATRELAY_MAX_OUTPUT_TOKENS",
                model_defaults.max_output_tokens,
            )?,
            timeout: Duration::from_secs(parse_env("CHATRELAY_TIMEOUT_SECONDS", 30u64)?),
            api_base: env_or("CHATRELAY_API_BASE", &model_defaults.api_base),
            api_key: std::env::var("CHATRELAY_API_KEY").ok(),
        };

        let reply_defaults = ReplyConfig::default();
        let reply = ReplyConfig {
            system_text: env_or("CHATRELAY_SYSTEM_TEXT", &reply_defaults.system_text),
            loading_text: env_or("CHATRELAY_LOADING_TEXT", &reply_defaults.loading_text),
            loading_glyph: env_or("CHATRELAY_LOADING_GLYPH", &reply_defaults.loading_glyph),
            flush_buffer_chars: parse_env(
                "CHATRELAY_UPDATE_BUFFER_SIZE",
                reply_defaults.flush_buffer_chars,
            )?,
        };

        let features = FeatureFlags {
            translate_markdown: env_flag("CHATRELAY_TRANSLATE_MARKDOWN"),
            redaction_enabled: env_flag("CHATRELAY_REDACTION_ENABLED"),
            image_file_access: env_flag("CHATRELAY_IMAGE_FILE_ACCESS_ENABLED"),
            pdf_file_access: env_flag("CHATRELAY_PDF_FILE_ACCESS_ENABLED"),
            prompt_caching: env_flag("CHATRELAY_PROMPT_CACHING_ENABLED"),
        };

        let redaction_defaults = RedactionConfig::default();
        let redaction = RedactionConfig {
            email_pattern: env_or("CHATRELAY_REDACT_EMAIL_PATTERN", &redaction_defaults.email_pattern),
            credit_card_pattern: env_or(
                "CHATRELAY_REDACT_CREDIT_CARD_PATTERN",
                &redaction_defaults.credit_card_pattern,
            ),
            phone_pattern: env_or("CHATRELAY_REDACT_PHONE_PATTERN", &redaction_defaults.phone_pattern),
            ssn_pattern: env_or("CHATRELAY_REDACT_SSN_PATTERN", &redaction_defaults.ssn_pattern),
            user_defined_pattern: env_or(
                "CHATRELAY_REDACT_USER_DEFINED_PATTERN",
                &redaction_defaults.user_defined_pattern,
            ),
        };

        let tools = ToolsConfig {
            mcp_servers: parse_mcp_servers(std::env::var("CHATRELAY_MCP_SERVERS").ok().as_deref())?,
            mcp_refresh_interval: Duration::from_secs(parse_env(
                "CHATRELAY_MCP_REFRESH_SECONDS",
                3600u64,
            )?),
            mcp_bearer_token: std::env::var("CHATRELAY_MCP_BEARER_TOKEN").ok(),
        };

        Ok(Self {
            slack,
            model,
            reply,
            features,
            redaction,
            tools,
        })
    }
}

/// Parse the `name:url|name:url` server list. A `!` prefix on the name marks
/// a bearer-auth server (`!billing:https://...`).
pub fn parse_mcp_servers(raw: Option<&str>) -> Result<Vec<McpServerConfig>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut servers = Vec::new();
    for entry in raw.split('|').filter(|e| !e.trim().is_empty()) {
        let (name, url) = entry.split_once(':').ok_or_else(|| ConfigError::InvalidValue {
            key: "CHATRELAY_MCP_SERVERS".into(),
            value: entry.into(),
        })?;
        let (name, auth) = match name.strip_prefix('!') {
            Some(stripped) => (stripped, McpAuth::Bearer),
            None => (name, McpAuth::None),
        };
        servers.push(McpServerConfig {
            name: name.to_string(),
            url: url.to_string(),
            auth,
        });
    }
    Ok(servers)
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ConfigError::MissingKey(key.into()).into())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "true").unwrap_or(false)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| {
            ConfigError::InvalidValue {
                key: key.into(),
                value,
            }
            .into()
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mcp_server_list() {
        let servers =
            parse_mcp_servers(Some("search:https://mcp.example.com/a|!billing:https://mcp.example.com/b"))
                .unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "search");
        assert_eq!(servers[0].url, "https://mcp.example.com/a");
        assert_eq!(servers[0].auth, McpAuth::None);
        assert_eq!(servers[1].name, "billing");
        assert_eq!(servers[1].auth, McpAuth::Bearer);
    }

    #[test]
    fn empty_mcp_server_list() {
        assert!(parse_mcp_servers(None).unwrap().is_empty());
        assert!(parse_mcp_servers(Some("")).unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_server_entry() {
        assert!(parse_mcp_servers(Some("no-colon-here")).is_err());
    }

    #[test]
    fn default_user_pattern_never_matches() {
        let re = regex::Regex::new(&RedactionConfig::default().user_defined_pattern).unwrap();
        assert!(!re.is_match("anything at all"));
    }
}
