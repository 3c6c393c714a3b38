//! Slack adapter: the [`ChatPlatform`] implementation and the Socket Mode
//! event loop.
//!
//! REST calls go through a shared slack-morphism client. `chat.postMessage`
//! and `chat.update` use raw JSON requests instead, because they carry the
//! conversation metadata payload alongside the text. File downloads use
//! reqwest with the bot token, since `url_private` is plain authenticated
//! HTTP rather than a Web API method.

use crate::error::PlatformError;
use crate::platform::{ChatPlatform, ConversationMetadata, HistoryQuery, UserInfo};
use crate::reply::ReplyEngine;
use crate::{
    BotIdentity, ChannelKind, EventSubtype, MessageEvent, MessageRef, RawMessage, SlackFile,
};
use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{Value, json};
use slack_morphism::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct SlackPlatform {
    /// Shared HTTP client for Web API calls. Holds a hyper connection pool;
    /// allocating one per call would discard that pool every time.
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    bot_token: String,
    http: reqwest::Client,
}

impl SlackPlatform {
    pub fn new(bot_token: impl Into<String>) -> anyhow::Result<Self> {
        let bot_token = bot_token.into();
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.clone()));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build download HTTP client")?;
        Ok(Self {
            client,
            token,
            bot_token,
            http,
        })
    }

    /// Open a session against the cached client using the cached bot token.
    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    /// Resolve the bot's own user id via `auth.test`.
    pub async fn resolve_identity(&self) -> anyhow::Result<BotIdentity> {
        let auth_response = self
            .session()
            .auth_test()
            .await
            .context("failed to call auth.test for bot user ID")?;
        let user_id = auth_response.user_id.0;
        info!(bot_user_id = %user_id, "slack bot user ID resolved");
        Ok(BotIdentity {
            user_id,
            bot_id: None,
        })
    }

    /// Call a Web API method with a raw JSON body, surfacing Slack's `ok`
    /// field as an error.
    async fn api_call(&self, method: &str, payload: &Value) -> Result<Value, PlatformError> {
        let response = self
            .http
            .post(format!("https://slack.com/api/{method}"))
            .bearer_auth(&self.bot_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| PlatformError::Api(format!("{method} request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PlatformError::Api(format!(
                "{method} HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PlatformError::Api(format!("{method} JSON parse error: {e}")))?;
        if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(PlatformError::Api(format!(
                "{method} error: {}",
                body.get("error").and_then(Value::as_str).unwrap_or("unknown")
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl ChatPlatform for SlackPlatform {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
        metadata: Option<&ConversationMetadata>,
    ) -> Result<MessageRef, PlatformError> {
        let mut payload = json!({
            "channel": channel,
            "text": text,
        });
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = Value::String(thread_ts.to_string());
        }
        if let Some(metadata) = metadata {
            payload["metadata"] = serde_json::to_value(metadata)
                .map_err(|e| PlatformError::Api(format!("metadata serialization failed: {e}")))?;
        }

        let body = self.api_call("chat.postMessage", &payload).await?;
        let ts = body
            .get("ts")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::Api("chat.postMessage: no ts in response".into()))?
            .to_string();
        Ok(MessageRef {
            channel: channel.to_string(),
            ts,
            text: text.to_string(),
        })
    }

    async fn update_message(
        &self,
        message: &MessageRef,
        text: &str,
        metadata: Option<&ConversationMetadata>,
    ) -> Result<(), PlatformError> {
        let mut payload = json!({
            "channel": message.channel,
            "ts": message.ts,
            "text": text,
        });
        if let Some(metadata) = metadata {
            payload["metadata"] = serde_json::to_value(metadata)
                .map_err(|e| PlatformError::Api(format!("metadata serialization failed: {e}")))?;
        }
        self.api_call("chat.update", &payload).await?;
        Ok(())
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<(), PlatformError> {
        let request = SlackApiChatDeleteRequest::new(
            SlackChannelId(message.channel.clone()),
            SlackTs(message.ts.clone()),
        );
        self.session()
            .chat_delete(&request)
            .await
            .map_err(|e| PlatformError::Api(format!("chat.delete failed: {e}")))?;
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<RawMessage>, PlatformError> {
        let mut request = SlackApiConversationsHistoryRequest::new()
            .with_channel(SlackChannelId(channel.to_string()))
            .with_limit(query.limit)
            .with_inclusive(query.inclusive);
        if let Some(latest) = &query.latest {
            request = request.with_latest(SlackTs(latest.clone()));
        }
        if let Some(oldest) = &query.oldest {
            request = request.with_oldest(SlackTs(oldest.clone()));
        }
        let response = self
            .session()
            .conversations_history(&request)
            .await
            .map_err(|e| PlatformError::Api(format!("conversations.history failed: {e}")))?;
        Ok(response.messages.into_iter().map(raw_message).collect())
    }

    async fn fetch_thread_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: u16,
    ) -> Result<Vec<RawMessage>, PlatformError> {
        let request = SlackApiConversationsRepliesRequest::new(
            SlackChannelId(channel.to_string()),
            SlackTs(thread_ts.to_string()),
        )
        .with_limit(limit);
        let response = self
            .session()
            .conversations_replies(&request)
            .await
            .map_err(|e| PlatformError::Api(format!("conversations.replies failed: {e}")))?;
        Ok(response.messages.into_iter().map(raw_message).collect())
    }

    async fn fetch_user_info(&self, user: &str) -> Result<UserInfo, PlatformError> {
        let request = SlackApiUsersInfoRequest::new(SlackUserId(user.to_string()));
        let response = self
            .session()
            .users_info(&request)
            .await
            .map_err(|e| PlatformError::Api(format!("users.info failed: {e}")))?;
        Ok(UserInfo {
            locale: response.user.locale.map(|l| l.to_string()),
            timezone: response.user.tz.map(|tz| tz.to_string()),
        })
    }

    async fn download_file(
        &self,
        url: &str,
        expected_content_types: &[&str],
    ) -> Result<Vec<u8>, PlatformError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .map_err(|e| PlatformError::Api(format!("file download failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::DownloadFailed {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        // Slack serves an HTML login page instead of a 403 when the token
        // lacks the files:read scope.
        if content_type.starts_with("text/html") {
            return Err(PlatformError::FileNotAccessible {
                url: url.to_string(),
            });
        }
        if !content_type_matches(&content_type, expected_content_types) {
            return Err(PlatformError::UnexpectedContentType {
                url: url.to_string(),
                content_type,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PlatformError::Api(format!("file download read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Whether the `Content-Type` header value names one of the expected types,
/// parameters (`; charset=...`) ignored.
fn content_type_matches(content_type: &str, expected: &[&str]) -> bool {
    let bare = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    expected.iter().any(|e| bare.eq_ignore_ascii_case(e))
}

fn raw_message(message: SlackHistoryMessage) -> RawMessage {
    RawMessage {
        user: message.sender.user.map(|u| u.0),
        username: message.sender.username,
        bot_id: message.sender.bot_id.map(|b| b.0),
        text: message.content.text.unwrap_or_default(),
        files: message
            .content
            .files
            .map(slack_files)
            .unwrap_or_default(),
        ts: Some(message.origin.ts.0),
    }
}

fn slack_files(files: Vec<slack_morphism::SlackFile>) -> Vec<SlackFile> {
    files
        .into_iter()
        .map(|file| SlackFile {
            name: file.name,
            mime_type: file.mimetype.map(|m| m.0),
            url_private: file.url_private.map(|u| u.to_string()),
        })
        .collect()
}

/// Direct-message channel ids start with `D`; everything else is a channel.
fn channel_kind(channel_id: &str) -> ChannelKind {
    if channel_id.starts_with('D') {
        ChannelKind::DirectMessage
    } else {
        ChannelKind::Channel
    }
}

// ---------------------------------------------------------------------------
// Socket Mode event loop
// ---------------------------------------------------------------------------

/// State shared with socket mode callbacks via `SlackClientEventsUserState`.
struct SocketState {
    engine: Arc<ReplyEngine>,
    bot_user_id: String,
}

/// Run the Socket Mode listener until `ctrl-c`. Every qualifying push event
/// spawns an independent reply session.
pub async fn run_socket_mode(
    app_token: &str,
    engine: Arc<ReplyEngine>,
    identity: &BotIdentity,
) -> anyhow::Result<()> {
    let state = Arc::new(SocketState {
        engine,
        bot_user_id: identity.user_id.clone(),
    });

    let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

    // The socket mode listener needs its own client — it owns a persistent
    // WebSocket connection. The REST client stays separate.
    let listener_client = Arc::new(SlackClient::new(
        SlackClientHyperConnector::new()
            .context("failed to create slack socket mode connector")?,
    ));
    let listener_environment = Arc::new(
        SlackClientEventsListenerEnvironment::new(listener_client)
            .with_error_handler(socket_mode_error_handler)
            .with_user_state(state),
    );
    let listener = SlackClientSocketModeListener::new(
        &SlackClientSocketModeConfig::new(),
        listener_environment,
        callbacks,
    );

    let app_token = SlackApiToken::new(SlackApiTokenValue(app_token.to_string()));
    listener
        .listen_for(&app_token)
        .await
        .context("failed to start slack socket mode listener")?;
    info!("slack socket mode connected");

    tokio::select! {
        exit_code = listener.serve() => {
            info!(exit_code, "slack socket mode listener stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            listener.shutdown().await;
        }
    }
    Ok(())
}

fn socket_mode_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    warn!(error = %err, "slack socket mode error");
    HttpStatusCode::OK
}

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let state_guard = states.read().await;
    let Some(state) = state_guard.get_user_state::<Arc<SocketState>>() else {
        warn!("socket state missing from user state");
        return Ok(());
    };

    let message_event = match event.event {
        SlackEventCallbackBody::Message(message) => from_message_event(message, state),
        SlackEventCallbackBody::AppMention(mention) => Some(from_app_mention(mention)),
        _ => None,
    };

    if let Some(message_event) = message_event {
        let engine = Arc::clone(&state.engine);
        tokio::spawn(async move {
            engine.handle_event(message_event).await;
        });
    }
    Ok(())
}

/// Flatten a `message` push event. Channel messages that mention the bot are
/// skipped here: the same post also arrives as an `app_mention` event, and
/// handling both would produce two replies.
fn from_message_event(message: SlackMessageEvent, state: &SocketState) -> Option<MessageEvent> {
    let channel = message.origin.channel.as_ref().map(|c| c.0.clone())?;
    let kind = channel_kind(&channel);
    let text = message
        .content
        .as_ref()
        .and_then(|c| c.text.clone())
        .unwrap_or_default();

    if kind == ChannelKind::Channel && text.contains(&format!("<@{}>", state.bot_user_id)) {
        return None;
    }

    let subtype = message.subtype.as_ref().map(|subtype| match subtype {
        SlackMessageEventType::MessageChanged => EventSubtype::Changed,
        SlackMessageEventType::MessageDeleted => EventSubtype::Deleted,
        _ => EventSubtype::Other,
    });

    Some(MessageEvent {
        channel,
        channel_kind: kind,
        ts: message.origin.ts.0.clone(),
        thread_ts: message.origin.thread_ts.as_ref().map(|t| t.0.clone()),
        user: message.sender.user.as_ref().map(|u| u.0.clone()),
        bot_id: message.sender.bot_id.as_ref().map(|b| b.0.clone()),
        subtype,
        text,
        files: message
            .content
            .and_then(|c| c.files)
            .map(slack_files)
            .unwrap_or_default(),
    })
}

/// Flatten an `app_mention` push event.
fn from_app_mention(mention: SlackAppMentionEvent) -> MessageEvent {
    let channel = mention.channel.0.clone();
    MessageEvent {
        channel_kind: channel_kind(&channel),
        channel,
        ts: mention.origin.ts.0.clone(),
        thread_ts: mention.origin.thread_ts.as_ref().map(|t| t.0.clone()),
        user: Some(mention.user.0.clone()),
        bot_id: None,
        subtype: None,
        text: mention.content.text.clone().unwrap_or_default(),
        files: mention.content.files.map(slack_files).unwrap_or_default(),
    }
}
