//! The chat-platform client contract.
//!
//! Everything the reply pipeline needs from Slack is behind [`ChatPlatform`],
//! so the pipeline and its tests run against a mock without a network.

use crate::assemble::ConversationMessage;
use crate::error::PlatformError;
use crate::{MessageRef, RawMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Bounds for a history fetch. Timestamps are the platform's string form
/// (`"1700000000.123456"`).
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub oldest: Option<String>,
    pub latest: Option<String>,
    pub limit: u16,
    pub inclusive: bool,
}

/// Locale and timezone of a platform user, for future prompt hints.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

/// Durable record attached to every post/update of an in-progress reply, so
/// the conversation context survives restarts of the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub event_type: String,
    pub event_payload: ConversationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    /// The system message(s) in effect for this conversation.
    pub messages: Vec<ConversationMessage>,
    /// The user the reply is addressed to.
    pub user: Option<String>,
}

impl ConversationMetadata {
    pub const EVENT_TYPE: &'static str = "chatrelay-convo";

    pub fn new(system_messages: Vec<ConversationMessage>, user: Option<String>) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            event_payload: ConversationPayload {
                messages: system_messages,
                user,
            },
        }
    }
}

/// Chat-platform operations used by the reply pipeline.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Post a message, optionally threaded, returning a handle for updates.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
        metadata: Option<&ConversationMetadata>,
    ) -> Result<MessageRef, PlatformError>;

    /// Replace the text of a previously posted message.
    async fn update_message(
        &self,
        message: &MessageRef,
        text: &str,
        metadata: Option<&ConversationMetadata>,
    ) -> Result<(), PlatformError>;

    /// Delete a previously posted message.
    async fn delete_message(&self, message: &MessageRef) -> Result<(), PlatformError>;

    /// Fetch channel history within the query bounds, newest first (the
    /// platform's native order).
    async fn fetch_history(
        &self,
        channel: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<RawMessage>, PlatformError>;

    /// Fetch all replies of a thread, oldest first.
    async fn fetch_thread_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: u16,
    ) -> Result<Vec<RawMessage>, PlatformError>;

    /// Look up a user's profile info.
    async fn fetch_user_info(&self, user: &str) -> Result<UserInfo, PlatformError>;

    /// Download a file the bot has access to, enforcing the expected content
    /// types. `text/html` responses mean the bot lacks file access.
    async fn download_file(
        &self,
        url: &str,
        expected_content_types: &[&str],
    ) -> Result<Vec<u8>, PlatformError>;
}
