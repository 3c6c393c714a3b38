//! Chatrelay: a Slack bot that relays conversations to a streaming LLM backend.

pub mod assemble;
pub mod attachments;
pub mod classify;
pub mod completion;
pub mod config;
pub mod error;
pub mod history;
pub mod normalize;
pub mod openai;
pub mod platform;
pub mod reply;
pub mod slack;
pub mod tools;
pub mod trim;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// The bot's own identity on the chat platform, resolved once at startup.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    /// The bot's user id (e.g. `U0BOT123`), used for mention matching and
    /// recognising the bot's own posts in history.
    pub user_id: String,
    /// The bot application's `bot_id` (e.g. `B0APP123`), set on every message
    /// the app posts. Used to skip events produced by this or other apps.
    pub bot_id: Option<String>,
}

impl BotIdentity {
    /// The mention token (`<@U...>`) other users type to address the bot.
    pub fn mention(&self) -> String {
        format!("<@{}>", self.user_id)
    }
}

/// A file descriptor attached to a platform message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackFile {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    /// Authenticated download URL. Missing for tombstoned/external files.
    pub url_private: Option<String>,
}

/// A raw message as fetched from the platform's history APIs.
///
/// Modeled with explicit optional fields rather than an open map: several of
/// the subtle bugs in ad hoc history handling come from key-presence checks,
/// so absence is made visible in the type.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    /// Author user id; `None` for app/system posts without a user.
    pub user: Option<String>,
    /// Legacy bot posts carry a username instead of a user id.
    pub username: Option<String>,
    /// Set when the message was posted by a bot application.
    pub bot_id: Option<String>,
    pub text: String,
    pub files: Vec<SlackFile>,
    pub ts: Option<String>,
}

/// Whether a message arrived in a direct-message conversation or a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    DirectMessage,
    Channel,
}

/// Message subtypes the classifier cares about. Everything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSubtype {
    Changed,
    Deleted,
    Other,
}

/// An inbound message event from the chat platform, already flattened from
/// the platform's wire shape. Consumed once by the classifier.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub channel: String,
    pub channel_kind: ChannelKind,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub subtype: Option<EventSubtype>,
    pub text: String,
    pub files: Vec<SlackFile>,
}

/// Reference to a posted platform message.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub channel: String,
    pub ts: String,
    /// The text the platform accepted, as posted.
    pub text: String,
}

/// A positive classification outcome: reply, anchored under this thread
/// timestamp (`None` means reply inline, DM style).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDecision {
    pub thread_ts: Option<String>,
}
