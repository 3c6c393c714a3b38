//! Conversation assembly: turning collected platform messages into the
//! provider message list.
//!
//! Messages are processed newest-first so that attachment slot budgets favor
//! recent files and older downloads can be skipped entirely, then reversed
//! back into chronological order. The system message is prepended last.

use crate::completion::ToolCall;
use crate::config::FeatureFlags;
use crate::normalize::{self, Normalizer};
use crate::platform::ChatPlatform;
use crate::{BotIdentity, RawMessage, attachments};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Cache-point eligibility threshold: below this many prompt tokens the
/// provider would not cache anyway.
pub const CACHE_POINT_MIN_TOKENS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Provider-side prompt-cache boundary hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multi-part user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ImageUrl {
        image_url: ImageUrl,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
            cache_control: None,
        }
    }

    pub fn set_cache_control(&mut self, control: CacheControl) {
        match self {
            Self::Text { cache_control, .. } | Self::ImageUrl { cache_control, .. } => {
                *cache_control = Some(control);
            }
        }
    }
}

/// Message content: assistant and system messages are plain strings, user
/// messages are part lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// UTF-8 length of the textual content, attachment parts excluded.
    pub fn text_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text, .. } => text.len(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }

    fn attachment_count(&self) -> usize {
        match self {
            Self::Text(_) => 0,
            Self::Parts(parts) => parts
                .iter()
                .filter(|part| matches!(part, ContentPart::ImageUrl { .. }))
                .count(),
        }
    }
}

/// One message of the provider conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ConversationMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }

    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }

    /// The assistant turn that requested tool calls.
    pub fn assistant_tool_calls(text: String, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text),
            tool_call_id: None,
            name: None,
            tool_calls: Some(tool_calls),
        }
    }

    /// A tool result answering one tool call.
    pub fn tool_result(tool_call_id: String, name: String, content: String) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content),
            tool_call_id: Some(tool_call_id),
            name: Some(name),
            tool_calls: None,
        }
    }

    /// Total attachments carried by the message list (used for token
    /// estimates).
    pub fn attachment_count(messages: &[Self]) -> usize {
        messages.iter().map(|m| m.content.attachment_count()).sum()
    }
}

/// Builds provider message lists from collected platform history.
pub struct Assembler {
    platform: Arc<dyn ChatPlatform>,
    normalizer: Arc<Normalizer>,
    identity: BotIdentity,
    flags: FeatureFlags,
    /// Whether the bot's token carries the file-read scope.
    files_readable: bool,
    system_text: String,
}

impl Assembler {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        normalizer: Arc<Normalizer>,
        identity: BotIdentity,
        flags: FeatureFlags,
        files_readable: bool,
        system_text: String,
    ) -> Self {
        Self {
            platform,
            normalizer,
            identity,
            flags,
            files_readable,
            system_text,
        }
    }

    /// The system message, with the bot's user id substituted in and the
    /// template converted out of Slack mrkdwn.
    pub fn system_message(&self) -> ConversationMessage {
        let text = self
            .system_text
            .replace("{bot_user_id}", &self.identity.user_id);
        ConversationMessage::system(self.normalizer.slack_to_markdown(&text))
    }

    /// Convert chronological platform messages into provider messages:
    /// normalized text with an author prefix, the bot's own posts as
    /// assistant turns, attachments resolved into data-URI parts under the
    /// PDF slot budget. The system message is prepended.
    pub async fn assemble(&self, replies: &[RawMessage]) -> Vec<ConversationMessage> {
        // Trailing posts by the bot itself (including the loading reply just
        // posted) are not part of the conversation being answered.
        let mut end = replies.len();
        while end > 0 && replies[end - 1].user.as_deref() == Some(self.identity.user_id.as_str()) {
            end -= 1;
        }
        let replies = &replies[..end];

        let mut messages: Vec<ConversationMessage> = Vec::with_capacity(replies.len() + 1);
        let mut pdf_slots_used = 0usize;

        for reply in replies.iter().rev() {
            let text = self.normalize_reply_text(&reply.text);
            let author = reply
                .user
                .as_deref()
                .or(reply.username.as_deref())
                .unwrap_or("unknown");
            let prefixed = format!("<@{author}>: {text}");

            if reply.user.as_deref() == Some(self.identity.user_id.as_str()) {
                messages.push(ConversationMessage::assistant(prefixed));
                continue;
            }

            let mut parts = vec![ContentPart::text(prefixed)];
            let from_human = reply.bot_id.is_none();

            if from_human && self.flags.image_file_access && self.files_readable {
                parts.extend(attachments::image_parts(self.platform.as_ref(), &reply.files).await);
            }
            if from_human
                && self.flags.pdf_file_access
                && self.files_readable
                && pdf_slots_used < attachments::PDF_SLOTS
            {
                let pdf_parts = attachments::pdf_parts(
                    self.platform.as_ref(),
                    &reply.files,
                    attachments::PDF_SLOTS - pdf_slots_used,
                )
                .await;
                pdf_slots_used += pdf_parts.len();
                parts.extend(pdf_parts);
            }

            messages.push(ConversationMessage::user(parts));
        }

        messages.reverse();
        messages.insert(0, self.system_message());
        messages
    }

    fn normalize_reply_text(&self, text: &str) -> String {
        let text = self.normalizer.strip_bot_mentions(text);
        let text = self.normalizer.redact(&text);
        let text = normalize::unescape_entities(&text);
        self.normalizer.slack_to_markdown(&text)
    }
}

/// Mark the last content part of the two most recent user messages as a
/// prompt-cache boundary. Only applies when caching is enabled, the prompt is
/// big enough to be cacheable, and at least two user messages exist.
pub fn set_cache_points_if_needed(
    messages: &mut [ConversationMessage],
    total_tokens: usize,
    prompt_cache_enabled: bool,
) {
    let user_count = messages.iter().filter(|m| m.role == Role::User).count();
    if !(prompt_cache_enabled && total_tokens >= CACHE_POINT_MIN_TOKENS && user_count >= 2) {
        return;
    }
    let mut marked = 0;
    for message in messages.iter_mut().rev() {
        if message.role != Role::User {
            continue;
        }
        if let MessageContent::Parts(parts) = &mut message.content
            && let Some(last) = parts.last_mut()
        {
            last.set_cache_control(CacheControl::ephemeral());
        }
        marked += 1;
        if marked >= 2 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedactionConfig;
    use crate::error::PlatformError;
    use crate::platform::{ConversationMetadata, HistoryQuery, UserInfo};
    use crate::{MessageRef, SlackFile};
    use async_trait::async_trait;

    /// A platform whose downloads always yield the given bytes.
    struct FixedDownloads(Vec<u8>);

    #[async_trait]
    impl ChatPlatform for FixedDownloads {
        async fn post_message(
            &self,
            channel: &str,
            _thread_ts: Option<&str>,
            text: &str,
            _metadata: Option<&ConversationMetadata>,
        ) -> Result<MessageRef, PlatformError> {
            Ok(MessageRef {
                channel: channel.to_string(),
                ts: "1.0".to_string(),
                text: text.to_string(),
            })
        }

        async fn update_message(
            &self,
            _message: &MessageRef,
            _text: &str,
            _metadata: Option<&ConversationMetadata>,
        ) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn delete_message(&self, _message: &MessageRef) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn fetch_history(
            &self,
            _channel: &str,
            _query: &HistoryQuery,
        ) -> Result<Vec<RawMessage>, PlatformError> {
            Ok(Vec::new())
        }

        async fn fetch_thread_replies(
            &self,
            _channel: &str,
            _thread_ts: &str,
            _limit: u16,
        ) -> Result<Vec<RawMessage>, PlatformError> {
            Ok(Vec::new())
        }

        async fn fetch_user_info(&self, _user: &str) -> Result<UserInfo, PlatformError> {
            Ok(UserInfo::default())
        }

        async fn download_file(
            &self,
            _url: &str,
            _expected_content_types: &[&str],
        ) -> Result<Vec<u8>, PlatformError> {
            Ok(self.0.clone())
        }
    }

    fn assembler(flags: FeatureFlags, download: Vec<u8>) -> Assembler {
        let normalizer =
            Normalizer::new("U0BOT", &flags, &RedactionConfig::default()).unwrap();
        Assembler::new(
            Arc::new(FixedDownloads(download)),
            Arc::new(normalizer),
            BotIdentity {
                user_id: "U0BOT".to_string(),
                bot_id: Some("B0APP".to_string()),
            },
            flags,
            true,
            "You are <@{bot_user_id}>.".to_string(),
        )
    }

    fn user_message(user: &str, text: &str) -> RawMessage {
        RawMessage {
            user: Some(user.to_string()),
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn pdf_file(n: usize) -> SlackFile {
        SlackFile {
            name: Some(format!("doc{n}.pdf")),
            mime_type: Some("application/pdf".to_string()),
            url_private: Some(format!("https://files.example.com/doc{n}.pdf")),
        }
    }

    #[tokio::test]
    async fn prepends_system_and_prefixes_authors() {
        let a = assembler(FeatureFlags::default(), Vec::new());
        let replies = vec![
            user_message("U1", "<@U0BOT> hi &amp; hello"),
            user_message("U0BOT", "hello back"),
            user_message("U2", "me too"),
        ];
        let messages = a.assemble(&replies).await;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert!(matches!(
            &messages[0].content,
            MessageContent::Text(t) if t == "You are <@U0BOT>."
        ));
        assert!(matches!(
            &messages[1].content,
            MessageContent::Parts(parts) if matches!(
                &parts[0],
                ContentPart::Text { text, .. } if text == "<@U1>: hi & hello"
            )
        ));
        assert_eq!(messages[2].role, Role::Assistant);
        assert!(matches!(
            &messages[2].content,
            MessageContent::Text(t) if t == "<@U0BOT>: hello back"
        ));
        assert_eq!(messages[3].role, Role::User);
    }

    #[tokio::test]
    async fn translates_mrkdwn_after_stripping_the_mention() {
        let flags = FeatureFlags {
            translate_markdown: true,
            ..Default::default()
        };
        let a = assembler(flags, Vec::new());
        let replies = vec![user_message("U1", "<@U0BOT> *help* please")];
        let messages = a.assemble(&replies).await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            &messages[1].content,
            MessageContent::Parts(parts) if matches!(
                &parts[0],
                ContentPart::Text { text, .. } if text == "<@U1>: **help** please"
            )
        ));
    }

    #[tokio::test]
    async fn drops_trailing_own_posts() {
        let a = assembler(FeatureFlags::default(), Vec::new());
        let replies = vec![
            user_message("U1", "question"),
            user_message("U0BOT", ":hourglass_flowing_sand: Wait a second, please ..."),
        ];
        let messages = a.assemble(&replies).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages.last().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn pdf_budget_favors_recent_messages() {
        let flags = FeatureFlags {
            pdf_file_access: true,
            ..Default::default()
        };
        let a = assembler(flags, b"%PDF-1.7 stub".to_vec());
        let mut old = user_message("U1", "older docs");
        old.files = (0..4).map(pdf_file).collect();
        let mut new = user_message("U1", "newer docs");
        new.files = (4..8).map(pdf_file).collect();
        let messages = a.assemble(&[old, new]).await;

        let counts: Vec<usize> = messages[1..]
            .iter()
            .map(|m| m.content.attachment_count())
            .collect();
        // The newest message gets all 4 of its PDFs, the older one only the
        // single remaining slot.
        assert_eq!(counts, vec![1, 4]);
    }

    #[tokio::test]
    async fn other_bot_posts_become_user_messages_without_files() {
        let flags = FeatureFlags {
            pdf_file_access: true,
            image_file_access: true,
            ..Default::default()
        };
        let a = assembler(flags, b"%PDF-1.7 stub".to_vec());
        let mut reply = RawMessage {
            user: None,
            username: Some("otherbot".to_string()),
            bot_id: Some("B0OTHER".to_string()),
            text: "automated report".to_string(),
            ..Default::default()
        };
        reply.files = vec![pdf_file(0)];
        let messages = a.assemble(&[reply]).await;
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content.attachment_count(), 0);
        assert!(matches!(
            &messages[1].content,
            MessageContent::Parts(parts) if matches!(
                &parts[0],
                ContentPart::Text { text, .. } if text == "<@otherbot>: automated report"
            )
        ));
    }

    #[test]
    fn cache_points_mark_two_most_recent_user_messages() {
        let mut messages = vec![
            ConversationMessage::system("sys"),
            ConversationMessage::user(vec![ContentPart::text("one")]),
            ConversationMessage::assistant("reply"),
            ConversationMessage::user(vec![ContentPart::text("two")]),
            ConversationMessage::user(vec![ContentPart::text("three")]),
        ];
        set_cache_points_if_needed(&mut messages, 2048, true);

        let marked: Vec<bool> = messages
            .iter()
            .map(|m| match &m.content {
                MessageContent::Parts(parts) => parts.iter().any(|p| {
                    matches!(
                        p,
                        ContentPart::Text {
                            cache_control: Some(_),
                            ..
                        }
                    )
                }),
                MessageContent::Text(_) => false,
            })
            .collect();
        assert_eq!(marked, vec![false, false, false, true, true]);
    }

    #[test]
    fn cache_points_skipped_below_threshold() {
        let mut messages = vec![
            ConversationMessage::user(vec![ContentPart::text("one")]),
            ConversationMessage::user(vec![ContentPart::text("two")]),
        ];
        set_cache_points_if_needed(&mut messages, 512, true);
        let any_marked = messages.iter().any(|m| match &m.content {
            MessageContent::Parts(parts) => parts.iter().any(|p| {
                matches!(p, ContentPart::Text { cache_control: Some(_), .. })
            }),
            MessageContent::Text(_) => false,
        });
        assert!(!any_marked);
    }

    #[test]
    fn message_serialization_shapes() {
        let user = ConversationMessage::user(vec![ContentPart::text("hi")]);
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "role": "user",
                "content": [{"type": "text", "text": "hi"}],
            })
        );

        let tool = ConversationMessage::tool_result(
            "call_1".to_string(),
            "n-0-search".to_string(),
            "result".to_string(),
        );
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "role": "tool",
                "content": "result",
                "tool_call_id": "call_1",
                "name": "n-0-search",
            })
        );
    }
}
