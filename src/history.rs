//! History collection: gathering the platform messages that form the
//! conversation context for one reply.

use crate::error::PlatformError;
use crate::platform::{ChatPlatform, HistoryQuery};
use crate::{ChannelKind, MessageEvent, RawMessage};
use std::time::{SystemTime, UNIX_EPOCH};

/// How far back a top-level DM conversation reaches.
const DM_HISTORY_SECONDS: f64 = 86_400.0;
const DM_HISTORY_LIMIT: u16 = 100;
const THREAD_REPLIES_LIMIT: u16 = 1000;

/// Collect the messages to reply to, in chronological order.
///
/// Thread events pull the whole thread. Top-level direct messages pull the
/// last day of the conversation. A channel mention outside a thread stands
/// alone: the event itself is the entire context.
pub async fn collect(
    platform: &dyn ChatPlatform,
    event: &MessageEvent,
) -> Result<Vec<RawMessage>, PlatformError> {
    if event.channel_kind == ChannelKind::DirectMessage && event.thread_ts.is_none() {
        return dm_replies(platform, &event.channel).await;
    }
    if let Some(thread_ts) = &event.thread_ts {
        return platform
            .fetch_thread_replies(&event.channel, thread_ts, THREAD_REPLIES_LIMIT)
            .await;
    }
    Ok(vec![RawMessage {
        user: event.user.clone(),
        username: None,
        bot_id: event.bot_id.clone(),
        text: event.text.clone(),
        files: event.files.clone(),
        ts: Some(event.ts.clone()),
    }])
}

/// The last 24 hours of a direct-message conversation. The platform returns
/// newest first; the result is flipped back to chronological order.
async fn dm_replies(
    platform: &dyn ChatPlatform,
    channel: &str,
) -> Result<Vec<RawMessage>, PlatformError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let query = HistoryQuery {
        oldest: Some(format!("{:.6}", now - DM_HISTORY_SECONDS)),
        latest: None,
        limit: DM_HISTORY_LIMIT,
        inclusive: true,
    };
    let mut replies = platform.fetch_history(channel, &query).await?;
    replies.reverse();
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SlackFile;
    use crate::platform::{ConversationMetadata, UserInfo};
    use crate::MessageRef;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the queries it receives and serves canned messages.
    struct Recorder {
        history: Vec<RawMessage>,
        thread: Vec<RawMessage>,
        queries: Mutex<Vec<HistoryQuery>>,
    }

    impl Recorder {
        fn new(history: Vec<RawMessage>, thread: Vec<RawMessage>) -> Self {
            Self {
                history,
                thread,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatPlatform for Recorder {
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
            query: &HistoryQuery,
        ) -> Result<Vec<RawMessage>, PlatformError> {
            self.queries.lock().unwrap().push(query.clone());
            Ok(self.history.clone())
        }

        async fn fetch_thread_replies(
            &self,
            _channel: &str,
            _thread_ts: &str,
            _limit: u16,
        ) -> Result<Vec<RawMessage>, PlatformError> {
            Ok(self.thread.clone())
        }

        async fn fetch_user_info(&self, _user: &str) -> Result<UserInfo, PlatformError> {
            Ok(UserInfo::default())
        }

        async fn download_file(
            &self,
            _url: &str,
            _expected_content_types: &[&str],
        ) -> Result<Vec<u8>, PlatformError> {
            Ok(Vec::new())
        }
    }

    fn message(text: &str) -> RawMessage {
        RawMessage {
            user: Some("U1".to_string()),
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn dm_event() -> MessageEvent {
        MessageEvent {
            channel: "D123".to_string(),
            channel_kind: ChannelKind::DirectMessage,
            ts: "1700000000.000100".to_string(),
            thread_ts: None,
            user: Some("U1".to_string()),
            bot_id: None,
            subtype: None,
            text: "latest".to_string(),
            files: Vec::<SlackFile>::new(),
        }
    }

    #[tokio::test]
    async fn dm_history_is_windowed_and_chronological() {
        // Platform order: newest first.
        let platform = Recorder::new(vec![message("third"), message("second"), message("first")], vec![]);
        let replies = collect(&platform, &dm_event()).await.unwrap();
        let texts: Vec<&str> = replies.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);

        let queries = platform.queries.lock().unwrap();
        let query = &queries[0];
        assert_eq!(query.limit, DM_HISTORY_LIMIT);
        assert!(query.inclusive);
        let oldest: f64 = query.oldest.as_deref().unwrap().parse().unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        assert!((now - oldest - DM_HISTORY_SECONDS).abs() < 5.0);
    }

    #[tokio::test]
    async fn threads_pull_the_whole_thread() {
        let platform = Recorder::new(vec![], vec![message("parent"), message("reply")]);
        let mut event = dm_event();
        event.channel = "C123".to_string();
        event.channel_kind = ChannelKind::Channel;
        event.thread_ts = Some("1699999999.000001".to_string());
        let replies = collect(&platform, &event).await.unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].text, "parent");
    }

    #[tokio::test]
    async fn channel_mention_outside_a_thread_stands_alone() {
        let platform = Recorder::new(vec![message("noise")], vec![message("noise")]);
        let mut event = dm_event();
        event.channel = "C123".to_string();
        event.channel_kind = ChannelKind::Channel;
        event.text = "<@U0BOT> hello".to_string();
        let replies = collect(&platform, &event).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "<@U0BOT> hello");
        assert_eq!(replies[0].ts.as_deref(), Some("1700000000.000100"));
        // No fetches happened.
        assert!(platform.queries.lock().unwrap().is_empty());
    }
}
