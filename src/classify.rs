//! Event classification: deciding whether an inbound message deserves a
//! reply, and where the reply should be anchored.

use crate::error::PlatformError;
use crate::platform::{ChatPlatform, HistoryQuery};
use crate::{BotIdentity, ChannelKind, EventSubtype, MessageEvent, ReplyDecision};
use tracing::debug;

/// Decide whether `event` should get a reply.
///
/// Bot-authored posts and edit/delete subtypes never get one. Direct
/// messages always do. Channel messages need the bot mentioned, either in
/// the message itself or in the parent of the thread it belongs to.
///
/// The reply anchor is the event's thread when it has one; a channel message
/// outside a thread starts a new thread under itself; a top-level direct
/// message is answered inline.
pub async fn classify(
    platform: &dyn ChatPlatform,
    identity: &BotIdentity,
    event: &MessageEvent,
) -> Result<Option<ReplyDecision>, PlatformError> {
    if event.bot_id.is_some() || event.user.as_deref() == Some(identity.user_id.as_str()) {
        return Ok(None);
    }
    if matches!(
        event.subtype,
        Some(EventSubtype::Changed) | Some(EventSubtype::Deleted)
    ) {
        debug!(channel = %event.channel, "skipping an edit/delete event");
        return Ok(None);
    }

    let addressed = mentions_bot(identity, &event.text)
        || event.channel_kind == ChannelKind::DirectMessage
        || parent_mentions_bot(platform, identity, event).await?;
    if !addressed {
        return Ok(None);
    }

    let thread_ts = match (&event.thread_ts, event.channel_kind) {
        (Some(thread_ts), _) => Some(thread_ts.clone()),
        (None, ChannelKind::Channel) => Some(event.ts.clone()),
        (None, ChannelKind::DirectMessage) => None,
    };
    Ok(Some(ReplyDecision { thread_ts }))
}

fn mentions_bot(identity: &BotIdentity, text: &str) -> bool {
    text.contains(&identity.mention())
}

/// Whether the parent post of the event's thread mentions the bot. `false`
/// when the event is not in a thread.
async fn parent_mentions_bot(
    platform: &dyn ChatPlatform,
    identity: &BotIdentity,
    event: &MessageEvent,
) -> Result<bool, PlatformError> {
    let Some(thread_ts) = &event.thread_ts else {
        return Ok(false);
    };
    let query = HistoryQuery {
        latest: Some(thread_ts.clone()),
        oldest: None,
        limit: 1,
        inclusive: true,
    };
    let parents = platform.fetch_history(&event.channel, &query).await?;
    Ok(parents
        .first()
        .is_some_and(|parent| mentions_bot(identity, &parent.text)))
}
