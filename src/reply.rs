//! The streaming reply engine.
//!
//! One session per qualifying event: post a placeholder, stream the model's
//! answer into it with buffered edits, switch to a fresh message when the
//! current one is full, run requested tools, and repeat until the model
//! finishes or the budget runs out. Session failures are rendered into the
//! placeholder; nothing here propagates to the event dispatcher.

use crate::assemble::{Assembler, ConversationMessage, set_cache_points_if_needed};
use crate::classify;
use crate::completion::{
    CompletionCall, CompletionProvider, CompletionStream, ToolCallAccumulator,
};
use crate::config::{ModelConfig, ReplyConfig};
use crate::error::ReplyError;
use crate::history;
use crate::normalize::{self, Normalizer};
use crate::platform::{ChatPlatform, ConversationMetadata};
use crate::tools::{ToolDispatchError, ToolEnvironment};
use crate::trim::{self, ContextBudget, TokenCounter, fit_within_context_window};
use crate::{BotIdentity, MessageEvent, MessageRef};
use futures::StreamExt as _;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// An in-progress reply may not grow past this many UTF-8 bytes; past it the
/// rest of the answer continues in a fresh message.
pub const WIP_BYTE_CEILING: usize = 3500;

/// How many tool-dispatch rounds one session may run.
pub const MAX_TOOL_ROUNDS: usize = 10;

/// How many continuation messages one stream may spill into.
pub const MAX_CONTINUATIONS: usize = 10;

/// The in-progress reply: which platform message it is, and the text last
/// written into it (without the loading glyph).
struct WipState {
    message: MessageRef,
    text: String,
}

type Wip = Arc<Mutex<WipState>>;

enum StreamOutcome {
    /// The stream ended.
    Complete,
    /// The in-progress message hit the byte ceiling mid-stream.
    TooLong,
}

pub struct ReplyEngine {
    platform: Arc<dyn ChatPlatform>,
    provider: Arc<dyn CompletionProvider>,
    counter: Arc<dyn TokenCounter>,
    tools: Arc<ToolEnvironment>,
    assembler: Arc<Assembler>,
    normalizer: Arc<Normalizer>,
    identity: BotIdentity,
    model: ModelConfig,
    reply: ReplyConfig,
    prompt_caching: bool,
}

impl ReplyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        provider: Arc<dyn CompletionProvider>,
        counter: Arc<dyn TokenCounter>,
        tools: Arc<ToolEnvironment>,
        assembler: Arc<Assembler>,
        normalizer: Arc<Normalizer>,
        identity: BotIdentity,
        model: ModelConfig,
        reply: ReplyConfig,
        prompt_caching: bool,
    ) -> Self {
        Self {
            platform,
            provider,
            counter,
            tools,
            assembler,
            normalizer,
            identity,
            model,
            reply,
            prompt_caching,
        }
    }

    /// Handle one inbound event end to end. Never fails: everything after
    /// the placeholder exists is rendered into it, and earlier errors are
    /// logged.
    pub async fn handle_event(&self, event: MessageEvent) {
        if let Err(error) = self.respond(&event).await {
            error!(channel = %event.channel, %error, "reply session failed before a placeholder existed");
        }
    }

    async fn respond(&self, event: &MessageEvent) -> crate::Result<()> {
        let Some(decision) =
            classify::classify(self.platform.as_ref(), &self.identity, event).await?
        else {
            return Ok(());
        };
        let Some(user) = event.user.clone() else {
            warn!(channel = %event.channel, "event has no resolvable user");
            return Ok(());
        };
        info!(channel = %event.channel, thread_ts = ?decision.thread_ts, "starting a reply session");

        let metadata =
            ConversationMetadata::new(vec![self.assembler.system_message()], Some(user.clone()));
        let message = self
            .platform
            .post_message(
                &event.channel,
                decision.thread_ts.as_deref(),
                &self.reply.loading_text,
                Some(&metadata),
            )
            .await?;
        let wip: Wip = Arc::new(Mutex::new(WipState {
            message,
            text: self.reply.loading_text.clone(),
        }));

        let result = self
            .run_session(event, decision.thread_ts.as_deref(), &user, &wip)
            .await;
        if let Err(reply_error) = result {
            self.render_failure(&wip, &reply_error).await;
        }
        Ok(())
    }

    async fn run_session(
        &self,
        event: &MessageEvent,
        thread_ts: Option<&str>,
        user: &str,
        wip: &Wip,
    ) -> Result<(), ReplyError> {
        let replies = history::collect(self.platform.as_ref(), event).await?;
        let mut messages = self.assembler.assemble(&replies).await;
        let (messages_tokens, tools_tokens) = self.trim(&mut messages).await?;
        set_cache_points_if_needed(
            &mut messages,
            messages_tokens + tools_tokens,
            self.prompt_caching,
        );

        let deadline = Instant::now() + self.model.timeout;
        let channel = &event.channel;

        for round in 0..MAX_TOOL_ROUNDS {
            let call = CompletionCall {
                model: self.model.model.clone(),
                messages: messages.clone(),
                max_output_tokens: self.model.max_output_tokens,
                temperature: self.model.temperature,
                user: user.to_string(),
                tools: self.tools.all_schemas(),
            };
            let mut stream = self.provider.stream_completion(call).await?;

            // Tool-call fragments survive continuations: the accumulator
            // spans every message the stream spills into.
            let mut accumulator = ToolCallAccumulator::default();
            for continuation in 0..MAX_CONTINUATIONS {
                let mut assistant_text = String::new();
                let outcome = self
                    .consume_stream(&mut stream, &mut assistant_text, &mut accumulator, wip, deadline)
                    .await;
                // Keep what streamed in even when the outcome is an error.
                messages.push(ConversationMessage::assistant(assistant_text));
                match outcome? {
                    StreamOutcome::Complete => break,
                    StreamOutcome::TooLong if continuation + 1 == MAX_CONTINUATIONS => {
                        warn!(channel = %channel, "hit the continuation cap; draining the rest of the stream");
                        let rest = drain_stream(&mut stream, &mut accumulator, deadline).await?;
                        messages.push(ConversationMessage::assistant(rest));
                        break;
                    }
                    StreamOutcome::TooLong => {
                        let message = self
                            .platform
                            .post_message(channel, thread_ts, &self.reply.loading_glyph, None)
                            .await?;
                        let mut state = wip.lock().await;
                        *state = WipState {
                            message,
                            text: self.reply.loading_glyph.clone(),
                        };
                    }
                }
            }

            let tool_calls = accumulator.into_calls();
            if tool_calls.is_empty() {
                return Ok(());
            }
            if round + 1 == MAX_TOOL_ROUNDS {
                warn!(channel = %channel, "hit the tool round cap; ending the exchange");
                return Ok(());
            }

            // The streamed text is already on screen; tool output needs its
            // own placeholder.
            if wip.lock().await.text != self.reply.loading_text {
                let message = self
                    .platform
                    .post_message(channel, thread_ts, &self.reply.loading_text, None)
                    .await?;
                let mut state = wip.lock().await;
                *state = WipState {
                    message,
                    text: self.reply.loading_text.clone(),
                };
            }

            if let Some(last) = messages.last_mut() {
                last.tool_calls = Some(tool_calls.clone());
            }
            for call in &tool_calls {
                debug!(tool = %call.function.name, "dispatching a tool call");
                let content = match self.tools.dispatch(call).await {
                    Ok(content) => content,
                    Err(ToolDispatchError::Auth) => return Err(ReplyError::ToolAuth),
                    Err(ToolDispatchError::Failed(message)) => format!("Error: {message}"),
                };
                messages.push(ConversationMessage::tool_result(
                    call.id.clone(),
                    call.function.name.clone(),
                    content,
                ));
            }
            self.trim(&mut messages).await?;
        }
        Ok(())
    }

    /// Consume the stream until it finishes or the current message fills up,
    /// appending text to `assistant_text` and flushing to the platform in
    /// the background. All flushes are joined before the final, glyphless
    /// update.
    async fn consume_stream(
        &self,
        stream: &mut CompletionStream,
        assistant_text: &mut String,
        accumulator: &mut ToolCallAccumulator,
        wip: &Wip,
        deadline: Instant,
    ) -> Result<StreamOutcome, ReplyError> {
        let mut flushes: Vec<JoinHandle<()>> = Vec::new();
        let mut buffered_chars = 0usize;
        let mut finished = false;
        let mut too_long = false;
        let mut failure: Option<ReplyError> = None;

        while !finished {
            let chunk = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    failure = Some(ReplyError::Timeout);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(error))) => {
                    failure = Some(error.into());
                    break;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            for fragment in chunk.tool_call_fragments {
                accumulator.push(fragment);
            }
            finished = chunk.finish_reason.is_some();

            if !chunk.delta_text.is_empty() {
                assistant_text.push_str(&chunk.delta_text);
                buffered_chars += chunk.delta_text.chars().count();
                if buffered_chars >= self.reply.flush_buffer_chars {
                    let rendered = self.render(assistant_text);
                    let overflowing = rendered.len() > WIP_BYTE_CEILING;
                    flushes.push(self.spawn_flush(wip.clone(), rendered));
                    buffered_chars = 0;
                    if !finished && overflowing {
                        too_long = true;
                        break;
                    }
                }
            }
        }

        for flush in flushes {
            if let Err(error) = flush.await {
                debug!(%error, "a flush task panicked");
            }
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        // Final update drops the loading glyph.
        if !assistant_text.is_empty() {
            let rendered = self.render(assistant_text);
            let mut state = wip.lock().await;
            state.text = rendered.clone();
            let message = state.message.clone();
            self.platform
                .update_message(&message, &rendered, None)
                .await?;
        }

        if too_long {
            Ok(StreamOutcome::TooLong)
        } else {
            Ok(StreamOutcome::Complete)
        }
    }

    /// Background edit of the in-progress message with a rendered snapshot
    /// of the text so far, loading glyph appended. The lock is held across
    /// the API call so flushes reach the platform in order.
    fn spawn_flush(&self, wip: Wip, rendered: String) -> JoinHandle<()> {
        let platform = Arc::clone(&self.platform);
        let glyph = self.reply.loading_glyph.clone();
        tokio::spawn(async move {
            let mut state = wip.lock().await;
            state.text = rendered.clone();
            let message = state.message.clone();
            if let Err(error) = platform
                .update_message(&message, &format!("{rendered}{glyph}"), None)
                .await
            {
                debug!(%error, "failed to update the in-progress reply");
            }
        })
    }

    fn render(&self, content: &str) -> String {
        let text = normalize::format_assistant_reply(content);
        self.normalizer.markdown_to_slack(&text)
    }

    async fn trim(
        &self,
        messages: &mut Vec<ConversationMessage>,
    ) -> Result<(usize, usize), ReplyError> {
        let max_input_tokens = trim::max_input_tokens(&self.model.model)?;
        let tools_tokens = self
            .tools
            .tools_token_cost(self.provider.as_ref())
            .await?;
        let budget = ContextBudget {
            max_input_tokens,
            max_output_tokens: self.model.max_output_tokens as usize,
            tools_tokens,
        };
        let outcome =
            fit_within_context_window(messages, self.counter.as_ref(), &self.model.model, &budget);
        if outcome.overflowed() {
            return Err(ReplyError::Overflow {
                used_tokens: outcome.context_tokens,
                max_tokens: outcome.max_context_tokens,
            });
        }
        Ok((outcome.context_tokens, tools_tokens))
    }

    /// Render a session failure into the placeholder, under whatever text
    /// already streamed in.
    async fn render_failure(&self, wip: &Wip, reply_error: &ReplyError) {
        let state = wip.lock().await;
        let current = state.text.clone();
        let message = state.message.clone();
        drop(state);

        let text = match reply_error {
            ReplyError::Timeout => format!(
                "{current}\n\n:warning: Apologies! It seems that the AI didn't respond within \
                 the {}-second timeframe. Please try your request again later. If you wish to \
                 extend the timeout limit, you may consider deploying this app with customized \
                 settings on your infrastructure. :bow:",
                self.model.timeout.as_secs()
            ),
            other => format!("{current}\n\n:warning: Failed to reply: {other}"),
        };
        warn!(%reply_error, "rendering a failed reply session");
        if let Err(error) = self.platform.update_message(&message, &text, None).await {
            error!(%error, "failed to render the failure message");
        }
    }
}

/// Consume the remainder of a stream without touching the platform. Text and
/// tool-call fragments in the tail still count; only the on-screen updates
/// stop.
async fn drain_stream(
    stream: &mut CompletionStream,
    accumulator: &mut ToolCallAccumulator,
    deadline: Instant,
) -> Result<String, ReplyError> {
    let mut text = String::new();
    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return Err(ReplyError::Timeout),
            Ok(None) => return Ok(text),
            Ok(Some(Err(error))) => return Err(error.into()),
            Ok(Some(Ok(chunk))) => {
                for fragment in chunk.tool_call_fragments {
                    accumulator.push(fragment);
                }
                text.push_str(&chunk.delta_text);
                if chunk.finish_reason.is_some() {
                    return Ok(text);
                }
            }
        }
    }
}
