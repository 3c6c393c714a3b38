//! The completion-provider contract: a streaming chat-completions backend
//! behind a trait, plus the incremental tool-call assembly shared by every
//! backend.

use crate::assemble::ConversationMessage;
use crate::error::CompletionError;
use crate::tools::ToolSchema;
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A fully assembled tool call, in the chat-completions wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded argument object, as streamed by the provider.
    pub arguments: String,
}

/// A fragment of a tool call, as deltas arrive. `index` addresses the call
/// within the turn; id and name arrive once, arguments in pieces.
#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_fragment: String,
}

/// One streamed chunk of an assistant turn.
#[derive(Debug, Clone, Default)]
pub struct CompletionChunk {
    pub delta_text: String,
    pub tool_call_fragments: Vec<ToolCallFragment>,
    pub finish_reason: Option<String>,
}

/// The parameters of one streaming completion call.
#[derive(Debug, Clone)]
pub struct CompletionCall {
    pub model: String,
    pub messages: Vec<ConversationMessage>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// End-user identifier forwarded to the provider.
    pub user: String,
    pub tools: Vec<ToolSchema>,
}

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionChunk, CompletionError>> + Send>>;

/// A streaming chat-completions backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Start a streaming completion.
    async fn stream_completion(&self, call: CompletionCall)
        -> Result<CompletionStream, CompletionError>;

    /// Count the prompt tokens of a non-streaming probe call. Used to price
    /// the tool schemas by differencing two probes.
    async fn count_prompt_tokens(
        &self,
        messages: &[ConversationMessage],
        model: &str,
        user: &str,
        tools: &[ToolSchema],
    ) -> Result<usize, CompletionError>;
}

/// Accumulates tool-call fragments across chunks into complete calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<PartialToolCall>,
}

#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, fragment: ToolCallFragment) {
        if fragment.index >= self.calls.len() {
            self.calls.resize_with(fragment.index + 1, Default::default);
        }
        let call = &mut self.calls[fragment.index];
        if let Some(id) = fragment.id {
            call.id = id;
        }
        if let Some(name) = fragment.name {
            call.name.push_str(&name);
        }
        call.arguments.push_str(&fragment.arguments_fragment);
    }

    /// The assembled calls, in index order.
    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                kind: "function".to_string(),
                function: ToolCallFunction {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect()
    }
}
