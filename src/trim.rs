//! Context-window budgeting: token counting, per-model input limits, and
//! trimming conversations that no longer fit.

use crate::assemble::{ConversationMessage, Role};
use crate::error::CompletionError;
use tracing::debug;

/// Flat per-attachment token estimate. Providers bill images and documents
/// by rendered tiles/pages; this stands in for the common case.
const ATTACHMENT_TOKENS: usize = 1024;

/// Per-message framing overhead in the chat-completions wire format.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Counts the prompt tokens of a message list. Exact tokenizers are
/// provider-specific; implementations may approximate as long as they
/// over-estimate rather than under-estimate.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, model: &str, messages: &[ConversationMessage]) -> usize;
}

/// Byte-length heuristic: roughly four bytes of text per token, plus framing
/// overhead per message and a flat cost per attachment.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_tokens(&self, _model: &str, messages: &[ConversationMessage]) -> usize {
        let text: usize = messages
            .iter()
            .map(|m| MESSAGE_OVERHEAD_TOKENS + m.content.text_len().div_ceil(4))
            .sum();
        text + ConversationMessage::attachment_count(messages) * ATTACHMENT_TOKENS
    }
}

/// Largest input-token count the model accepts.
pub fn max_input_tokens(model: &str) -> Result<usize, CompletionError> {
    // Longest prefixes first, so e.g. gpt-4o-mini is not shadowed by gpt-4.
    const LIMITS: [(&str, usize); 10] = [
        ("gpt-4.1", 1_047_576),
        ("gpt-4o", 128_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo", 16_385),
        ("o1", 200_000),
        ("o3", 200_000),
        ("claude", 200_000),
        ("gemini", 1_048_576),
        ("gpt-5", 400_000),
    ];
    let bare = model.rsplit('/').next().unwrap_or(model);
    LIMITS
        .iter()
        .find(|(prefix, _)| bare.starts_with(prefix))
        .map(|(_, limit)| *limit)
        .ok_or_else(|| CompletionError::UnsupportedModel(model.to_string()))
}

/// The token budget for one completion call.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_input_tokens: usize,
    pub max_output_tokens: usize,
    /// Fixed cost of the advertised tool schemas, probed once.
    pub tools_tokens: usize,
}

impl ContextBudget {
    /// Tokens available for conversation messages.
    pub fn max_context_tokens(&self) -> usize {
        self.max_input_tokens
            .saturating_sub(self.tools_tokens)
            .saturating_sub(self.max_output_tokens)
            .saturating_sub(1)
    }
}

/// Outcome of a trim pass. `context_tokens` is the final count when the
/// conversation fits, and the last over-budget measurement when it does not,
/// so an over-budget result is detectable as
/// `context_tokens > max_context_tokens`.
#[derive(Debug, Clone, Copy)]
pub struct TrimOutcome {
    pub context_tokens: usize,
    pub max_context_tokens: usize,
}

impl TrimOutcome {
    pub fn overflowed(&self) -> bool {
        self.context_tokens > self.max_context_tokens
    }
}

/// Remove the earliest conversation messages until the list fits the budget.
///
/// Only user, assistant and tool messages are removable; system messages are
/// pinned. After eviction, leading non-user messages and trailing assistant
/// messages are dropped, so the conversation starts on a user turn and ends
/// on a user or tool turn. A list that still exceeds the budget with nothing
/// removable left, or that loses every conversational message to eviction,
/// reports an overflow carrying the last over-budget count.
pub fn fit_within_context_window(
    messages: &mut Vec<ConversationMessage>,
    counter: &dyn TokenCounter,
    model: &str,
    budget: &ContextBudget,
) -> TrimOutcome {
    let max_context_tokens = budget.max_context_tokens();
    let mut over_budget = None;

    loop {
        let num_tokens = counter.count_tokens(model, messages);
        if num_tokens <= max_context_tokens {
            break;
        }
        over_budget = Some(num_tokens);
        let removable = messages
            .iter()
            .position(|m| matches!(m.role, Role::User | Role::Assistant | Role::Tool));
        match removable {
            Some(index) => {
                debug!(index, num_tokens, max_context_tokens, "trimmed a message");
                messages.remove(index);
            }
            // Nothing left to drop; the caller surfaces the overflow.
            None => break,
        }
    }

    // Eviction can leave the list starting with a stranded tool result (its
    // tool-call turn went first) or an assistant turn; endpoints reject both
    // without a user message before them.
    while let Some(index) = messages.iter().position(|m| m.role != Role::System) {
        if messages[index].role == Role::User {
            break;
        }
        messages.remove(index);
    }
    while messages.last().is_some_and(|m| m.role == Role::Assistant) {
        messages.pop();
    }

    // A conversation evicted down to the system message alone cannot be sent
    // as a contextless request; report it as an overflow.
    let context_tokens = match over_budget {
        Some(count) if messages.iter().all(|m| m.role == Role::System) => count,
        _ => counter.count_tokens(model, messages),
    };

    TrimOutcome {
        context_tokens,
        max_context_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::ContentPart;

    /// One token per message, regardless of content.
    struct FlatCounter;

    impl TokenCounter for FlatCounter {
        fn count_tokens(&self, _model: &str, messages: &[ConversationMessage]) -> usize {
            messages.len()
        }
    }

    fn budget(max_context: usize) -> ContextBudget {
        ContextBudget {
            max_input_tokens: max_context + 1,
            max_output_tokens: 0,
            tools_tokens: 0,
        }
    }

    fn conversation(users: usize) -> Vec<ConversationMessage> {
        let mut messages = vec![ConversationMessage::system("sys")];
        for i in 0..users {
            messages.push(ConversationMessage::user(vec![ContentPart::text(format!(
                "message {i}"
            ))]));
        }
        messages
    }

    #[test]
    fn keeps_everything_when_within_budget() {
        let mut messages = conversation(3);
        let outcome = fit_within_context_window(&mut messages, &FlatCounter, "gpt-4o", &budget(10));
        assert_eq!(messages.len(), 4);
        assert_eq!(outcome.context_tokens, 4);
        assert!(!outcome.overflowed());
    }

    #[test]
    fn removes_earliest_non_system_messages_first() {
        let mut messages = conversation(5);
        fit_within_context_window(&mut messages, &FlatCounter, "gpt-4o", &budget(4));
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        // The two oldest user messages are gone.
        assert!(matches!(
            &messages[1].content,
            crate::assemble::MessageContent::Parts(parts) if matches!(
                &parts[0],
                ContentPart::Text { text, .. } if text == "message 2"
            )
        ));
    }

    #[test]
    fn terminates_and_reports_overflow_when_only_system_remains() {
        let mut messages = vec![ConversationMessage::system("an enormous system prompt")];
        let counter = HeuristicTokenCounter;
        let before = counter.count_tokens("gpt-4o", &messages);
        let tight = ContextBudget {
            max_input_tokens: 1,
            max_output_tokens: 0,
            tools_tokens: 0,
        };
        let outcome = fit_within_context_window(&mut messages, &counter, "gpt-4o", &tight);
        // Nothing was removable, so the loop stopped without looping forever
        // and raised the overflow carrying the pre-trim count.
        assert_eq!(messages.len(), 1);
        assert!(outcome.overflowed());
        assert_eq!(outcome.context_tokens, before);
        assert_eq!(outcome.max_context_tokens, 0);
    }

    #[test]
    fn evicting_every_context_message_is_an_overflow() {
        // System alone fits the budget, but a system-only request is not
        // worth sending; the trimmer reports overflow instead of success.
        let mut messages = conversation(1);
        let outcome = fit_within_context_window(&mut messages, &FlatCounter, "gpt-4o", &budget(1));
        assert_eq!(messages.len(), 1);
        assert!(outcome.overflowed());
        assert_eq!(outcome.context_tokens, 2);
    }

    #[test]
    fn eviction_never_leaves_a_leading_tool_result() {
        // Evicting the assistant tool-call turn strands its tool result at
        // the head of the list; the cleanup pass drops it.
        let mut messages = vec![
            ConversationMessage::system("sys"),
            ConversationMessage::assistant("calling a tool"),
            ConversationMessage::tool_result(
                "call_1".to_string(),
                "echo".to_string(),
                "hi".to_string(),
            ),
            ConversationMessage::user(vec![ContentPart::text("and now?")]),
        ];
        let outcome = fit_within_context_window(&mut messages, &FlatCounter, "gpt-4o", &budget(3));
        assert!(!outcome.overflowed());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::User);
    }

    #[test]
    fn trimming_is_monotonic() {
        // A smaller budget never yields a longer conversation.
        let mut previous_len = usize::MAX;
        for max_context in (2..=8).rev() {
            let mut messages = conversation(6);
            fit_within_context_window(&mut messages, &FlatCounter, "gpt-4o", &budget(max_context));
            assert!(messages.len() <= previous_len);
            previous_len = messages.len();
        }
    }

    #[test]
    fn drops_trailing_assistant_messages() {
        let mut messages = conversation(2);
        messages.push(ConversationMessage::assistant("half-finished"));
        messages.push(ConversationMessage::assistant("also dangling"));
        fit_within_context_window(&mut messages, &FlatCounter, "gpt-4o", &budget(10));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages.last().unwrap().role, Role::User);
    }

    #[test]
    fn model_limits() {
        assert_eq!(max_input_tokens("gpt-4o").unwrap(), 128_000);
        assert_eq!(max_input_tokens("gpt-4o-mini").unwrap(), 128_000);
        assert_eq!(max_input_tokens("gpt-4.1-mini").unwrap(), 1_047_576);
        assert_eq!(max_input_tokens("gemini/gemini-2.0-flash").unwrap(), 1_048_576);
        assert!(max_input_tokens("made-up-model").is_err());
    }

    #[test]
    fn budget_subtracts_reservations() {
        let budget = ContextBudget {
            max_input_tokens: 128_000,
            max_output_tokens: 1024,
            tools_tokens: 500,
        };
        assert_eq!(budget.max_context_tokens(), 126_475);
    }

    #[test]
    fn heuristic_counts_attachments_flat() {
        let counter = HeuristicTokenCounter;
        let plain = vec![ConversationMessage::user(vec![ContentPart::text("hi")])];
        let with_image = vec![ConversationMessage::user(vec![
            ContentPart::text("hi"),
            ContentPart::image_url("data:image/png;base64,AAAA"),
        ])];
        let plain_tokens = counter.count_tokens("gpt-4o", &plain);
        let image_tokens = counter.count_tokens("gpt-4o", &with_image);
        assert_eq!(image_tokens, plain_tokens + ATTACHMENT_TOKENS);
    }
}
