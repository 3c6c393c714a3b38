//! Text normalization between Slack mrkdwn and Markdown, plus mention
//! stripping, HTML-entity unescaping, redaction, and display formatting of
//! assistant replies.
//!
//! Slack escapes `<`, `>` and `&` in message text and uses its own mrkdwn
//! dialect (`*bold*`, `_italic_`, `~strike~`). Models emit Markdown. The
//! converters here translate between the two without touching code blocks or
//! inline code spans.
//!
//! See <https://api.slack.com/reference/surfaces/formatting>.

use crate::config::{FeatureFlags, RedactionConfig};
use crate::error::{ConfigError, Result};
use regex::Regex;
use std::sync::LazyLock;

/// Fenced code blocks and inline code spans. Text inside these is never
/// rewritten by the markup converters.
static CODE_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.+?```|`[^`\n]+?`").expect("static regex"));

static LEADING_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\n+").expect("static regex"));

/// A user-id prefix the model sometimes echoes back from the prompt format.
static ECHOED_USER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<@U.*?>\s?:\s?").expect("static regex"));

/// Language tags on code fences; Slack does not render them, so they are
/// stripped before display.
static FENCE_LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)```[ \t]*(?:rust|ruby|scala|kotlin|java|go|swift|objective-?c|c\+\+|cpp|csharp|cmake|c|matlab|json|latex|lua|bash|zsh|sh|sql|php|perl|javascript|typescript|python)\n",
    )
    .expect("static regex")
});

/// Compiled normalization pipeline for one bot identity and configuration.
pub struct Normalizer {
    translate_markdown: bool,
    redaction_enabled: bool,
    mention: Regex,
    redactions: Vec<(Regex, &'static str)>,
}

impl Normalizer {
    pub fn new(
        bot_user_id: &str,
        features: &FeatureFlags,
        redaction: &RedactionConfig,
    ) -> Result<Self> {
        let mention = Regex::new(&format!(r"<@{}>\s*", regex::escape(bot_user_id)))
            .map_err(|e| ConfigError::Invalid(format!("bot mention pattern: {e}")))?;
        let sources: [(&str, &'static str); 5] = [
            (&redaction.email_pattern, "[EMAIL]"),
            (&redaction.credit_card_pattern, "[CREDIT CARD]"),
            (&redaction.phone_pattern, "[PHONE]"),
            (&redaction.ssn_pattern, "[SSN]"),
            (&redaction.user_defined_pattern, "[REDACTED]"),
        ];
        let mut redactions = Vec::with_capacity(sources.len());
        for (pattern, replacement) in sources {
            let re = Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("redaction pattern {replacement}: {e}"))
            })?;
            redactions.push((re, replacement));
        }
        Ok(Self {
            translate_markdown: features.translate_markdown,
            redaction_enabled: features.redaction_enabled,
            mention,
            redactions,
        })
    }

    /// Remove every occurrence of the bot's own mention token, including
    /// trailing whitespace.
    pub fn strip_bot_mentions(&self, text: &str) -> String {
        self.mention.replace_all(text, "").into_owned()
    }

    /// Apply the redaction patterns in order. A no-op unless enabled.
    pub fn redact(&self, text: &str) -> String {
        if !self.redaction_enabled {
            return text.to_string();
        }
        let mut out = text.to_string();
        for (re, replacement) in &self.redactions {
            out = re.replace_all(&out, *replacement).into_owned();
        }
        out
    }

    /// Slack mrkdwn to Markdown, when markdown translation is enabled.
    pub fn slack_to_markdown(&self, text: &str) -> String {
        if !self.translate_markdown {
            return text.to_string();
        }
        transform_outside_code(text, |part| {
            let part = rewrite_delimited(part, "*", &[], "**", "**");
            let part = rewrite_delimited(&part, "_", &[], "*", "*");
            rewrite_delimited(&part, "~", &[], "~~", "~~")
        })
    }

    /// Markdown to Slack mrkdwn, when markdown translation is enabled.
    pub fn markdown_to_slack(&self, text: &str) -> String {
        if !self.translate_markdown {
            return text.to_string();
        }
        transform_outside_code(text, |part| {
            let part = rewrite_delimited(part, "***", &[], "_*", "*_");
            let part = rewrite_delimited(&part, "*", &['*', '_'], "_", "_");
            let part = rewrite_delimited(&part, "**", &[], "*", "*");
            let part = rewrite_delimited(&part, "__", &[], "*", "*");
            rewrite_delimited(&part, "~~", &[], "~", "~")
        })
    }
}

/// Undo Slack's HTML escaping. `&amp;` last, so `&amp;lt;` round-trips as the
/// user typed it.
pub fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Clean up streamed assistant text for display: leading newlines, an echoed
/// `<@U...>: ` prefix, and code-fence language tags Slack would render
/// literally.
pub fn format_assistant_reply(content: &str) -> String {
    let content = LEADING_NEWLINES.replace(content, "");
    let content = ECHOED_USER_PREFIX.replace(&content, "");
    FENCE_LANGUAGE_TAG.replace_all(&content, "```\n").into_owned()
}

/// Apply `transform` to every stretch of text outside code blocks and inline
/// code spans, keeping the code spans byte-for-byte.
fn transform_outside_code(text: &str, transform: impl Fn(&str) -> String) -> String {
    let mut result = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in CODE_SPAN.find_iter(text) {
        result.push_str(&transform(&text[cursor..span.start()]));
        result.push_str(span.as_str());
        cursor = span.end();
    }
    result.push_str(&transform(&text[cursor..]));
    result
}

/// Rewrite `<delim>inner<delim>` as `<open>inner<close>`.
///
/// A match requires: inner is non-empty, starts and ends with
/// non-whitespace, and contains neither a newline nor the delimiter
/// character. When `guard` is non-empty, the characters immediately before
/// the opening and after the closing delimiter must not be guard characters
/// (this keeps a single `*` pass from eating the edges of `**bold**`).
fn rewrite_delimited(text: &str, delim: &str, guard: &[char], open: &str, close: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let dchars: Vec<char> = delim.chars().collect();
    let dlen = dchars.len();
    let forbid = dchars[0];
    let at = |i: usize| -> bool { chars[i..].starts_with(&dchars[..]) };

    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let preceded_by_guard = i > 0 && guard.contains(&chars[i - 1]);
        if !at(i) || preceded_by_guard {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        // Candidate opener. The inner text runs until the next delimiter
        // character; a newline or an empty/whitespace-edged inner cancels it.
        let start = i + dlen;
        let mut end = start;
        while end < chars.len() && chars[end] != forbid && chars[end] != '\n' {
            end += 1;
        }
        let inner_ok = end > start
            && end + dlen <= chars.len()
            && at(end)
            && !chars[start].is_whitespace()
            && !chars[end - 1].is_whitespace()
            && !(end + dlen < chars.len() && guard.contains(&chars[end + dlen]));
        if inner_ok {
            out.push_str(open);
            out.extend(&chars[start..end]);
            out.push_str(close);
            i = end + dlen;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer(translate_markdown: bool, redaction_enabled: bool) -> Normalizer {
        let features = FeatureFlags {
            translate_markdown,
            redaction_enabled,
            ..Default::default()
        };
        Normalizer::new("U0BOT123", &features, &RedactionConfig::default()).unwrap()
    }

    #[test]
    fn strips_all_bot_mentions() {
        let n = normalizer(false, false);
        assert_eq!(
            n.strip_bot_mentions("<@U0BOT123> hello <@U0BOT123>  there"),
            "hello there"
        );
        assert_eq!(n.strip_bot_mentions("<@U0OTHER> hi"), "<@U0OTHER> hi");
    }

    #[test]
    fn unescapes_entities_in_order() {
        assert_eq!(unescape_entities("&lt;tag&gt; &amp; more"), "<tag> & more");
        // `&amp;lt;` was the user literally typing `&lt;`.
        assert_eq!(unescape_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn redacts_in_declared_order() {
        let n = normalizer(false, true);
        assert_eq!(
            n.redact("mail me at a.user@example.com or call 555-123-4567"),
            "mail me at [EMAIL] or call [PHONE]"
        );
        assert_eq!(n.redact("card 4111 1111 1111 1111"), "card [CREDIT CARD]");
        assert_eq!(n.redact("ssn 123-45-6789"), "ssn [SSN]");
    }

    #[test]
    fn redaction_disabled_is_identity() {
        let n = normalizer(false, false);
        let text = "mail me at a.user@example.com";
        assert_eq!(n.redact(text), text);
    }

    #[test]
    fn redaction_is_idempotent() {
        let n = normalizer(false, true);
        let once = n.redact("reach me: a.user@example.com / 555-123-4567");
        assert_eq!(n.redact(&once), once);
    }

    #[test]
    fn slack_to_markdown_basics() {
        let n = normalizer(true, false);
        assert_eq!(n.slack_to_markdown("*bold* text"), "**bold** text");
        assert_eq!(n.slack_to_markdown("_italic_ text"), "*italic* text");
        assert_eq!(n.slack_to_markdown("~strike~ text"), "~~strike~~ text");
    }

    #[test]
    fn markdown_to_slack_basics() {
        let n = normalizer(true, false);
        assert_eq!(n.markdown_to_slack("**bold** text"), "*bold* text");
        assert_eq!(n.markdown_to_slack("*italic* text"), "_italic_ text");
        assert_eq!(n.markdown_to_slack("__bold__ text"), "*bold* text");
        assert_eq!(n.markdown_to_slack("~~strike~~ text"), "~strike~ text");
        assert_eq!(n.markdown_to_slack("***both*** text"), "_*both*_ text");
    }

    #[test]
    fn conversion_round_trips_simple_markup() {
        let n = normalizer(true, false);
        let slack = "a *bold* and _italic_ and ~gone~ word";
        assert_eq!(n.markdown_to_slack(&n.slack_to_markdown(slack)), slack);
    }

    #[test]
    fn whitespace_edges_do_not_match() {
        let n = normalizer(true, false);
        assert_eq!(n.slack_to_markdown("* not bold *"), "* not bold *");
        assert_eq!(n.slack_to_markdown("2 * 3 * 4"), "2 * 3 * 4");
        assert_eq!(n.markdown_to_slack("a ** b ** c"), "a ** b ** c");
    }

    #[test]
    fn markup_never_spans_newlines() {
        let n = normalizer(true, false);
        let text = "*first\nsecond*";
        assert_eq!(n.slack_to_markdown(text), text);
    }

    #[test]
    fn code_spans_are_untouched() {
        let n = normalizer(true, false);
        assert_eq!(
            n.slack_to_markdown("see `*raw*` and *bold*"),
            "see `*raw*` and **bold**"
        );
        let fenced = "```\nlet x = a * b * c;\n```";
        assert_eq!(n.markdown_to_slack(fenced), fenced);
        assert_eq!(
            n.markdown_to_slack("**hi**\n```\n**not converted**\n```\n**bye**"),
            "*hi*\n```\n**not converted**\n```\n*bye*"
        );
    }

    #[test]
    fn translate_disabled_is_identity() {
        let n = normalizer(false, false);
        assert_eq!(n.slack_to_markdown("*bold*"), "*bold*");
        assert_eq!(n.markdown_to_slack("**bold**"), "**bold**");
    }

    #[test]
    fn formats_assistant_reply_for_display() {
        assert_eq!(format_assistant_reply("\n\nhello"), "hello");
        assert_eq!(format_assistant_reply("<@U12345> : hello"), "hello");
        assert_eq!(
            format_assistant_reply("```python\nprint(1)\n```"),
            "```\nprint(1)\n```"
        );
        assert_eq!(
            format_assistant_reply("```Rust\nfn main() {}\n```"),
            "```\nfn main() {}\n```"
        );
        assert_eq!(
            format_assistant_reply("```c++\nint x;\n```"),
            "```\nint x;\n```"
        );
    }

    #[test]
    fn formatting_keeps_unknown_fence_tags() {
        let text = "```brainfuck\n+++\n```";
        assert_eq!(format_assistant_reply(text), text);
    }
}
