//! OpenAI-compatible chat-completions backend over reqwest, with SSE
//! streaming.
//!
//! Works against any endpoint speaking the chat-completions dialect
//! (`{api_base}/chat/completions`), which is also how proxies front other
//! providers.

use crate::assemble::ConversationMessage;
use crate::completion::{
    CompletionCall, CompletionChunk, CompletionProvider, CompletionStream, ToolCallFragment,
};
use crate::error::CompletionError;
use crate::tools::ToolSchema;
use async_trait::async_trait;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    top_p: u32,
    n: u32,
    max_tokens: u32,
    temperature: f32,
    presence_penalty: u32,
    frequency_penalty: u32,
    user: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSchema]>,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ProbeResponse {
    usage: ProbeUsage,
}

#[derive(Deserialize)]
struct ProbeUsage {
    prompt_tokens: usize,
}

impl OpenAiProvider {
    pub fn new(api_base: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            api_key,
        }
    }

    fn request(&self, body: &CompletionRequest<'_>) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    async fn send(
        &self,
        body: &CompletionRequest<'_>,
    ) -> Result<reqwest::Response, CompletionError> {
        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| CompletionError::ProviderRequest(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::ProviderRequest(format!(
                "status {status}: {body}"
            )));
        }
        Ok(response)
    }
}

/// One `data:` payload into a chunk. Returns `None` for the `[DONE]`
/// terminator and for keepalive lines.
fn parse_sse_line(line: &str) -> Result<Option<CompletionChunk>, CompletionError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        // Comments and blank keepalives between events.
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let response: StreamResponse = serde_json::from_str(data)
        .map_err(|e| CompletionError::InvalidResponse(format!("bad stream payload: {e}")))?;

    let mut chunk = CompletionChunk::default();
    for choice in response.choices {
        if let Some(content) = choice.delta.content {
            chunk.delta_text.push_str(&content);
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let function = call.function.unwrap_or(StreamFunction {
                name: None,
                arguments: None,
            });
            chunk.tool_call_fragments.push(ToolCallFragment {
                index: call.index.unwrap_or(0),
                id: call.id,
                name: function.name,
                arguments_fragment: function.arguments.unwrap_or_default(),
            });
        }
        if choice.finish_reason.is_some() {
            chunk.finish_reason = choice.finish_reason;
        }
    }
    Ok(Some(chunk))
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn stream_completion(
        &self,
        call: CompletionCall,
    ) -> Result<CompletionStream, CompletionError> {
        let body = CompletionRequest {
            model: &call.model,
            messages: &call.messages,
            top_p: 1,
            n: 1,
            max_tokens: call.max_output_tokens,
            temperature: call.temperature,
            presence_penalty: 0,
            frequency_penalty: 0,
            user: &call.user,
            stream: true,
            tools: (!call.tools.is_empty()).then_some(call.tools.as_slice()),
        };
        let response = self.send(&body).await?;

        let stream = async_stream::try_stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(piece) = bytes.next().await {
                let piece =
                    piece.map_err(|e| CompletionError::ProviderRequest(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    if let Some(chunk) = parse_sse_line(&line)? {
                        yield chunk;
                    }
                }
            }
            // A final payload without a trailing newline.
            if !buffer.trim().is_empty() {
                if let Some(chunk) = parse_sse_line(&buffer)? {
                    yield chunk;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn count_prompt_tokens(
        &self,
        messages: &[ConversationMessage],
        model: &str,
        user: &str,
        tools: &[ToolSchema],
    ) -> Result<usize, CompletionError> {
        let body = CompletionRequest {
            model,
            messages,
            top_p: 1,
            n: 1,
            max_tokens: 1,
            temperature: 0.0,
            presence_penalty: 0,
            frequency_penalty: 0,
            user,
            stream: false,
            tools: (!tools.is_empty()).then_some(tools),
        };
        let response = self.send(&body).await?;
        let probe: ProbeResponse = response.json().await.map_err(|e| {
            warn!(%e, "provider probe returned an unexpected body");
            CompletionError::InvalidResponse(e.to_string())
        })?;
        Ok(probe.usage.prompt_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let chunk = parse_sse_line(
            r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.delta_text, "Hel");
        assert!(chunk.tool_call_fragments.is_empty());
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn parses_tool_call_fragments() {
        let chunk = parse_sse_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"n-0-search","arguments":"{\"q"}}]},"finish_reason":null}]}"#,
        )
        .unwrap()
        .unwrap();
        let fragment = &chunk.tool_call_fragments[0];
        assert_eq!(fragment.index, 0);
        assert_eq!(fragment.id.as_deref(), Some("call_a"));
        assert_eq!(fragment.name.as_deref(), Some("n-0-search"));
        assert_eq!(fragment.arguments_fragment, "{\"q");
    }

    #[test]
    fn parses_finish_reason() {
        let chunk = parse_sse_line(
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn skips_done_and_keepalives() {
        assert!(parse_sse_line("data: [DONE]").unwrap().is_none());
        assert!(parse_sse_line("").unwrap().is_none());
        assert!(parse_sse_line(": keepalive").unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(parse_sse_line("data: {not json").is_err());
    }
}
