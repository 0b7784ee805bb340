//! Streaming chat-completions backend
//!
//! OpenAI-compatible Chat Completions client with SSE stream decoding.
//! Assistant text and tool-call fragments are accumulated across delta
//! frames into one `TurnResult`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use super::{ChatBackend, NextSpeaker, TurnInput, TurnResult};
use crate::session::{Message, Role, ToolCallRequest};

pub struct ApiBackend {
    client: HttpClient,
    api_url: String,
    api_key: String,
    model: String,
}

impl ApiBackend {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: HttpClient::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn build_messages(input: &TurnInput, history: &[Message]) -> Vec<WireMessage> {
        let mut messages: Vec<WireMessage> = history
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str().into(),
                content: m.content.display_text(),
            })
            .collect();
        messages.push(WireMessage {
            role: input.role.as_str().into(),
            content: input.text.clone(),
        });
        messages
    }
}

#[async_trait]
impl ChatBackend for ApiBackend {
    async fn send_message(
        &self,
        _path: &str,
        session_id: &str,
        input: &TurnInput,
        history: &[Message],
    ) -> Result<TurnResult> {
        let request = WireRequest {
            model: self.model.clone(),
            messages: Self::build_messages(input, history),
            stream: true,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Chat completions request failed")?
            .error_for_status()
            .context("Chat completions request rejected")?;

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut acc = TurnAccumulator::default();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Chat completions stream failed")?;
            for payload in decoder.push(&chunk) {
                if payload == "[DONE]" {
                    break 'outer;
                }
                match serde_json::from_str::<WireChunk>(&payload) {
                    Ok(parsed) => acc.absorb(parsed),
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Skipping malformed stream frame");
                    }
                }
            }
        }

        Ok(acc.finish())
    }

    fn name(&self) -> &'static str {
        "api"
    }
}

// ============================================================================
// Delta accumulation
// ============================================================================

#[derive(Default)]
struct TurnAccumulator {
    text: String,
    tool_calls: Vec<PartialToolCall>,
    finish_reason: Option<String>,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl TurnAccumulator {
    fn absorb(&mut self, chunk: WireChunk) {
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                self.text.push_str(&content);
            }
            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                // A fragment with an id starts a new call; the rest append
                // arguments to the one in progress.
                if let Some(id) = fragment.id {
                    self.tool_calls.push(PartialToolCall {
                        id,
                        ..Default::default()
                    });
                }
                if let Some(function) = fragment.function {
                    if let Some(last) = self.tool_calls.last_mut() {
                        if let Some(name) = function.name {
                            last.name = name;
                        }
                        if let Some(arguments) = function.arguments {
                            last.arguments.push_str(&arguments);
                        }
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
    }

    fn finish(self) -> TurnResult {
        let mut result = TurnResult::default();
        if !self.text.trim().is_empty() {
            result.messages.push(Message::text(Role::Assistant, self.text));
        }
        result.pending_calls = self
            .tool_calls
            .into_iter()
            .map(|c| ToolCallRequest {
                id: c.id,
                name: c.name,
                input: serde_json::from_str(&c.arguments).unwrap_or(serde_json::Value::Null),
            })
            .collect();
        // A tool_calls finish means the model wants its results back before
        // yielding the floor.
        if self.finish_reason.as_deref() == Some("tool_calls") {
            result.next_speaker = Some(NextSpeaker::Agent);
        }
        result
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallFragment>>,
}

#[derive(Deserialize)]
struct WireToolCallFragment {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionFragment>,
}

#[derive(Deserialize)]
struct WireFunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ============================================================================
// SSE decoding
// ============================================================================

/// Buffering SSE decoder: feed raw chunks, get back complete `data:` payloads.
/// The buffer is bounded so a malformed stream cannot grow it without limit.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    const MAX_BUFFER: usize = 1024 * 1024;

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        if self.buffer.len() > Self::MAX_BUFFER {
            tracing::warn!("SSE buffer exceeded limit, dropping oldest half");
            let keep_from = self.buffer.len() - Self::MAX_BUFFER / 2;
            self.buffer = self.buffer[keep_from..].to_string();
        }

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}
