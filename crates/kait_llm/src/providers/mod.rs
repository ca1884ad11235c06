//! Provider adapters.
//!
//! Each adapter normalises the shared message format to its target API and
//! reports availability (API key present, daemon reachable, enable flag).
//! The gateway owns breaker bookkeeping and observability; adapters just
//! speak the wire protocol.

pub mod anthropic;
pub mod litellm;
pub mod mock;
pub mod ollama;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default deadlines, per call class.
pub const CHAT_TIMEOUT_S: u64 = 120;
pub const EMBED_TIMEOUT_S: u64 = 30;
pub const HEALTH_TIMEOUT_S: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation in the gateway's normalised format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Sampling parameters for a completion.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self { max_tokens: 4096, temperature: 0.7 }
    }
}

/// Events produced by a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Done,
    Error(String),
}

/// A chat-capable LLM provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Canonical provider name; also the breaker key.
    fn name(&self) -> &'static str;

    /// Model this adapter will call, for observability records.
    fn model(&self) -> String;

    /// Cheap availability check: key present, enable flag, daemon reachable.
    async fn available(&self) -> bool;

    /// Complete a chat. Errors carry enough text for classification.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<String>;

    /// Stream a chat. The receiver yields tokens until `Done` or `Error`.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<mpsc::Receiver<StreamEvent>>;
}

/// Split out system messages and convert the rest for OpenAI-style APIs.
///
/// Shared by the Ollama, OpenAI, and LiteLLM adapters.
pub(crate) fn build_openai_messages(
    messages: &[ChatMessage],
    system: Option<&str>,
) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(sys) = system {
        if !sys.is_empty() {
            out.push(serde_json::json!({"role": "system", "content": sys}));
        }
    }
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push(serde_json::json!({"role": role, "content": msg.content}));
    }
    out
}

/// Parse a non-streaming OpenAI-compatible JSON response body.
pub(crate) fn parse_openai_response(resp_json: &serde_json::Value) -> Result<String> {
    let content = resp_json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing choices[0].message.content in response"))?;
    Ok(content.to_string())
}

/// Parse OpenAI-style SSE chunks (`data: {...}` lines, `data: [DONE]`
/// terminator) into stream events.
pub(crate) async fn parse_openai_sse<S>(
    byte_stream: S,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()>
where
    S: futures_util::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Unpin
        + Send,
{
    use futures_util::StreamExt;

    let mut stream = byte_stream;
    let mut buf = String::new();

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result?;
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buf.find('\n') {
            let line = buf[..newline].trim().to_string();
            buf.drain(..=newline);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                let _ = tx.send(StreamEvent::Done).await;
                return Ok(());
            }
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(data) {
                if let Some(token) = v["choices"][0]["delta"]["content"].as_str() {
                    if !token.is_empty() && tx.send(StreamEvent::Token(token.to_string())).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    // Stream ended without [DONE]
    let _ = tx.send(StreamEvent::Done).await;
    Ok(())
}
