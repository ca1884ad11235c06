//! Anthropic (Claude) provider.
//!
//! Message normalisation for the Messages API: system turns are hoisted
//! into the top-level `system` string, consecutive same-role turns are
//! merged, and a leading assistant turn is prefixed with a synthetic user
//! turn. Non-streaming calls retry transient failures with backoff.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::retry::{with_retry, RetryConfig};

use super::{ChatMessage, CompletionParams, ProviderClient, Role, StreamEvent, CHAT_TIMEOUT_S};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-6";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    model: String,
}

impl AnthropicClient {
    pub fn new(model: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(CHAT_TIMEOUT_S))
                .build()?,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    fn api_key(&self) -> Option<String> {
        env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.trim().is_empty())
    }

    fn base_url(&self) -> String {
        env::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string())
            .trim_end_matches('/')
            .to_string()
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
        stream: bool,
    ) -> Value {
        let (system_text, turns) = prepare_anthropic_messages(messages, system);
        let mut body = json!({
            "model": self.model,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "messages": turns,
        });
        if let Some(sys) = system_text {
            body["system"] = Value::String(sys);
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    async fn available(&self) -> bool {
        self.api_key().is_some()
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<String> {
        let api_key = self.api_key().context("ANTHROPIC_API_KEY not set")?;
        let url = format!("{}/v1/messages", self.base_url());
        let body = self.build_body(messages, system, params, false);

        let retry_config = RetryConfig::default();
        let client = &self.client;
        let response = with_retry(&retry_config, "Anthropic", || async {
            let resp = client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .context("Failed to send request to Anthropic")?;
            Ok(resp)
        })
        .await?;

        let resp_json: Value = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;
        extract_text(&resp_json)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let api_key = self.api_key().context("ANTHROPIC_API_KEY not set")?;
        let url = format!("{}/v1/messages", self.base_url());
        let body = self.build_body(messages, system, params, true);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to send streaming request to Anthropic")?;

        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic streaming error {}: {}", status, err_text);
        }

        let (tx, rx) = mpsc::channel(64);
        let byte_stream = response.bytes_stream();
        tokio::spawn(async move {
            if let Err(e) = parse_anthropic_sse(byte_stream, &tx).await {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        });
        Ok(rx)
    }
}

/// Pull the text content blocks out of a Messages API response.
fn extract_text(resp: &Value) -> Result<String> {
    let blocks = resp["content"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("missing content in Anthropic response"))?;
    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();
    if text.is_empty() {
        anyhow::bail!("empty text content in Anthropic response");
    }
    Ok(text)
}

/// Normalise messages for the Messages API.
///
/// Returns the combined system string (explicit `system` plus any system
/// turns) and the alternating user/assistant turns.
fn prepare_anthropic_messages(
    messages: &[ChatMessage],
    system: Option<&str>,
) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(sys) = system {
        if !sys.is_empty() {
            system_parts.push(sys.to_string());
        }
    }

    // Extract system turns; merge consecutive same-role turns
    let mut merged: Vec<(Role, String)> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            role => match merged.last_mut() {
                Some((last_role, content)) if *last_role == role => {
                    content.push('\n');
                    content.push_str(&msg.content);
                }
                _ => merged.push((role, msg.content.clone())),
            },
        }
    }

    // The API requires the first turn to be from the user
    if matches!(merged.first(), Some((Role::Assistant, _))) {
        merged.insert(0, (Role::User, "(continuing)".to_string()));
    }

    let turns = merged
        .into_iter()
        .map(|(role, content)| {
            let role = match role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => unreachable!("system turns were extracted"),
            };
            json!({"role": role, "content": content})
        })
        .collect();

    let system_text = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_text, turns)
}

/// Parse an Anthropic SSE byte stream into stream events.
///
/// Event types handled:
/// - `content_block_delta` with `text_delta` -> Token
/// - `message_stop` -> Done
/// - `error` -> Error
async fn parse_anthropic_sse<S>(byte_stream: S, tx: &mpsc::Sender<StreamEvent>) -> Result<()>
where
    S: futures_util::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Unpin
        + Send,
{
    let mut stream = byte_stream;
    let mut buf = String::new();

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.context("Error reading SSE chunk")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));

        // Events are separated by a blank line
        while let Some(split) = buf.find("\n\n") {
            let block = buf[..split].to_string();
            buf.drain(..split + 2);
            match handle_event_block(&block) {
                BlockAction::Token(t) => {
                    if tx.send(StreamEvent::Token(t)).await.is_err() {
                        return Ok(());
                    }
                }
                BlockAction::Done => {
                    let _ = tx.send(StreamEvent::Done).await;
                    return Ok(());
                }
                BlockAction::Error(e) => {
                    let _ = tx.send(StreamEvent::Error(e)).await;
                    return Ok(());
                }
                BlockAction::None => {}
            }
        }
    }

    // Last event may lack the trailing separator
    if !buf.trim().is_empty() {
        if let BlockAction::Token(t) = handle_event_block(buf.trim()) {
            let _ = tx.send(StreamEvent::Token(t)).await;
        }
    }
    let _ = tx.send(StreamEvent::Done).await;
    Ok(())
}

enum BlockAction {
    None,
    Token(String),
    Done,
    Error(String),
}

fn handle_event_block(block: &str) -> BlockAction {
    let mut event_type = "";
    let mut event_data = "";
    for line in block.lines() {
        if let Some(t) = line.strip_prefix("event: ") {
            event_type = t.trim();
        } else if let Some(d) = line.strip_prefix("data: ") {
            event_data = d;
        }
    }
    if event_data.is_empty() {
        return BlockAction::None;
    }
    match event_type {
        "content_block_delta" => {
            if let Ok(v) = serde_json::from_str::<Value>(event_data) {
                if v["delta"]["type"] == "text_delta" {
                    if let Some(text) = v["delta"]["text"].as_str() {
                        return BlockAction::Token(text.to_string());
                    }
                }
            }
            BlockAction::None
        }
        "message_stop" => BlockAction::Done,
        "error" => BlockAction::Error(event_data.to_string()),
        // ping, message_start, content_block_start/stop, message_delta
        _ => BlockAction::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn fake_stream(
        data: &str,
    ) -> impl futures_util::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin + Send
    {
        stream::iter(vec![Ok(bytes::Bytes::from(data.to_string()))])
    }

    #[test]
    fn test_system_extraction() {
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
        ];
        let (system, turns) = prepare_anthropic_messages(&messages, Some("base prompt"));
        assert_eq!(system.unwrap(), "base prompt\n\nbe terse");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0]["role"], "user");
    }

    #[test]
    fn test_consecutive_roles_merged() {
        let messages = vec![
            ChatMessage::user("part one"),
            ChatMessage::user("part two"),
            ChatMessage::assistant("reply"),
        ];
        let (_, turns) = prepare_anthropic_messages(&messages, None);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["content"], "part one\npart two");
    }

    #[test]
    fn test_leading_assistant_gets_synthetic_user() {
        let messages = vec![ChatMessage::assistant("previous reply"), ChatMessage::user("next")];
        let (_, turns) = prepare_anthropic_messages(&messages, None);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["role"], "assistant");
    }

    #[test]
    fn test_extract_text() {
        let resp = json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "world"}
            ]
        });
        assert_eq!(extract_text(&resp).unwrap(), "Hello world");
        assert!(extract_text(&json!({"content": []})).is_err());
    }

    #[tokio::test]
    async fn test_sse_basic_text() {
        let sse = "event: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\nevent: message_stop\ndata: {}\n\n";
        let (tx, mut rx) = mpsc::channel(16);
        parse_anthropic_sse(fake_stream(sse), &tx).await.unwrap();
        drop(tx);

        let mut tokens = Vec::new();
        let mut done = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Token(t) => tokens.push(t),
                StreamEvent::Done => done = true,
                StreamEvent::Error(e) => panic!("unexpected: {e}"),
            }
        }
        assert_eq!(tokens, vec!["Hello"]);
        assert!(done);
    }

    #[tokio::test]
    async fn test_sse_residue_without_trailing_separator() {
        let sse = "event: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\nevent: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}";
        let (tx, mut rx) = mpsc::channel(16);
        parse_anthropic_sse(fake_stream(sse), &tx).await.unwrap();
        drop(tx);

        let mut tokens = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let StreamEvent::Token(t) = ev {
                tokens.push(t);
            }
        }
        assert_eq!(tokens, vec!["Hello", " world"]);
    }

    #[tokio::test]
    async fn test_sse_error_event() {
        let sse = "event: error\ndata: {\"type\":\"overloaded_error\"}\n\n";
        let (tx, mut rx) = mpsc::channel(16);
        parse_anthropic_sse(fake_stream(sse), &tx).await.unwrap();
        drop(tx);

        let mut saw_error = false;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, StreamEvent::Error(_)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_available_requires_key() {
        // Key must not leak in from the environment for this test
        let had = std::env::var("ANTHROPIC_API_KEY").ok();
        std::env::remove_var("ANTHROPIC_API_KEY");
        let client = AnthropicClient::new(None).unwrap();
        assert!(!client.available().await);
        if let Some(k) = had {
            std::env::set_var("ANTHROPIC_API_KEY", k);
        }
    }
}
