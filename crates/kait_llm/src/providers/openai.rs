//! OpenAI provider.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::retry::{with_retry, RetryConfig};

use super::{
    build_openai_messages, parse_openai_response, parse_openai_sse, ChatMessage, CompletionParams,
    ProviderClient, StreamEvent, CHAT_TIMEOUT_S,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    model: String,
}

impl OpenAiClient {
    pub fn new(model: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(CHAT_TIMEOUT_S))
                .build()?,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    fn api_key(&self) -> Option<String> {
        env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())
    }

    fn base_url(&self) -> String {
        env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string())
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
        let mut body = json!({
            "model": self.model,
            "messages": build_openai_messages(messages, system),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
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
        let api_key = self.api_key().context("OPENAI_API_KEY not set")?;
        let url = format!("{}/chat/completions", self.base_url());
        let body = self.build_body(messages, system, params, false);

        let retry_config = RetryConfig::default();
        let client = &self.client;
        let response = with_retry(&retry_config, "OpenAI", || async {
            let resp = client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await
                .context("Failed to send request to OpenAI")?;
            Ok(resp)
        })
        .await?;

        let resp_json: Value = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;
        parse_openai_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let api_key = self.api_key().context("OPENAI_API_KEY not set")?;
        let url = format!("{}/chat/completions", self.base_url());
        let body = self.build_body(messages, system, params, true);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send streaming request to OpenAI")?;

        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI streaming error {}: {}", status, err_text);
        }

        let (tx, rx) = mpsc::channel(64);
        let byte_stream = response.bytes_stream();
        tokio::spawn(async move {
            if let Err(e) = parse_openai_sse(byte_stream, &tx).await {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        });
        Ok(rx)
    }
}
