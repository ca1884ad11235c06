//! LiteLLM proxy provider.
//!
//! Speaks the OpenAI wire shape against a locally-run LiteLLM proxy,
//! authenticated with the proxy's master key. Disabled unless turned on in
//! config (`KAIT_LITELLM_ENABLED`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use kait_core::LitellmConfig;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    build_openai_messages, parse_openai_response, parse_openai_sse, ChatMessage, CompletionParams,
    ProviderClient, StreamEvent, CHAT_TIMEOUT_S, HEALTH_TIMEOUT_S,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct LitellmClient {
    client: Client,
    health_client: Client,
    enabled: bool,
    base_url: String,
    master_key: Option<String>,
    model: String,
}

impl LitellmClient {
    pub fn new(config: &LitellmConfig, model: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(CHAT_TIMEOUT_S))
                .build()?,
            health_client: Client::builder()
                .timeout(Duration::from_secs(HEALTH_TIMEOUT_S))
                .build()?,
            enabled: config.enabled,
            base_url: format!("http://127.0.0.1:{}", config.port),
            master_key: config.master_key.clone(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.master_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl ProviderClient for LitellmClient {
    fn name(&self) -> &'static str {
        "litellm"
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    async fn available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let url = format!("{}/health/liveliness", self.base_url);
        matches!(
            self.auth(self.health_client.get(&url)).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": build_openai_messages(messages, system),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let response = self
            .auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .context("Failed to send request to LiteLLM proxy")?;

        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            anyhow::bail!("LiteLLM error {}: {}", status, err_text);
        }

        let resp_json: Value = response.json().await?;
        parse_openai_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": build_openai_messages(messages, system),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": true,
        });

        let response = self
            .auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .context("Failed to send streaming request to LiteLLM proxy")?;

        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            anyhow::bail!("LiteLLM streaming error {}: {}", status, err_text);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_is_unavailable() {
        let config = LitellmConfig::default();
        let client = LitellmClient::new(&config, None).unwrap();
        assert!(!client.available().await);
    }

    #[test]
    fn test_base_url_from_port() {
        let config = LitellmConfig {
            enabled: true,
            port: 4321,
            master_key: Some("sk-master".to_string()),
        };
        let client = LitellmClient::new(&config, Some("claude-sonnet-4-6")).unwrap();
        assert!(client.base_url.contains("4321"));
        assert_eq!(client.model(), "claude-sonnet-4-6");
    }
}
