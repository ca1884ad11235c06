//! Local LLM provider (Ollama, optionally behind an Olla proxy).
//!
//! Ollama exposes an OpenAI-compatible API under /v1, so chat reuses the
//! shared OpenAI message building and SSE parsing. Embeddings use the
//! native /api/embed endpoint with a fallback to the legacy /api/embeddings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kait_core::OllamaConfig;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    build_openai_messages, parse_openai_response, parse_openai_sse, ChatMessage, CompletionParams,
    ProviderClient, StreamEvent, CHAT_TIMEOUT_S, EMBED_TIMEOUT_S, HEALTH_TIMEOUT_S,
};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    health_client: Client,
    embed_client: Client,
    base_url: String,
    model: Option<String>,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(CHAT_TIMEOUT_S))
                .build()?,
            health_client: Client::builder()
                .timeout(Duration::from_secs(HEALTH_TIMEOUT_S))
                .build()?,
            embed_client: Client::builder()
                .timeout(Duration::from_secs(EMBED_TIMEOUT_S))
                .build()?,
            base_url: config.base_url(),
            model: config.model.clone(),
        })
    }

    /// True when the daemon answers /api/tags within the health deadline.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(
            self.health_client.get(&url).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    /// Installed models, newest-modified first as Ollama reports them.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp: Value = self
            .health_client
            .get(&url)
            .send()
            .await
            .context("Failed to query Ollama models")?
            .json()
            .await?;
        let models = resp["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    /// Model to call: configured override first, else the first installed.
    async fn resolve_model(&self) -> Result<String> {
        if let Some(m) = &self.model {
            return Ok(m.clone());
        }
        let models = self.list_models().await?;
        models
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no models installed in Ollama"))
    }

    /// Generate an embedding vector via /api/embed, falling back to the
    /// legacy /api/embeddings endpoint for older daemons.
    pub async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>> {
        let model = match model {
            Some(m) => m.to_string(),
            None => self.resolve_model().await?,
        };

        let url = format!("{}/api/embed", self.base_url);
        let payload = json!({"model": model, "input": text});
        if let Ok(resp) = self.embed_client.post(&url).json(&payload).send().await {
            if resp.status().is_success() {
                let data: Value = resp.json().await?;
                if let Some(first) = data["embeddings"][0].as_array() {
                    return collect_floats(first);
                }
                if let Some(single) = data["embedding"].as_array() {
                    return collect_floats(single);
                }
            }
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let payload = json!({"model": model, "prompt": text});
        let resp = self
            .embed_client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Failed to reach Ollama embeddings endpoint")?;
        let data: Value = resp.json().await?;
        let emb = data["embedding"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("no embedding in Ollama response"))?;
        collect_floats(emb)
    }
}

fn collect_floats(values: &[Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("non-numeric embedding element"))
        })
        .collect()
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn name(&self) -> &'static str {
        "local"
    }

    fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| "ollama".to_string())
    }

    async fn available(&self) -> bool {
        self.health_check().await
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
    ) -> Result<String> {
        let model = self.resolve_model().await?;
        let payload = json!({
            "model": model,
            "messages": build_openai_messages(messages, system),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama error {}: {}", status, err_text);
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
        let model = self.resolve_model().await?;
        let payload = json!({
            "model": model,
            "messages": build_openai_messages(messages, system),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": true,
        });
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send streaming request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama streaming error {}: {}", status, err_text);
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
