//! Unified LLM gateway.
//!
//! Single entry point for all LLM calls. Resolves an ordered provider
//! chain (router decision + circuit-breaker overlay + per-provider
//! availability), dispatches to the first adapter that works, and records
//! every outcome with the breakers and the observer.
//!
//! The gateway never errors outward: `chat` returns `None` when every
//! provider in the chain fails, and the caller decides how to degrade.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

use kait_core::KaitConfig;

use crate::breaker::BreakerRegistry;
use crate::observability::{estimate_tokens, LlmCallRecord, LlmObserver};
use crate::providers::{
    anthropic::AnthropicClient, litellm::LitellmClient, ollama::OllamaClient, openai::OpenAiClient,
    ChatMessage, CompletionParams, ProviderClient, StreamEvent,
};
use crate::router::{Availability, Provider, Router, RoutingDecision};

/// Per-provider view returned by `health()`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub available: bool,
    pub circuit_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub providers: HashMap<String, ProviderHealth>,
    pub last_decision: Option<RoutingDecision>,
}

pub struct LlmGateway {
    providers: HashMap<Provider, Arc<dyn ProviderClient>>,
    router: Router,
    breakers: Arc<BreakerRegistry>,
    observer: Arc<LlmObserver>,
    ollama: Option<Arc<OllamaClient>>,
    litellm_enabled: bool,
    last_decision: Mutex<Option<RoutingDecision>>,
}

impl LlmGateway {
    /// Build the production gateway from config.
    pub fn from_config(
        config: &KaitConfig,
        router: Router,
        breakers: Arc<BreakerRegistry>,
        observer: Arc<LlmObserver>,
    ) -> anyhow::Result<Self> {
        let ollama = Arc::new(OllamaClient::new(&config.ollama)?);
        let mut providers: HashMap<Provider, Arc<dyn ProviderClient>> = HashMap::new();
        providers.insert(Provider::Local, ollama.clone());
        providers.insert(Provider::Claude, Arc::new(AnthropicClient::new(None)?));
        providers.insert(Provider::OpenAi, Arc::new(OpenAiClient::new(None)?));
        providers.insert(
            Provider::LiteLlm,
            Arc::new(LitellmClient::new(&config.litellm, None)?),
        );

        Ok(Self {
            providers,
            router,
            breakers,
            observer,
            ollama: Some(ollama),
            litellm_enabled: config.litellm.enabled,
            last_decision: Mutex::new(None),
        })
    }

    /// Build a gateway over explicit adapters. Tests inject mocks here.
    pub fn with_providers(
        providers: Vec<(Provider, Arc<dyn ProviderClient>)>,
        router: Router,
        breakers: Arc<BreakerRegistry>,
        observer: Arc<LlmObserver>,
        litellm_enabled: bool,
    ) -> Self {
        Self {
            providers: providers.into_iter().collect(),
            router,
            breakers,
            observer,
            ollama: None,
            litellm_enabled,
            last_decision: Mutex::new(None),
        }
    }

    pub fn observer(&self) -> &Arc<LlmObserver> {
        &self.observer
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    // ------------------------------------------------------------------
    // Availability
    // ------------------------------------------------------------------

    /// Adapter availability AND breaker consent, per provider.
    async fn provider_usable(&self, provider: Provider) -> bool {
        let Some(adapter) = self.providers.get(&provider) else {
            return false;
        };
        if !adapter.available().await {
            return false;
        }
        self.breakers.get(provider.as_str()).allow_request()
    }

    /// Names of currently usable providers.
    pub async fn available_providers(&self) -> Vec<String> {
        let mut names = Vec::new();
        for provider in [Provider::Local, Provider::Claude, Provider::OpenAi, Provider::LiteLlm] {
            if self.provider_usable(provider).await {
                names.push(provider.as_str().to_string());
            }
        }
        names
    }

    // ------------------------------------------------------------------
    // Chain resolution
    // ------------------------------------------------------------------

    async fn resolve_provider_chain(
        &self,
        messages: &[ChatMessage],
        override_provider: Option<Provider>,
    ) -> Vec<Provider> {
        // Direct override goes first; fallbacks come from the router's
        // decision, which already honors availability and the breaker
        // overlay, so an OPEN circuit never receives a fallback call.
        if let Some(primary) = override_provider {
            let avail = self.current_availability().await;
            let decision = self.router.route("", Some(primary), avail);
            let mut chain = vec![decision.provider];
            for p in &decision.fallback_chain {
                if !chain.contains(p) {
                    chain.push(*p);
                }
            }
            if !chain.contains(&Provider::LiteLlm)
                && self.provider_usable(Provider::LiteLlm).await
            {
                chain.push(Provider::LiteLlm);
            }
            *self.last_decision.lock().unwrap() = Some(decision);
            return chain;
        }

        let avail = self.current_availability().await;
        let litellm_avail = self.provider_usable(Provider::LiteLlm).await;

        // LiteLLM proxies cloud models: it counts as cloud availability for
        // the routing decision even when no direct key is configured.
        let effective = Availability {
            local: avail.local,
            claude: avail.claude || (litellm_avail && self.litellm_enabled),
            openai: avail.openai || (litellm_avail && self.litellm_enabled),
        };

        let prompt = messages
            .iter()
            .find(|m| m.role == crate::providers::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let decision = self.router.route(prompt, None, effective);
        let mut chain = vec![decision.provider];
        for p in &decision.fallback_chain {
            if !chain.contains(p) {
                chain.push(*p);
            }
        }
        if litellm_avail && !chain.contains(&Provider::LiteLlm) {
            chain.push(Provider::LiteLlm);
        }
        *self.last_decision.lock().unwrap() = Some(decision);
        chain
    }

    async fn current_availability(&self) -> Availability {
        Availability {
            local: self.provider_usable(Provider::Local).await,
            claude: self.provider_usable(Provider::Claude).await,
            openai: self.provider_usable(Provider::OpenAi).await,
        }
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Send a chat through the best available provider.
    ///
    /// Returns the response text, or None if every provider failed.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
        override_provider: Option<Provider>,
    ) -> Option<String> {
        let chain = self.resolve_provider_chain(messages, override_provider).await;
        let input_tokens: u64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();

        for provider in chain {
            let Some(adapter) = self.providers.get(&provider) else {
                continue;
            };
            let started = Instant::now();
            match adapter.chat(messages, system, params).await {
                Ok(text) => {
                    let latency = started.elapsed().as_secs_f64() * 1000.0;
                    self.breakers.get(provider.as_str()).record_success();
                    self.observer.record(LlmCallRecord::success(
                        provider.as_str(),
                        &adapter.model(),
                        "chat",
                        "gateway",
                        latency,
                        input_tokens,
                        estimate_tokens(&text),
                    ));
                    return Some(text);
                }
                Err(e) => {
                    let latency = started.elapsed().as_secs_f64() * 1000.0;
                    tracing::debug!("Provider {} chat failed: {}", provider, e);
                    self.breakers.get(provider.as_str()).record_failure();
                    self.observer.record(LlmCallRecord::failure(
                        provider.as_str(),
                        &adapter.model(),
                        "chat",
                        "gateway",
                        latency,
                        &e.to_string(),
                    ));
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    /// Stream tokens from the first provider that produces at least one.
    ///
    /// The first event of each candidate stream is peeked: an empty or
    /// erroring stream records a failure and the next provider is tried.
    /// Once a token has been yielded the stream is committed to that
    /// provider; later errors are recorded but not re-routed.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        params: &CompletionParams,
        override_provider: Option<Provider>,
    ) -> Option<mpsc::Receiver<StreamEvent>> {
        let chain = self.resolve_provider_chain(messages, override_provider).await;
        let input_tokens: u64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();

        for provider in chain {
            let Some(adapter) = self.providers.get(&provider) else {
                continue;
            };
            let started = Instant::now();
            let mut rx = match adapter.chat_stream(messages, system, params).await {
                Ok(rx) => rx,
                Err(e) => {
                    self.record_stream_failure(provider, adapter.as_ref(), started, &e.to_string());
                    continue;
                }
            };

            // Peek the first event before committing to this provider
            match rx.recv().await {
                Some(StreamEvent::Token(first)) => {
                    let latency = started.elapsed().as_secs_f64() * 1000.0;
                    self.breakers.get(provider.as_str()).record_success();

                    let (out_tx, out_rx) = mpsc::channel(64);
                    let observer = self.observer.clone();
                    let model = adapter.model();
                    let provider_name = provider.as_str();
                    tokio::spawn(async move {
                        let mut output_len = first.len();
                        let mut failed: Option<String> = None;
                        if out_tx.send(StreamEvent::Token(first)).await.is_err() {
                            return;
                        }
                        while let Some(ev) = rx.recv().await {
                            match &ev {
                                StreamEvent::Token(t) => output_len += t.len(),
                                StreamEvent::Error(e) => failed = Some(e.clone()),
                                StreamEvent::Done => {}
                            }
                            let done = matches!(ev, StreamEvent::Done | StreamEvent::Error(_));
                            if out_tx.send(ev).await.is_err() || done {
                                break;
                            }
                        }
                        let record = match failed {
                            // Mid-stream error after commitment: recorded,
                            // never re-routed
                            Some(e) => LlmCallRecord::failure(
                                provider_name,
                                &model,
                                "chat_stream",
                                "gateway",
                                latency,
                                &e,
                            ),
                            None => LlmCallRecord::success(
                                provider_name,
                                &model,
                                "chat_stream",
                                "gateway",
                                latency,
                                input_tokens,
                                (output_len as u64 / 4).max(1),
                            ),
                        };
                        observer.record(record);
                    });
                    return Some(out_rx);
                }
                Some(StreamEvent::Error(e)) => {
                    self.record_stream_failure(provider, adapter.as_ref(), started, &e);
                }
                Some(StreamEvent::Done) | None => {
                    self.record_stream_failure(
                        provider,
                        adapter.as_ref(),
                        started,
                        "empty stream",
                    );
                }
            }
        }
        None
    }

    fn record_stream_failure(
        &self,
        provider: Provider,
        adapter: &dyn ProviderClient,
        started: Instant,
        error: &str,
    ) {
        let latency = started.elapsed().as_secs_f64() * 1000.0;
        self.breakers.get(provider.as_str()).record_failure();
        self.observer.record(LlmCallRecord::failure(
            provider.as_str(),
            &adapter.model(),
            "chat_stream",
            "gateway",
            latency,
            error,
        ));
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    /// Generate an embedding vector. Local Ollama only.
    pub async fn embed(&self, text: &str, model: Option<&str>) -> Option<Vec<f32>> {
        let ollama = self.ollama.as_ref()?;
        let started = Instant::now();
        match ollama.embed(text, model).await {
            Ok(vector) => {
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                self.observer.record(LlmCallRecord::success(
                    "local",
                    model.unwrap_or("ollama"),
                    "embed",
                    "gateway",
                    latency,
                    estimate_tokens(text),
                    0,
                ));
                Some(vector)
            }
            Err(e) => {
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                self.observer.record(LlmCallRecord::failure(
                    "local",
                    model.unwrap_or("ollama"),
                    "embed",
                    "gateway",
                    latency,
                    &e.to_string(),
                ));
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub async fn health(&self) -> GatewayHealth {
        let mut providers = HashMap::new();
        for provider in [Provider::Local, Provider::Claude, Provider::OpenAi, Provider::LiteLlm] {
            let adapter_ok = match self.providers.get(&provider) {
                Some(a) => a.available().await,
                None => false,
            };
            providers.insert(
                provider.as_str().to_string(),
                ProviderHealth {
                    available: adapter_ok,
                    circuit_state: self
                        .breakers
                        .get(provider.as_str())
                        .state()
                        .as_str()
                        .to_string(),
                },
            );
        }
        GatewayHealth {
            providers,
            last_decision: self.last_decision.lock().unwrap().clone(),
        }
    }
}
