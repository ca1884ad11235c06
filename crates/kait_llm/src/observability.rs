//! LLM call observability.
//!
//! Records every gateway call with latency, token counts, errors, and
//! estimated cost. Metrics live in an in-memory ring buffer and a rotating
//! JSONL file. Aggregation methods feed dashboards and the reflection
//! pipeline's health insights.

use kait_core::{now_ts, ObservabilityConfig, ProviderErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Cost table (USD per 1M tokens)
// ---------------------------------------------------------------------------

const COST_PER_1M: &[(&str, f64, f64)] = &[
    // Claude models (input, output)
    ("claude-opus-4-6", 15.0, 75.0),
    ("claude-sonnet-4-6", 3.0, 15.0),
    ("claude-sonnet-4-20250514", 3.0, 15.0),
    ("claude-haiku-4-5-20251001", 0.80, 4.0),
    // OpenAI models
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.0),
    ("gpt-4-turbo", 10.0, 30.0),
    ("gpt-4-1106-preview", 10.0, 30.0),
    ("gpt-3.5-turbo", 0.50, 1.50),
    // Local models are free
    ("ollama", 0.0, 0.0),
];

/// Estimate USD cost for a call. Unknown and local models cost 0.
///
/// Exact name match wins; versioned names fall back to prefix matching
/// (longest-prefix-first table order handles `gpt-4o` vs `gpt-4o-mini`).
pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let model = model.to_ascii_lowercase();
    let rates = COST_PER_1M
        .iter()
        .find(|(name, _, _)| model == *name)
        .or_else(|| COST_PER_1M.iter().find(|(name, _, _)| model.starts_with(name)));
    match rates {
        Some((_, input_rate, output_rate)) => {
            (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
        }
        None => 0.0,
    }
}

/// Rough token estimate when exact counts aren't available: ~4 chars/token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Classify an error message into a provider error category.
pub fn classify_error(message: &str) -> ProviderErrorKind {
    let msg = message.to_ascii_lowercase();
    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
        ProviderErrorKind::Timeout
    } else if msg.contains("429") || msg.contains("rate") {
        ProviderErrorKind::RateLimit
    } else if msg.contains("401") || msg.contains("auth") || msg.contains("key") {
        ProviderErrorKind::Auth
    } else if msg.contains("connection") || msg.contains("connect") || msg.contains("refused")
        || msg.contains("dns")
    {
        ProviderErrorKind::Connection
    } else {
        ProviderErrorKind::Api
    }
}

// ---------------------------------------------------------------------------
// LlmCallRecord
// ---------------------------------------------------------------------------

/// Record of a single LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub timestamp: f64,
    /// "local", "claude", "openai", "litellm"
    pub provider: String,
    pub model: String,
    /// "chat", "chat_stream", "embed"
    pub method: String,
    /// Calling component, for attribution in dashboards.
    pub caller: String,
    pub latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub success: bool,
    pub error: String,
    pub error_type: String,
    pub streaming: bool,
}

impl LlmCallRecord {
    /// Successful call. Derives total tokens and cost from the model table.
    pub fn success(
        provider: &str,
        model: &str,
        method: &str,
        caller: &str,
        latency_ms: f64,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        Self {
            timestamp: now_ts(),
            provider: provider.to_string(),
            model: model.to_string(),
            method: method.to_string(),
            caller: caller.to_string(),
            latency_ms,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost_usd: estimate_cost(model, input_tokens, output_tokens),
            success: true,
            error: String::new(),
            error_type: String::new(),
            streaming: method.contains("stream"),
        }
    }

    /// Failed call with a classified error.
    pub fn failure(
        provider: &str,
        model: &str,
        method: &str,
        caller: &str,
        latency_ms: f64,
        error: &str,
    ) -> Self {
        let mut truncated = error.to_string();
        truncated.truncate(200);
        Self {
            timestamp: now_ts(),
            provider: provider.to_string(),
            model: model.to_string(),
            method: method.to_string(),
            caller: caller.to_string(),
            latency_ms,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            estimated_cost_usd: 0.0,
            success: false,
            error: truncated,
            error_type: classify_error(error).as_str().to_string(),
            streaming: method.contains("stream"),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObserverSummary {
    pub window_s: f64,
    pub total_calls: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub calls: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifetimeStats {
    pub total_calls: u64,
    pub total_errors: u64,
    pub total_cost_usd: f64,
    pub buffer_size: usize,
    pub buffer_capacity: usize,
}

/// Linear-interpolated percentile over sorted values.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let idx = (pct / 100.0) * (n - 1) as f64;
            let lower = idx.floor() as usize;
            let upper = (lower + 1).min(n - 1);
            let frac = idx - lower as f64;
            sorted[lower] + frac * (sorted[upper] - sorted[lower])
        }
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

struct ObserverState {
    buffer: VecDeque<LlmCallRecord>,
    total_calls: u64,
    total_errors: u64,
    total_cost_usd: f64,
}

/// Central LLM call metrics collector.
///
/// Thread-safe. Holds the most recent N records in a ring buffer and
/// appends every record to a size-rotated JSONL file (the append happens
/// outside the buffer lock).
pub struct LlmObserver {
    state: Mutex<ObserverState>,
    log_path: Option<PathBuf>,
    log_lock: Mutex<()>,
    config: ObservabilityConfig,
}

impl LlmObserver {
    pub fn new(config: ObservabilityConfig, log_path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(ObserverState {
                buffer: VecDeque::with_capacity(config.ring_size),
                total_calls: 0,
                total_errors: 0,
                total_cost_usd: 0.0,
            }),
            log_path,
            log_lock: Mutex::new(()),
            config,
        }
    }

    /// In-memory-only observer (tests, ephemeral tools).
    pub fn in_memory() -> Self {
        Self::new(ObservabilityConfig::default(), None)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record an LLM call. Non-blocking apart from two short mutexes.
    pub fn record(&self, rec: LlmCallRecord) {
        if !self.config.enabled {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.buffer.len() >= self.config.ring_size {
                state.buffer.pop_front();
            }
            state.total_calls += 1;
            state.total_cost_usd += rec.estimated_cost_usd;
            if !rec.success {
                state.total_errors += 1;
            }
            state.buffer.push_back(rec.clone());
        }
        self.append_jsonl(&rec);
    }

    /// Most recent records, oldest first within the slice.
    pub fn get_recent(&self, limit: usize) -> Vec<LlmCallRecord> {
        let state = self.state.lock().unwrap();
        let skip = state.buffer.len().saturating_sub(limit);
        state.buffer.iter().skip(skip).cloned().collect()
    }

    /// Summary statistics for the trailing window.
    pub fn get_summary(&self, window_s: f64) -> ObserverSummary {
        let cutoff = now_ts() - window_s;
        let records: Vec<LlmCallRecord> = {
            let state = self.state.lock().unwrap();
            state
                .buffer
                .iter()
                .filter(|r| r.timestamp >= cutoff)
                .cloned()
                .collect()
        };

        if records.is_empty() {
            return ObserverSummary {
                window_s,
                ..Default::default()
            };
        }

        let mut latencies: Vec<f64> = records.iter().map(|r| r.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let errors = records.iter().filter(|r| !r.success).count();

        ObserverSummary {
            window_s,
            total_calls: records.len(),
            error_count: errors,
            error_rate: errors as f64 / records.len() as f64,
            avg_latency_ms: latencies.iter().sum::<f64>() / latencies.len() as f64,
            p50_latency_ms: percentile(&latencies, 50.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            total_tokens: records.iter().map(|r| r.total_tokens).sum(),
            total_cost_usd: records.iter().map(|r| r.estimated_cost_usd).sum(),
        }
    }

    /// Per-provider statistics for the trailing window.
    pub fn get_provider_stats(&self, window_s: f64) -> Vec<(String, ProviderStats)> {
        let cutoff = now_ts() - window_s;
        let records: Vec<LlmCallRecord> = {
            let state = self.state.lock().unwrap();
            state
                .buffer
                .iter()
                .filter(|r| r.timestamp >= cutoff)
                .cloned()
                .collect()
        };

        let mut providers: Vec<String> = Vec::new();
        for r in &records {
            if !providers.contains(&r.provider) {
                providers.push(r.provider.clone());
            }
        }

        providers
            .into_iter()
            .map(|provider| {
                let recs: Vec<&LlmCallRecord> =
                    records.iter().filter(|r| r.provider == provider).collect();
                let mut latencies: Vec<f64> = recs.iter().map(|r| r.latency_ms).collect();
                latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let errors = recs.iter().filter(|r| !r.success).count();
                let models: BTreeSet<String> = recs
                    .iter()
                    .filter(|r| !r.model.is_empty())
                    .map(|r| r.model.clone())
                    .collect();
                let stats = ProviderStats {
                    calls: recs.len(),
                    errors,
                    error_rate: errors as f64 / recs.len() as f64,
                    avg_latency_ms: latencies.iter().sum::<f64>() / latencies.len() as f64,
                    p50_latency_ms: percentile(&latencies, 50.0),
                    p99_latency_ms: percentile(&latencies, 99.0),
                    total_tokens: recs.iter().map(|r| r.total_tokens).sum(),
                    total_cost_usd: recs.iter().map(|r| r.estimated_cost_usd).sum(),
                    models: models.into_iter().collect(),
                };
                (provider, stats)
            })
            .collect()
    }

    /// Error rate for one provider over the trailing window.
    pub fn get_error_rate(&self, provider: &str, window_s: f64) -> f64 {
        let cutoff = now_ts() - window_s;
        let state = self.state.lock().unwrap();
        let (total, errors) = state
            .buffer
            .iter()
            .filter(|r| r.timestamp >= cutoff && r.provider == provider)
            .fold((0usize, 0usize), |(t, e), r| {
                (t + 1, e + usize::from(!r.success))
            });
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        }
    }

    pub fn get_lifetime_stats(&self) -> LifetimeStats {
        let state = self.state.lock().unwrap();
        LifetimeStats {
            total_calls: state.total_calls,
            total_errors: state.total_errors,
            total_cost_usd: state.total_cost_usd,
            buffer_size: state.buffer.len(),
            buffer_capacity: self.config.ring_size,
        }
    }

    // -- JSONL persistence -------------------------------------------------

    fn append_jsonl(&self, rec: &LlmCallRecord) {
        let Some(path) = &self.log_path else {
            return;
        };
        // Single writer for append + rotation; concurrent appends serialise
        // here rather than in the ring lock.
        let _guard = self.log_lock.lock().unwrap();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        self.rotate_if_needed(path);
        if let Ok(line) = serde_json::to_string(rec) {
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(f, "{line}");
            }
        }
    }

    fn rotate_if_needed(&self, path: &std::path::Path) {
        let max_bytes = self.config.jsonl_max_bytes;
        let backups = self.config.jsonl_backups;
        if max_bytes == 0 || backups == 0 {
            return;
        }
        let Ok(meta) = std::fs::metadata(path) else {
            return;
        };
        if meta.len() < max_bytes {
            return;
        }
        // Shift llm_calls.jsonl.N -> .N+1, dropping the oldest
        let name = |i: u32| {
            let mut p = path.as_os_str().to_owned();
            p.push(format!(".{i}"));
            PathBuf::from(p)
        };
        for i in (1..backups).rev() {
            let src = name(i);
            if src.exists() {
                let _ = std::fs::rename(&src, name(i + 1));
            }
        }
        let _ = std::fs::rename(path, name(1));
    }
}

// ---------------------------------------------------------------------------
// Observed call combinator
// ---------------------------------------------------------------------------

/// Wrap a text-producing LLM call so its outcome is recorded.
///
/// Success records latency and a token estimate from the result length;
/// failure records a classified error and passes the error through
/// unchanged. The gateway instruments its own calls inline; this is the
/// entry point for external callers and agent plugins.
pub async fn observed<F, Fut>(
    observer: &LlmObserver,
    provider: &str,
    model: &str,
    method: &str,
    caller: &str,
    operation: F,
) -> anyhow::Result<String>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<String>>,
{
    if !observer.enabled() {
        return operation().await;
    }
    let started = std::time::Instant::now();
    match operation().await {
        Ok(text) => {
            let latency = started.elapsed().as_secs_f64() * 1000.0;
            observer.record(LlmCallRecord::success(
                provider,
                model,
                method,
                caller,
                latency,
                0,
                estimate_tokens(&text),
            ));
            Ok(text)
        }
        Err(e) => {
            let latency = started.elapsed().as_secs_f64() * 1000.0;
            observer.record(LlmCallRecord::failure(
                provider,
                model,
                method,
                caller,
                latency,
                &e.to_string(),
            ));
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
