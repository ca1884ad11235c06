//! pulse: the status HTTP service.
//!
//! Serves the supervisor/dashboard API: per-worker health, LLM
//! observability aggregates, reflection output, and queue stats. The
//! endpoints are internal-only; the HTML dashboard body lives outside the
//! core and consumes these as JSON.

use axum::{extract::State, routing::get, Json, Router};
use kait_bank::ReasoningBank;
use kait_core::now_ts;
use kait_llm::LlmObserver;
use kait_reflection::EvolutionEngine;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::queue::EventQueue;

/// Supervisor view injected by the binary; pulse itself never manages
/// processes.
pub trait OpsProvider: Send + Sync {
    /// Per-worker running/heartbeat map for /api/status.
    fn service_status(&self) -> serde_json::Value;
    /// Operational detail view for /api/ops.
    fn ops_view(&self) -> serde_json::Value;
}

#[derive(Clone)]
pub struct PulseState {
    pub bank: ReasoningBank,
    pub observer: Arc<LlmObserver>,
    pub queue: Arc<EventQueue>,
    pub evolution: Arc<tokio::sync::Mutex<EvolutionEngine>>,
    pub ops: Arc<dyn OpsProvider>,
    /// kaitd liveness probe target.
    pub kaitd_port: u16,
}

pub fn pulse_app(state: PulseState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/llm", get(api_llm))
        .route("/api/intelligence", get(api_intelligence))
        .route("/api/queue", get(api_queue))
        .route("/api/ops", get(api_ops))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Supervisor view: per-worker status plus local-LLM reachability.
async fn api_status(State(state): State<PulseState>) -> Json<serde_json::Value> {
    let kaitd_healthy = probe_kaitd(state.kaitd_port).await;
    Json(serde_json::json!({
        "pulse": "ok",
        "timestamp": now_ts(),
        "services": state.ops.service_status(),
        "kaitd_healthy": kaitd_healthy,
    }))
}

async fn probe_kaitd(port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/health");
    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    matches!(client.get(&url).send().await, Ok(resp) if resp.status().is_success())
}

/// LLM observability: summary, per-provider stats, recent calls, lifetime.
async fn api_llm(State(state): State<PulseState>) -> Json<serde_json::Value> {
    let summary = state.observer.get_summary(300.0);
    let providers: serde_json::Map<String, serde_json::Value> = state
        .observer
        .get_provider_stats(300.0)
        .into_iter()
        .filter_map(|(name, stats)| {
            serde_json::to_value(stats).ok().map(|v| (name, v))
        })
        .collect();
    let recent = state.observer.get_recent(25);
    let lifetime = state.observer.get_lifetime_stats();

    Json(serde_json::json!({
        "timestamp": now_ts(),
        "summary": summary,
        "providers": providers,
        "recent": recent,
        "lifetime": lifetime,
    }))
}

/// Aggregated reflection pipeline output.
async fn api_intelligence(State(state): State<PulseState>) -> Json<serde_json::Value> {
    let mut payload = serde_json::json!({"timestamp": now_ts()});

    {
        let evolution = state.evolution.lock().await;
        payload["evolution"] = serde_json::json!({
            "metrics": evolution.metrics(),
            "stage_name": evolution.current_stage().name,
            "stage_description": evolution.current_stage().description,
            "transitions": evolution.history().len(),
        });
    }

    match state.bank.get_stats().await {
        Ok(stats) => {
            payload["bank"] = serde_json::to_value(&stats).unwrap_or_default();
        }
        Err(e) => {
            tracing::warn!("Bank stats unavailable: {}", e);
            payload["bank"] = serde_json::Value::Null;
        }
    }

    match state.bank.get_active_behavior_rules().await {
        Ok(rules) => payload["behavior_rules"] = serde_json::json!({"active": rules.len()}),
        Err(_) => payload["behavior_rules"] = serde_json::Value::Null,
    }

    // Weekly roll-up from the archives
    match state.bank.get_archives(50).await {
        Ok(archives) => {
            let week_ago = now_ts() - 7.0 * 86_400.0;
            let recent: Vec<_> = archives
                .iter()
                .filter(|a| a.time_range_end >= week_ago)
                .collect();
            let messages: i64 = recent.iter().map(|a| a.interaction_count).sum();
            let avg_sentiment = if recent.is_empty() {
                0.0
            } else {
                recent.iter().map(|a| a.avg_sentiment).sum::<f64>() / recent.len() as f64
            };
            payload["weekly"] = serde_json::json!({
                "archives": recent.len(),
                "messages": messages,
                "avg_sentiment": avg_sentiment,
            });
        }
        Err(_) => payload["weekly"] = serde_json::Value::Null,
    }

    Json(payload)
}

async fn api_queue(State(state): State<PulseState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.queue.stats()).unwrap_or_default())
}

async fn api_ops(State(state): State<PulseState>) -> Json<serde_json::Value> {
    Json(state.ops.ops_view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use kait_llm::LlmCallRecord;
    use tower::ServiceExt;

    struct FakeOps;
    impl OpsProvider for FakeOps {
        fn service_status(&self) -> serde_json::Value {
            serde_json::json!({"kaitd": {"running": true, "pid": 42}})
        }
        fn ops_view(&self) -> serde_json::Value {
            serde_json::json!({"workers": ["kaitd"]})
        }
    }

    async fn test_state() -> (tempfile::TempDir, PulseState) {
        let dir = tempfile::tempdir().unwrap();
        let bank = ReasoningBank::new(dir.path().join("sidekick.db")).await.unwrap();
        let state = PulseState {
            bank,
            observer: Arc::new(LlmObserver::in_memory()),
            queue: Arc::new(EventQueue::new(dir.path().join("events.ndjson"))),
            evolution: Arc::new(tokio::sync::Mutex::new(EvolutionEngine::new(
                dir.path().join("evolution.json"),
            ))),
            ops: Arc::new(FakeOps),
            // Unused port: the probe should report unhealthy quickly
            kaitd_port: 1,
        };
        (dir, state)
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_api_status_shape() {
        let (_dir, state) = test_state().await;
        let json = get_json(pulse_app(state), "/api/status").await;
        assert_eq!(json["pulse"], "ok");
        assert_eq!(json["services"]["kaitd"]["running"], true);
        assert_eq!(json["kaitd_healthy"], false);
    }

    #[tokio::test]
    async fn test_api_llm_aggregates() {
        let (_dir, state) = test_state().await;
        state
            .observer
            .record(LlmCallRecord::success("local", "llama3", "chat", "t", 50.0, 5, 10));
        state
            .observer
            .record(LlmCallRecord::failure("claude", "claude-sonnet-4-6", "chat", "t", 20.0, "timeout"));

        let json = get_json(pulse_app(state), "/api/llm").await;
        assert_eq!(json["summary"]["total_calls"], 2);
        assert_eq!(json["summary"]["error_count"], 1);
        assert!(json["providers"]["local"]["calls"].is_number());
        assert_eq!(json["recent"].as_array().unwrap().len(), 2);
        assert_eq!(json["lifetime"]["total_calls"], 2);
    }

    #[tokio::test]
    async fn test_api_intelligence_shape() {
        let (_dir, state) = test_state().await;
        let json = get_json(pulse_app(state), "/api/intelligence").await;
        assert_eq!(json["evolution"]["stage_name"], "Basic");
        assert_eq!(json["evolution"]["metrics"]["evolution_stage"], 1);
        assert!(json["bank"]["interactions"].is_number());
        assert_eq!(json["behavior_rules"]["active"], 0);
        assert_eq!(json["weekly"]["archives"], 0);
    }

    #[tokio::test]
    async fn test_api_queue() {
        let (_dir, state) = test_state().await;
        state
            .queue
            .push(&kait_core::IngestEvent {
                source: "cli".to_string(),
                kind: "user_message".to_string(),
                session_id: None,
                trace_id: None,
                body: None,
                meta: None,
                received_at: None,
            })
            .unwrap();
        let json = get_json(pulse_app(state), "/api/queue").await;
        assert_eq!(json["event_count"], 1);
        assert_eq!(json["needs_rotation"], false);
    }

    #[tokio::test]
    async fn test_api_ops_delegates() {
        let (_dir, state) = test_state().await;
        let json = get_json(pulse_app(state), "/api/ops").await;
        assert_eq!(json["workers"][0], "kaitd");
    }
}
