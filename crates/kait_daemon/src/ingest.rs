//! kaitd: the ingest HTTP service.
//!
//! Accepts newline-delimited or single JSON events from any adapter,
//! authenticated by bearer token, rate-limited per source. Malformed
//! events are quarantined; accepted events land on the spool for the
//! bridge worker.

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kait_core::{now_ts, IngestEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::quarantine::Quarantine;
use crate::queue::EventQueue;
use crate::ratelimit::SlidingWindowLimiter;

#[derive(Clone)]
pub struct IngestState {
    pub queue: Arc<EventQueue>,
    pub quarantine: Arc<Quarantine>,
    pub limiter: Arc<SlidingWindowLimiter>,
    /// Required bearer token; None leaves the endpoint open (localhost
    /// only deployments).
    pub token: Option<String>,
}

impl IngestState {
    pub fn new(
        queue: Arc<EventQueue>,
        quarantine: Arc<Quarantine>,
        limiter: Arc<SlidingWindowLimiter>,
        token: Option<String>,
    ) -> Self {
        Self {
            queue,
            quarantine,
            limiter,
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

/// Resolve the ingest token: env first, then the state-dir token file.
pub fn resolve_token(state_dir: &kait_core::StateDir) -> Option<String> {
    if let Ok(token) = std::env::var("KAITD_TOKEN") {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }
    std::fs::read_to_string(state_dir.kaitd_token())
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn ingest_app(state: IngestState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(handle_ingest))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn handle_ingest(
    State(state): State<IngestState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    // Bearer auth
    if let Some(expected) = &state.token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if provided != expected {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "unauthorized"})),
            )
                .into_response();
        }
    }

    // Per-source-IP rate limit
    let source_key = connect_info
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let (allowed, retry_after) = state.limiter.allow(&source_key, now_ts());
    if !allowed {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "rate_limited", "retry_after_s": retry_after})),
        )
            .into_response();
        if let Ok(value) = retry_after.to_string().parse() {
            response.headers_mut().insert("retry-after", value);
        }
        return response;
    }

    // One JSON object, or NDJSON lines
    let mut accepted = 0u32;
    let mut quarantined = 0u32;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<IngestEvent>(line) {
            Ok(mut event) => match event.validate() {
                Ok(()) => {
                    event.received_at = Some(now_ts());
                    if let Err(e) = state.queue.push(&event) {
                        tracing::error!("Failed to spool event: {}", e);
                        quarantined += 1;
                        state.quarantine.record(line, "spool write failed");
                    } else {
                        accepted += 1;
                    }
                }
                Err(reason) => {
                    quarantined += 1;
                    state.quarantine.record(line, &reason);
                }
            },
            Err(e) => {
                quarantined += 1;
                state.quarantine.record(line, &format!("invalid json: {e}"));
            }
        }
    }

    let status = if accepted > 0 {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (
        status,
        Json(serde_json::json!({"accepted": accepted, "quarantined": quarantined})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(token: Option<&str>, limit: u32) -> (tempfile::TempDir, IngestState) {
        let dir = tempfile::tempdir().unwrap();
        let state = IngestState::new(
            Arc::new(EventQueue::new(dir.path().join("events.ndjson"))),
            Arc::new(Quarantine::new(dir.path().join("invalid.jsonl"), 3, 12)),
            Arc::new(SlidingWindowLimiter::new(limit, 60.0)),
            token.map(str::to_string),
        );
        (dir, state)
    }

    fn event_line(kind: &str) -> String {
        serde_json::to_string(&IngestEvent {
            source: "cli".to_string(),
            kind: kind.to_string(),
            session_id: None,
            trace_id: None,
            body: Some("hi".to_string()),
            meta: None,
            received_at: None,
        })
        .unwrap()
    }

    async fn post_ingest(app: Router, body: &str, auth: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method("POST").uri("/ingest");
        if let Some(token) = auth {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let response = app
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = test_state(None, 10);
        let app = ingest_app(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_accepts_single_event() {
        let (_dir, state) = test_state(None, 10);
        let queue = state.queue.clone();
        let app = ingest_app(state);

        let (status, json) = post_ingest(app, &event_line("user_message"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["accepted"], 1);
        assert_eq!(queue.stats().event_count, 1);

        // received_at was stamped
        let drained = queue.drain(1);
        assert!(drained[0].received_at.is_some());
    }

    #[tokio::test]
    async fn test_accepts_ndjson_batch() {
        let (_dir, state) = test_state(None, 10);
        let queue = state.queue.clone();
        let app = ingest_app(state);

        let body = format!("{}\n{}\n", event_line("a"), event_line("b"));
        let (status, json) = post_ingest(app, &body, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["accepted"], 2);
        assert_eq!(queue.stats().event_count, 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let (_dir, state) = test_state(Some("secret"), 10);
        let app = ingest_app(state.clone());
        let (status, _) = post_ingest(app, &event_line("a"), Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let app = ingest_app(state.clone());
        let (status, _) = post_ingest(app, &event_line("a"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let app = ingest_app(state);
        let (status, _) = post_ingest(app, &event_line("a"), Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_events_quarantined() {
        let (_dir, state) = test_state(None, 10);
        let quarantine = state.quarantine.clone();
        let app = ingest_app(state);

        let body = "this is not json at all with a long tail of text";
        let (status, json) = post_ingest(app, body, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["quarantined"], 1);

        let entries = quarantine.entries();
        assert_eq!(entries.len(), 1);
        // Payload bounded to 12 chars + marker (test quarantine config)
        assert!(entries[0].payload.ends_with("...<truncated>"));
    }

    #[tokio::test]
    async fn test_missing_fields_quarantined() {
        let (_dir, state) = test_state(None, 10);
        let quarantine = state.quarantine.clone();
        let app = ingest_app(state);

        // Valid JSON shape but empty source
        let body = r#"{"source": "", "kind": "user_message"}"#;
        let (status, _) = post_ingest(app, body, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(quarantine.entries()[0].reason, "missing source");
    }

    #[tokio::test]
    async fn test_rate_limit_with_retry_after() {
        let (_dir, state) = test_state(None, 2);
        let app = ingest_app(state.clone());
        let (status, _) = post_ingest(app, &event_line("a"), None).await;
        assert_eq!(status, StatusCode::OK);

        let app = ingest_app(state.clone());
        let (status, _) = post_ingest(app, &event_line("b"), None).await;
        assert_eq!(status, StatusCode::OK);

        let app = ingest_app(state);
        let (status, json) = post_ingest(app, &event_line("c"), None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(json["retry_after_s"].as_u64().unwrap() >= 1);
    }
}
