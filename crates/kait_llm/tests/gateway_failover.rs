//! End-to-end gateway scenarios over scripted providers.

use std::sync::Arc;

use kait_core::{BreakerConfig, RouterConfig};
use kait_llm::providers::mock::{MockOutcome, MockProvider};
use kait_llm::{
    BreakerRegistry, ChatMessage, CircuitState, CompletionParams, LlmGateway, LlmObserver,
    Provider, ProviderClient, Router, StreamEvent,
};

struct Fixture {
    local: Arc<MockProvider>,
    claude: Arc<MockProvider>,
    openai: Arc<MockProvider>,
    gateway: LlmGateway,
}

fn fixture_with_breaker(breaker: BreakerConfig) -> Fixture {
    let local = Arc::new(MockProvider::new("local"));
    let claude = Arc::new(MockProvider::new("claude"));
    let openai = Arc::new(MockProvider::new("openai"));

    let providers: Vec<(Provider, Arc<dyn ProviderClient>)> = vec![
        (Provider::Local, local.clone() as Arc<dyn ProviderClient>),
        (Provider::Claude, claude.clone() as Arc<dyn ProviderClient>),
        (Provider::OpenAi, openai.clone() as Arc<dyn ProviderClient>),
    ];
    let gateway = LlmGateway::with_providers(
        providers,
        Router::new(RouterConfig::default(), None),
        Arc::new(BreakerRegistry::new(breaker, None)),
        Arc::new(LlmObserver::in_memory()),
        false,
    );
    Fixture { local, claude, openai, gateway }
}

fn fixture() -> Fixture {
    fixture_with_breaker(BreakerConfig {
        recovery_timeout_s: 0.05,
        ..Default::default()
    })
}

fn msgs(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(text)]
}

#[tokio::test]
async fn test_legacy_routes_local_first() {
    let f = fixture();
    f.local.push_reply("local says hi");

    let out = f
        .gateway
        .chat(&msgs("what's for dinner"), None, &CompletionParams::default(), None)
        .await;
    assert_eq!(out.as_deref(), Some("local says hi"));
    assert_eq!(f.local.calls(), 1);
    assert_eq!(f.claude.calls(), 0);
}

#[tokio::test]
async fn test_dev_build_prompt_goes_cloud_first() {
    let f = fixture();
    f.claude.push_reply("claude handles the build");

    let out = f
        .gateway
        .chat(
            &msgs("Build the Kait API endpoint"),
            None,
            &CompletionParams::default(),
            None,
        )
        .await;
    assert_eq!(out.as_deref(), Some("claude handles the build"));
    assert_eq!(f.claude.calls(), 1);
    assert_eq!(f.local.calls(), 0);

    let health = f.gateway.health().await;
    let decision = health.last_decision.unwrap();
    assert_eq!(decision.provider, Provider::Claude);
    assert!(decision.reason.contains("Dev/Build"));
    assert_eq!(decision.fallback_chain, vec![Provider::OpenAi, Provider::Local]);
}

#[tokio::test]
async fn test_fall_through_on_provider_failure() {
    let f = fixture();
    f.local.push_failure("connection refused");
    f.claude.push_reply("claude to the rescue");

    let out = f
        .gateway
        .chat(&msgs("hello there"), None, &CompletionParams::default(), None)
        .await;
    assert_eq!(out.as_deref(), Some("claude to the rescue"));
    assert_eq!(f.local.calls(), 1);
    assert_eq!(f.claude.calls(), 1);

    // Both the failure and the success were observed
    let records = f.gateway.observer().get_recent(10);
    assert_eq!(records.len(), 2);
    assert!(!records[0].success);
    assert_eq!(records[0].error_type, "connection");
    assert!(records[1].success);
    assert_eq!(records[1].provider, "claude");
}

#[tokio::test]
async fn test_all_providers_fail_returns_none() {
    let f = fixture();
    f.local.push_failure("timeout");
    f.claude.push_failure("timeout");
    f.openai.push_failure("timeout");

    let out = f
        .gateway
        .chat(&msgs("anyone home"), None, &CompletionParams::default(), None)
        .await;
    assert!(out.is_none());

    let records = f.gateway.observer().get_recent(10);
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.success && r.error_type == "timeout"));
}

#[tokio::test]
async fn test_cloud_outage_opens_breaker_and_skips_provider() {
    // Scenario: Claude times out three times; later cloud-first requests
    // skip Claude while its circuit is open.
    let f = fixture();
    f.openai.set_available(false);

    for _ in 0..3 {
        f.claude.push_failure("timeout");
        f.local.push_reply("local fallback");
        let out = f
            .gateway
            .chat(
                &msgs("Build the Kait watchdog module"),
                None,
                &CompletionParams::default(),
                None,
            )
            .await;
        assert_eq!(out.as_deref(), Some("local fallback"));
    }

    assert_eq!(
        f.gateway.breakers().get("claude").state(),
        CircuitState::Open
    );

    // Next dev/build request: Claude is suppressed by the breaker overlay,
    // so the chain starts at OpenAI.
    f.openai.set_available(true);
    f.openai.push_reply("openai takes over");
    let claude_calls_before = f.claude.calls();
    let out = f
        .gateway
        .chat(
            &msgs("Build the Kait ingest daemon"),
            None,
            &CompletionParams::default(),
            None,
        )
        .await;
    assert_eq!(out.as_deref(), Some("openai takes over"));
    assert_eq!(f.claude.calls(), claude_calls_before);
}

#[tokio::test]
async fn test_breaker_recovery_half_open_then_closed() {
    let f = fixture();

    // Open the local breaker
    for _ in 0..3 {
        f.local.push_failure("connection refused");
        f.claude.push_reply("cloud carries on");
        f.gateway
            .chat(&msgs("hi"), None, &CompletionParams::default(), None)
            .await
            .unwrap();
    }
    assert_eq!(f.gateway.breakers().get("local").state(), CircuitState::Open);

    // Wait out the (shortened) recovery window, then succeed twice:
    // HALF_OPEN -> CLOSED
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    for _ in 0..2 {
        f.local.push_reply("local recovered");
        let out = f
            .gateway
            .chat(&msgs("hi again"), None, &CompletionParams::default(), None)
            .await;
        assert_eq!(out.as_deref(), Some("local recovered"));
    }
    assert_eq!(
        f.gateway.breakers().get("local").state(),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_override_provider_goes_first() {
    let f = fixture();
    f.openai.push_reply("openai on demand");

    let out = f
        .gateway
        .chat(
            &msgs("anything"),
            None,
            &CompletionParams::default(),
            Some(Provider::OpenAi),
        )
        .await;
    assert_eq!(out.as_deref(), Some("openai on demand"));
    assert_eq!(f.openai.calls(), 1);
    assert_eq!(f.local.calls(), 0);
}

#[tokio::test]
async fn test_override_fallbacks_respect_open_circuits() {
    // Long recovery window: the circuit cannot slip into HALF_OPEN
    // while the test runs
    let f = fixture_with_breaker(BreakerConfig {
        recovery_timeout_s: 3600.0,
        ..Default::default()
    });

    // Open claude's circuit; it must not appear in any fallback chain
    let claude_breaker = f.gateway.breakers().get("claude");
    for _ in 0..3 {
        claude_breaker.record_failure();
    }
    assert_eq!(claude_breaker.state(), CircuitState::Open);

    // Override to openai; when it fails, the chain falls through to
    // local and never touches the open claude circuit
    f.openai.push_failure("timeout");
    f.local.push_reply("local backup");
    let out = f
        .gateway
        .chat(
            &msgs("anything"),
            None,
            &CompletionParams::default(),
            Some(Provider::OpenAi),
        )
        .await;
    assert_eq!(out.as_deref(), Some("local backup"));
    assert_eq!(f.claude.calls(), 0);

    let health = f.gateway.health().await;
    let decision = health.last_decision.unwrap();
    assert_eq!(decision.provider, Provider::OpenAi);
    assert!(!decision.fallback_chain.contains(&Provider::Claude));
}

#[tokio::test]
async fn test_stream_commits_to_first_yielding_provider() {
    let f = fixture();
    f.local.push_reply("streamed reply from local");

    let mut rx = f
        .gateway
        .chat_stream(&msgs("stream please"), None, &CompletionParams::default(), None)
        .await
        .expect("stream should start");

    let mut text = String::new();
    while let Some(ev) = rx.recv().await {
        match ev {
            StreamEvent::Token(t) => text.push_str(&t),
            StreamEvent::Done => break,
            StreamEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(text.trim(), "streamed reply from local");
}

#[tokio::test]
async fn test_stream_skips_empty_and_erroring_streams() {
    let f = fixture();
    f.local.push(MockOutcome::EmptyStream);
    f.claude.push(MockOutcome::Fail("401 bad key".into()));
    f.openai.push_reply("third time lucky");

    let mut rx = f
        .gateway
        .chat_stream(&msgs("stream please"), None, &CompletionParams::default(), None)
        .await
        .expect("openai stream should start");

    let mut text = String::new();
    while let Some(ev) = rx.recv().await {
        match ev {
            StreamEvent::Token(t) => text.push_str(&t),
            StreamEvent::Done => break,
            StreamEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(text.trim(), "third time lucky");

    // Two failures recorded before the success
    let records = f.gateway.observer().get_recent(10);
    let failures: Vec<_> = records.iter().filter(|r| !r.success).collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[1].error_type, "auth");
}

#[tokio::test]
async fn test_stream_returns_none_when_nothing_yields() {
    let f = fixture();
    f.local.push(MockOutcome::EmptyStream);
    f.claude.push(MockOutcome::EmptyStream);
    f.openai.push(MockOutcome::EmptyStream);

    let rx = f
        .gateway
        .chat_stream(&msgs("stream please"), None, &CompletionParams::default(), None)
        .await;
    assert!(rx.is_none());
}

#[tokio::test]
async fn test_unavailable_provider_not_in_chain() {
    let f = fixture();
    f.local.set_available(false);
    f.claude.push_reply("claude because local is down");

    let out = f
        .gateway
        .chat(&msgs("hi"), None, &CompletionParams::default(), None)
        .await;
    assert_eq!(out.as_deref(), Some("claude because local is down"));
    assert_eq!(f.local.calls(), 0);

    let names = f.gateway.available_providers().await;
    assert!(!names.contains(&"local".to_string()));
    assert!(names.contains(&"claude".to_string()));
}

#[tokio::test]
async fn test_every_call_produces_an_observability_record() {
    let f = fixture();
    f.local.push_reply("one");
    f.local.push_failure("timeout");
    f.claude.push_reply("two");

    f.gateway.chat(&msgs("a"), None, &CompletionParams::default(), None).await;
    f.gateway.chat(&msgs("b"), None, &CompletionParams::default(), None).await;

    // call 1: local success; call 2: local failure + claude success
    let lifetime = f.gateway.observer().get_lifetime_stats();
    assert_eq!(lifetime.total_calls, 3);
    assert_eq!(lifetime.total_errors, 1);
}
