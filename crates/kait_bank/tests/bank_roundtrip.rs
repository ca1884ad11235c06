use kait_bank::{
    ArchiveRecord, BehaviorRuleRow, NewInteraction, ReasoningBank,
};
use kait_core::now_ts;
use tempfile::TempDir;

async fn test_bank() -> (TempDir, ReasoningBank) {
    let dir = TempDir::new().unwrap();
    let bank = ReasoningBank::new(dir.path().join("sidekick.db"))
        .await
        .unwrap();
    (dir, bank)
}

fn interaction(session: &str, input: &str, ts: f64) -> NewInteraction {
    NewInteraction {
        user_input: input.to_string(),
        ai_response: format!("response to {input}"),
        mood: Some("curious".to_string()),
        sentiment_score: 0.4,
        session_id: Some(session.to_string()),
        source: "cli".to_string(),
        timestamp: Some(ts),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_interaction_read_your_writes() {
    let (_dir, bank) = test_bank().await;

    let id = bank
        .save_interaction(interaction("s1", "hello", now_ts()))
        .await
        .unwrap();
    assert_eq!(id.len(), 16);

    let got = bank.get_interaction(&id).await.unwrap().unwrap();
    assert_eq!(got.user_input, "hello");
    assert_eq!(got.session_id.as_deref(), Some("s1"));
    assert_eq!(got.source, "cli");
    assert!(!got.archived);
    assert!(got.feedback_score.is_none());
}

#[tokio::test]
async fn test_history_ordering_and_filters() {
    let (_dir, bank) = test_bank().await;
    let base = now_ts();

    for i in 0..5 {
        bank.save_interaction(interaction("s1", &format!("msg{i}"), base + i as f64))
            .await
            .unwrap();
    }
    let mut other = interaction("s2", "other", base + 10.0);
    other.source = "matrix".to_string();
    bank.save_interaction(other).await.unwrap();

    // Newest first
    let all = bank
        .get_interaction_history(10, None, None, true)
        .await
        .unwrap();
    assert_eq!(all.len(), 6);
    assert_eq!(all[0].user_input, "other");
    assert_eq!(all[1].user_input, "msg4");

    // Session filter
    let s1 = bank
        .get_interaction_history(10, Some("s1"), None, true)
        .await
        .unwrap();
    assert_eq!(s1.len(), 5);

    // Source filter
    let matrix = bank
        .get_interaction_history(10, None, Some("matrix"), true)
        .await
        .unwrap();
    assert_eq!(matrix.len(), 1);

    // Limit applies after ordering
    let top2 = bank
        .get_interaction_history(2, None, None, true)
        .await
        .unwrap();
    assert_eq!(top2.len(), 2);
    assert_eq!(top2[0].user_input, "other");
}

#[tokio::test]
async fn test_feedback_update() {
    let (_dir, bank) = test_bank().await;
    let id = bank
        .save_interaction(interaction("s1", "rate me", now_ts()))
        .await
        .unwrap();

    assert!(bank.update_interaction_feedback(&id, 0.9).await.unwrap());
    let got = bank.get_interaction(&id).await.unwrap().unwrap();
    assert_eq!(got.feedback_score, Some(0.9));

    // Unknown id is a no-op
    assert!(!bank.update_interaction_feedback("ffffffffffffffff", 0.1).await.unwrap());
}

#[tokio::test]
async fn test_sessions_summary() {
    let (_dir, bank) = test_bank().await;
    let base = now_ts() - 100.0;

    bank.save_interaction(interaction("s1", "first message", base))
        .await
        .unwrap();
    bank.save_interaction(interaction("s1", "second message", base + 5.0))
        .await
        .unwrap();
    bank.save_interaction(interaction("s2", "solo", base + 50.0))
        .await
        .unwrap();

    let sessions = bank.get_sessions(None, 10, false).await.unwrap();
    assert_eq!(sessions.len(), 2);
    // Most recently active session first
    assert_eq!(sessions[0].session_id, "s2");
    let s1 = &sessions[1];
    assert_eq!(s1.msg_count, 2);
    assert!((s1.last_ts - (base + 5.0)).abs() < 0.001);
    assert_eq!(s1.first_message, "first message");
}

#[tokio::test]
async fn test_context_upsert_and_access_count() {
    let (_dir, bank) = test_bank().await;

    bank.save_context("user_location", &serde_json::json!("berlin"), Some("personal"), 0.8)
        .await
        .unwrap();

    // get_context bumps the counter by exactly one per call
    for expected in 1..=3i64 {
        let ctx = bank.get_context("user_location").await.unwrap().unwrap();
        assert_eq!(ctx.access_count, expected);
        assert_eq!(ctx.value, serde_json::json!("berlin"));
    }

    // Upsert replaces the value and keeps the key unique
    bank.save_context("user_location", &serde_json::json!("tokyo"), Some("personal"), 0.9)
        .await
        .unwrap();
    let ctx = bank.get_context("user_location").await.unwrap().unwrap();
    assert_eq!(ctx.value, serde_json::json!("tokyo"));
    assert!((ctx.confidence - 0.9).abs() < 1e-9);

    // Missing key: no phantom counter, returns None
    assert!(bank.get_context("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_context_update_and_search() {
    let (_dir, bank) = test_bank().await;

    // update_context on a missing key creates it
    let existed = bank
        .update_context("project_stack", &serde_json::json!(["rust", "sqlite"]), Some("dev"), None)
        .await
        .unwrap();
    assert!(!existed);

    let existed = bank
        .update_context("project_stack", &serde_json::json!(["rust"]), None, Some(0.7))
        .await
        .unwrap();
    assert!(existed);

    bank.save_context("project_name", &serde_json::json!("kait"), Some("dev"), 0.5)
        .await
        .unwrap();

    let hits = bank.search_contexts("project_", None, 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    let hits = bank.search_contexts("project_", Some("dev"), 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    let hits = bank.search_contexts("user_", None, 10).await.unwrap();
    assert!(hits.is_empty());

    assert!(bank.delete_context("project_name").await.unwrap());
    assert!(!bank.delete_context("project_name").await.unwrap());
}

#[tokio::test]
async fn test_corrections_lifecycle() {
    let (_dir, bank) = test_bank().await;

    let id = bank
        .record_correction("paris is in italy", "paris is in france", Some("geography slip"), Some("facts"))
        .await
        .unwrap();

    let recent = bank.get_recent_corrections(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].correction, "paris is in france");
    assert_eq!(recent[0].applied_count, 0);

    assert!(bank.increment_correction_applied(&id).await.unwrap());
    assert!(bank.increment_correction_applied(&id).await.unwrap());
    let got = bank.get_correction(&id).await.unwrap().unwrap();
    assert_eq!(got.applied_count, 2);

    let by_domain = bank.get_corrections_by_domain("facts", 10).await.unwrap();
    assert_eq!(by_domain.len(), 1);
}

#[tokio::test]
async fn test_evolution_timeline() {
    let (_dir, bank) = test_bank().await;

    bank.save_evolution(
        "stage_advance",
        "Stage 1 -> 2",
        Some(&serde_json::json!({"stage": 1})),
        Some(&serde_json::json!({"stage": 2})),
    )
    .await
    .unwrap();
    bank.save_evolution("behavior_evolution", "enabled verification for facts", None, None)
        .await
        .unwrap();

    let timeline = bank.get_evolution_timeline(10).await.unwrap();
    assert_eq!(timeline.len(), 2);

    let stage_events = bank.get_evolutions_by_type("stage_advance", 10).await.unwrap();
    assert_eq!(stage_events.len(), 1);
    assert_eq!(
        stage_events[0].metrics_after,
        Some(serde_json::json!({"stage": 2}))
    );
}

#[tokio::test]
async fn test_preferences_ordered_by_confidence() {
    let (_dir, bank) = test_bank().await;

    bank.save_preference("tone", "casual", 0.4).await.unwrap();
    bank.save_preference("response_length", "short", 0.9).await.unwrap();
    bank.save_preference("humor", "high", 0.6).await.unwrap();

    let all = bank.get_all_preferences().await.unwrap();
    let keys: Vec<&str> = all.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, vec!["response_length", "humor", "tone"]);

    // Upsert replaces by key
    bank.save_preference("tone", "formal", 0.95).await.unwrap();
    let tone = bank.get_preference("tone").await.unwrap().unwrap();
    assert_eq!(tone.value, "formal");
    let all = bank.get_all_preferences().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].key, "tone");
}

#[tokio::test]
async fn test_evolve_personality_records_event() {
    let (_dir, bank) = test_bank().await;

    // New trait initialises with a single-point history
    bank.evolve_personality("warmth", 0.6).await.unwrap();
    let t = bank.get_personality_trait("warmth").await.unwrap().unwrap();
    assert_eq!(t.history.len(), 1);
    assert!((t.value - 0.6).abs() < 1e-9);

    bank.evolve_personality("warmth", 0.8).await.unwrap();
    let t = bank.get_personality_trait("warmth").await.unwrap().unwrap();
    assert_eq!(t.history.len(), 2);
    assert!((t.value - 0.8).abs() < 1e-9);

    // Each evolve wrote a personality_shift evolution event
    let shifts = bank.get_evolutions_by_type("personality_shift", 10).await.unwrap();
    assert_eq!(shifts.len(), 2);
    let latest = &shifts[0];
    assert_eq!(
        latest.metrics_before,
        Some(serde_json::json!({"trait": "warmth", "value": 0.6}))
    );

    let all = bank.get_all_personality_traits().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_behavior_rules() {
    let (_dir, bank) = test_bank().await;

    let rule = |id: &str, conf: f64| BehaviorRuleRow {
        rule_id: id.to_string(),
        trigger: format!("trigger for {id}"),
        action: "keep it short".to_string(),
        confidence: conf,
        source: "length_pref".to_string(),
        created_at: now_ts(),
        active: true,
    };

    bank.save_behavior_rule(&rule("r1", 0.5)).await.unwrap();
    bank.save_behavior_rule(&rule("r2", 0.9)).await.unwrap();
    bank.save_behavior_rule(&rule("r3", 0.7)).await.unwrap();

    let active = bank.get_active_behavior_rules().await.unwrap();
    let ids: Vec<&str> = active.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["r2", "r3", "r1"]);

    // Deactivation hides but does not delete
    assert!(bank.deactivate_behavior_rule("r2").await.unwrap());
    let active = bank.get_active_behavior_rules().await.unwrap();
    assert_eq!(active.len(), 2);
    assert!(!bank.deactivate_behavior_rule("missing").await.unwrap());
}

#[tokio::test]
async fn test_archivable_sessions_require_all_stale() {
    let (_dir, bank) = test_bank().await;
    let two_days_ago = now_ts() - 2.0 * 86_400.0;

    // s_old: fully stale
    for i in 0..3 {
        bank.save_interaction(interaction("s_old", &format!("old{i}"), two_days_ago + i as f64))
            .await
            .unwrap();
    }
    // s_mixed: one stale message plus one fresh one, so not archivable
    bank.save_interaction(interaction("s_mixed", "stale", two_days_ago))
        .await
        .unwrap();
    bank.save_interaction(interaction("s_mixed", "fresh", now_ts()))
        .await
        .unwrap();

    let archivable = bank.get_archivable_sessions(86_400).await.unwrap();
    assert_eq!(archivable.len(), 1);
    assert_eq!(archivable[0].session_id, "s_old");
    assert_eq!(archivable[0].msg_count, 3);
}

#[tokio::test]
async fn test_archive_roundtrip_and_exclusivity() {
    let (_dir, bank) = test_bank().await;
    let base = now_ts() - 3.0 * 86_400.0;

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = bank
            .save_interaction(interaction("s_arch", &format!("m{i}"), base + i as f64))
            .await
            .unwrap();
        ids.push(id);
    }

    let flipped = bank.mark_interactions_archived(&ids).await.unwrap();
    assert_eq!(flipped, 3);
    // Second pass flips nothing: ids already archived
    let flipped = bank.mark_interactions_archived(&ids).await.unwrap();
    assert_eq!(flipped, 0);

    let record = ArchiveRecord {
        archive_id: "a1b2c3d4e5f60718".to_string(),
        batch_label: "2026-07-29".to_string(),
        session_ids: vec!["s_arch".to_string()],
        interaction_ids: ids.clone(),
        interaction_count: 3,
        time_range_start: base,
        time_range_end: base + 2.0,
        memory_entries: Vec::new(),
        learning_records: Vec::new(),
        mind_sync_status: "pending".to_string(),
        narrative_summary: "three test messages".to_string(),
        topics: vec!["testing".to_string()],
        mood_summary: "curious".to_string(),
        avg_sentiment: 0.4,
        created_at: now_ts(),
        source_breakdown: [("cli".to_string(), 3i64)].into_iter().collect(),
        status: "partial".to_string(),
    };
    bank.save_archive(&record).await.unwrap();

    let archives = bank.get_archives(10).await.unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].interaction_ids, ids);
    assert_eq!(archives[0].batch_label, "2026-07-29");

    let got = bank.get_archive("a1b2c3d4e5f60718").await.unwrap().unwrap();
    assert_eq!(got.topics, vec!["testing"]);
    assert_eq!(got.source_breakdown.get("cli"), Some(&3));

    // Interactions survive archival (never hard-deleted) and are returned
    // oldest first
    let members = bank.get_archive_interactions("a1b2c3d4e5f60718").await.unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(members[0].user_input, "m0");
    assert!(members.iter().all(|i| i.archived));

    // Archived interactions are hidden from the default history view
    let visible = bank.get_interaction_history(10, None, None, false).await.unwrap();
    assert!(visible.is_empty());
}

#[tokio::test]
async fn test_stats_aggregates() {
    let (_dir, bank) = test_bank().await;

    let mut a = interaction("s1", "one", now_ts());
    a.sentiment_score = 0.5;
    let id = bank.save_interaction(a).await.unwrap();
    bank.update_interaction_feedback(&id, 1.0).await.unwrap();

    let mut b = interaction("s2", "two", now_ts());
    b.sentiment_score = -0.1;
    bank.save_interaction(b).await.unwrap();

    bank.save_context("hot", &serde_json::json!(1), None, 0.9).await.unwrap();
    bank.get_context("hot").await.unwrap();
    bank.get_context("hot").await.unwrap();
    let cid = bank
        .record_correction("wrong", "right", None, Some("facts"))
        .await
        .unwrap();
    bank.increment_correction_applied(&cid).await.unwrap();

    let stats = bank.get_stats().await.unwrap();
    assert_eq!(stats.interactions, 2);
    assert_eq!(stats.contexts, 1);
    assert_eq!(stats.corrections, 1);
    assert_eq!(stats.total_corrections_applied, 1);
    assert_eq!(stats.high_confidence_contexts, 1);
    assert_eq!(stats.distinct_sessions, 2);
    assert!((stats.avg_sentiment - 0.2).abs() < 1e-6);
    assert!((stats.avg_feedback - 1.0).abs() < 1e-6);
    assert_eq!(stats.hot_contexts[0].key, "hot");
    assert_eq!(stats.hot_contexts[0].access_count, 2);
}

#[tokio::test]
async fn test_concurrent_context_reads_count_exactly() {
    let (_dir, bank) = test_bank().await;
    bank.save_context("counter", &serde_json::json!(0), None, 0.5)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let bank = bank.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                bank.get_context("counter").await.unwrap().unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // 20 reads happened; one more read observes 21 including its own bump
    let ctx = bank.get_context("counter").await.unwrap().unwrap();
    assert_eq!(ctx.access_count, 21);
}
