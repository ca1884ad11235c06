//! Worker run loops.
//!
//! The supervisor spawns `kait worker <name>` as a detached child; this
//! module is the body of each of those processes. Every worker owns its
//! PID lock, writes its heartbeat, and exits cleanly on SIGTERM.
//!
//! Process ownership of shared files:
//! - bridge: the gateway, breakers (snapshot file) and the JSONL call log
//! - scheduler: the evolution state file and the cost ledger
//! - pulse and scheduler hydrate read-only observers from the JSONL log

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kait_bank::{NewInteraction, ReasoningBank};
use kait_core::{IngestEvent, KaitConfig, KaitError, StateDir};
use kait_daemon::{
    ingest_app, pulse_app, EventQueue, IngestState, OpsProvider, PulseState, Quarantine,
    SlidingWindowLimiter,
};
use kait_llm::{
    BreakerRegistry, ChatMessage, CompletionParams, LlmCallRecord, LlmGateway, LlmObserver,
    Router,
};
use kait_reflection::{
    refine_system_prompt, ArchiveWorker, BehaviorRule, EvolutionEngine, ReflectionPipeline,
    ResonanceEngine,
};
use kait_supervisor::{
    acquire_pid_lock, release_pid_lock, write_heartbeat, Supervisor, Watchdog, WorkerKind,
};
use tracing::{error, info, warn};

const BASE_SYSTEM_PROMPT: &str = "\
You are Kait, a self-evolving AI sidekick with hybrid local and cloud \
intelligence. You learn from every interaction, adapt to the user over \
time, and communicate clearly and warmly. Keep responses conversational \
and concise unless the user asks for depth.";

/// Canned replies when every provider in the chain fails. The user never
/// sees a stack trace.
const FALLBACK_RESPONSES: &[&str] = &[
    "I'm having trouble reaching my language models right now. Give me a moment and try again.",
    "My thinking engines are all offline at the moment. I'll be back shortly.",
    "Something is wrong with my model connections. Your message is saved; ask me again soon.",
];

type Counters = Arc<Mutex<BTreeMap<String, u64>>>;

fn bump(counters: &Counters, key: &str) {
    let mut map = counters.lock().unwrap();
    *map.entry(key.to_string()).or_default() += 1;
}

pub async fn run_worker(
    worker: WorkerKind,
    state_dir: StateDir,
    config: KaitConfig,
) -> anyhow::Result<()> {
    let lock_path = state_dir.pid_lock(worker.name());
    let my_pid = std::process::id();
    match acquire_pid_lock(&lock_path, worker.name(), my_pid) {
        Ok(()) => {}
        // The supervisor pre-registers the child pid in the lock
        Err(KaitError::LockHeld { pid, .. }) if pid == my_pid => {}
        Err(e) => return Err(e.into()),
    }

    let counters: Counters = Arc::new(Mutex::new(BTreeMap::new()));
    let heartbeat_handle = spawn_heartbeat(
        state_dir.heartbeat(worker.name()),
        config.watchdog.heartbeat_interval_s,
        counters.clone(),
    );

    let result = match worker {
        WorkerKind::Kaitd => run_kaitd(&state_dir, &config, counters).await,
        WorkerKind::Bridge => run_bridge(&state_dir, &config, counters).await,
        WorkerKind::Scheduler => run_scheduler(&state_dir, &config, counters).await,
        WorkerKind::Pulse => run_pulse(&state_dir, &config, counters).await,
        WorkerKind::Matrix => run_matrix(counters).await,
        WorkerKind::Watchdog => run_watchdog(&state_dir, &config, counters).await,
    };

    heartbeat_handle.abort();
    release_pid_lock(&lock_path);
    let _ = std::fs::remove_file(state_dir.heartbeat(worker.name()));
    info!("Worker {} exited", worker);
    result
}

fn spawn_heartbeat(
    path: std::path::PathBuf,
    interval_s: u64,
    counters: Counters,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
        loop {
            ticker.tick().await;
            let snapshot = counters.lock().unwrap().clone();
            if let Err(e) = write_heartbeat(&path, "running", &snapshot) {
                warn!("Heartbeat write failed: {}", e);
            }
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("sigterm handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ---------------------------------------------------------------------------
// kaitd
// ---------------------------------------------------------------------------

async fn run_kaitd(
    state_dir: &StateDir,
    config: &KaitConfig,
    _counters: Counters,
) -> anyhow::Result<()> {
    let state = IngestState::new(
        Arc::new(EventQueue::new(state_dir.event_spool())),
        Arc::new(Quarantine::with_defaults(state_dir.invalid_events())),
        Arc::new(SlidingWindowLimiter::new(60, 60.0)),
        kait_daemon::ingest::resolve_token(state_dir),
    );
    let app = ingest_app(state);

    let addr = format!("127.0.0.1:{}", config.ports.kaitd);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("kaitd listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// pulse
// ---------------------------------------------------------------------------

struct SupervisorOps(Supervisor);

impl OpsProvider for SupervisorOps {
    fn service_status(&self) -> serde_json::Value {
        self.0.service_status()
    }

    fn ops_view(&self) -> serde_json::Value {
        serde_json::json!({
            "workers": WorkerKind::start_order(true)
                .iter()
                .map(|w| w.name())
                .collect::<Vec<_>>(),
            "ollama_reachable": self.0.ollama_reachable(),
            "state_dir": self.0.state_dir().root().display().to_string(),
        })
    }
}

async fn run_pulse(
    state_dir: &StateDir,
    config: &KaitConfig,
    _counters: Counters,
) -> anyhow::Result<()> {
    let bank = ReasoningBank::new(state_dir.bank_db()).await?;
    let observer = Arc::new(LlmObserver::in_memory());
    let evolution = Arc::new(tokio::sync::Mutex::new(EvolutionEngine::new(
        state_dir.evolution_state(),
    )));

    // Keep the read-only views fresh: tail the shared call log into the
    // local observer and reload evolution state written by the scheduler.
    {
        let observer = observer.clone();
        let evolution = evolution.clone();
        let log_path = state_dir.llm_calls_log();
        let evolution_path = state_dir.evolution_state();
        tokio::spawn(async move {
            let mut watermark = 0.0f64;
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                watermark = hydrate_observer(&observer, &log_path, watermark);
                *evolution.lock().await = EvolutionEngine::new(&evolution_path);
            }
        });
    }

    let state = PulseState {
        bank,
        observer,
        queue: Arc::new(EventQueue::new(state_dir.event_spool())),
        evolution,
        ops: Arc::new(SupervisorOps(Supervisor::new(
            state_dir.clone(),
            config.clone(),
        ))),
        kaitd_port: config.ports.kaitd,
    };
    let app = pulse_app(state);

    let addr = format!("127.0.0.1:{}", config.ports.pulse);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("pulse listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Tail the shared JSONL call log into a local in-memory observer.
/// Returns the new timestamp watermark.
fn hydrate_observer(observer: &Arc<LlmObserver>, path: &std::path::Path, watermark: f64) -> f64 {
    let Ok(content) = std::fs::read_to_string(path) else {
        return watermark;
    };
    let mut newest = watermark;
    for line in content.lines() {
        if let Ok(record) = serde_json::from_str::<LlmCallRecord>(line) {
            if record.timestamp > watermark {
                if record.timestamp > newest {
                    newest = record.timestamp;
                }
                observer.record(record);
            }
        }
    }
    newest
}

// ---------------------------------------------------------------------------
// bridge
// ---------------------------------------------------------------------------

async fn run_bridge(
    state_dir: &StateDir,
    config: &KaitConfig,
    counters: Counters,
) -> anyhow::Result<()> {
    let bank = ReasoningBank::new(state_dir.bank_db()).await?;
    let observer = Arc::new(LlmObserver::new(
        config.observability.clone(),
        Some(state_dir.llm_calls_log()),
    ));
    let breakers = Arc::new(BreakerRegistry::new(
        config.breaker.clone(),
        Some(state_dir.breaker_state()),
    ));
    let router = Router::new(config.router.clone(), None);
    let gateway = LlmGateway::from_config(config, router, breakers.clone(), observer)?;
    let queue = EventQueue::new(state_dir.event_spool());
    let mut resonance = ResonanceEngine::new();

    let mut drain_tick = tokio::time::interval(Duration::from_secs(2));
    let mut snapshot_tick =
        tokio::time::interval(Duration::from_secs(config.breaker.snapshot_interval_s.max(10)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("bridge draining {}", state_dir.event_spool().display());
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = snapshot_tick.tick() => breakers.save_state(),
            _ = drain_tick.tick() => {
                for event in queue.drain(50) {
                    if let Err(e) = process_event(&bank, &gateway, &mut resonance, &event).await {
                        error!("Event processing failed: {}", e);
                        bump(&counters, "events_failed");
                    } else {
                        bump(&counters, "events_processed");
                    }
                }
            }
        }
    }

    // Clean shutdown persists the breaker snapshot
    breakers.save_state();
    Ok(())
}

async fn process_event(
    bank: &ReasoningBank,
    gateway: &LlmGateway,
    resonance: &mut ResonanceEngine,
    event: &IngestEvent,
) -> Result<(), KaitError> {
    match event.kind.as_str() {
        "user_message" => {
            let Some(user_input) = event.body.as_deref().filter(|b| !b.trim().is_empty()) else {
                return Err(KaitError::InvalidEvent("user_message without body".into()));
            };

            // Prompt assembly uses the current learned state; corrections
            // injected here count as applied
            let rules: Vec<BehaviorRule> = bank
                .get_active_behavior_rules()
                .await?
                .iter()
                .map(BehaviorRule::from_row)
                .collect();
            let corrections = bank.get_recent_corrections(5).await?;
            let preferences = bank.get_all_preferences().await?;
            let system = refine_system_prompt(BASE_SYSTEM_PROMPT, &rules, &corrections, &preferences);
            for correction in &corrections {
                bank.increment_correction_applied(&correction.id).await?;
            }

            let messages = vec![ChatMessage::user(user_input)];
            let response = gateway
                .chat(&messages, Some(&system), &CompletionParams::default(), None)
                .await
                .unwrap_or_else(|| {
                    let idx = user_input.len() % FALLBACK_RESPONSES.len();
                    FALLBACK_RESPONSES[idx].to_string()
                });

            let outcome = resonance.process_interaction(user_input, &response, None);
            bank.save_interaction(NewInteraction {
                user_input: user_input.to_string(),
                ai_response: response,
                mood: Some(outcome.mood),
                sentiment_score: outcome.sentiment.score,
                session_id: event.session_id.clone(),
                source: event.source.clone(),
                source_meta: event.meta.as_ref().map(|m| m.to_string()),
                ..Default::default()
            })
            .await?;
            Ok(())
        }
        "feedback" => {
            let interaction_id = event
                .meta
                .as_ref()
                .and_then(|m| m.get("interaction_id"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    KaitError::InvalidEvent("feedback without meta.interaction_id".into())
                })?;
            let score: f64 = event
                .body
                .as_deref()
                .and_then(|b| b.trim().parse().ok())
                .ok_or_else(|| KaitError::InvalidEvent("feedback without numeric body".into()))?;
            bank.update_interaction_feedback(interaction_id, score.clamp(0.0, 1.0))
                .await?;
            Ok(())
        }
        "correction" => {
            let correction = event
                .body
                .as_deref()
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| KaitError::InvalidEvent("correction without body".into()))?;
            let meta = event.meta.as_ref();
            let original = meta
                .and_then(|m| m.get("original"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let reason = meta.and_then(|m| m.get("reason")).and_then(|v| v.as_str());
            let domain = meta.and_then(|m| m.get("domain")).and_then(|v| v.as_str());
            bank.record_correction(original, correction, reason, domain)
                .await?;
            Ok(())
        }
        other => {
            // Unknown kinds are ignored, not errors: adapters may be newer
            tracing::debug!("Ignoring event kind {}", other);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// scheduler
// ---------------------------------------------------------------------------

async fn run_scheduler(
    state_dir: &StateDir,
    config: &KaitConfig,
    counters: Counters,
) -> anyhow::Result<()> {
    let bank = ReasoningBank::new(state_dir.bank_db()).await?;
    let observer = Arc::new(LlmObserver::in_memory());
    let mut evolution = EvolutionEngine::new(state_dir.evolution_state());
    let mut pipeline = ReflectionPipeline::new(
        bank.clone(),
        observer.clone(),
        &config.reflection,
        BASE_SYSTEM_PROMPT,
    );
    let cost_tracker = kait_llm::CostTracker::new(state_dir.cost_db()).await?;

    let log_path = state_dir.llm_calls_log();
    let mut watermark = 0.0f64;
    let mut seen_interactions_until = 0.0f64;
    let mut last_archive = std::time::Instant::now()
        .checked_sub(Duration::from_secs(config.archive.cycle_interval_s))
        .unwrap_or_else(std::time::Instant::now);

    let mut tick = tokio::time::interval(Duration::from_secs(60));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("scheduler running");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tick.tick() => {
                watermark = hydrate_observer(&observer, &log_path, watermark);

                // Fold newly persisted interactions into the evolution
                // metrics; the scheduler is the only writer of that state
                match bank.get_interaction_history(100, None, None, true).await {
                    Ok(interactions) => {
                        let threshold = seen_interactions_until;
                        for ix in interactions.iter().rev().filter(|i| i.timestamp > threshold) {
                            let quality = ix.feedback_score.unwrap_or(0.5);
                            let resonance = (ix.sentiment_score + 1.0) / 2.0;
                            let success = ix.feedback_score.map(|f| f >= 0.4).unwrap_or(true);
                            evolution.record_interaction_outcome(success, resonance, quality);
                            pipeline.note_interaction();
                            seen_interactions_until = seen_interactions_until.max(ix.timestamp);
                        }
                    }
                    Err(e) => warn!("Interaction scan failed: {}", e),
                }

                match pipeline.maybe_run(&mut evolution).await {
                    Ok(Some(report)) => {
                        bump(&counters, "reflection_cycles");
                        if report.stage.evolved {
                            info!("Evolution stage advanced to {} ({})", report.stage.stage, report.stage.stage_name);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("Reflection cycle failed: {}", e),
                }

                if last_archive.elapsed() >= Duration::from_secs(config.archive.cycle_interval_s) {
                    last_archive = std::time::Instant::now();
                    let worker = ArchiveWorker::new(&bank, None, config.archive.age_seconds);
                    let outcome = worker.run_archive_cycle().await;
                    if outcome.batches_created > 0 {
                        info!(
                            "Archived {} interactions in {} batch(es)",
                            outcome.interactions_archived, outcome.batches_created
                        );
                        bump(&counters, "archive_batches");
                    }
                    for err in outcome.errors {
                        warn!("Archive error: {}", err);
                    }
                }

                if let Err(e) = cost_tracker.sync_from_observer(&observer).await {
                    warn!("Cost sync failed: {}", e);
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// matrix
// ---------------------------------------------------------------------------

/// The Matrix protocol bridge is an external collaborator; this worker is
/// the supervised shell around its inbox.
async fn run_matrix(counters: Counters) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<IngestEvent>(256);
    // Held so the channel stays open for a future protocol adapter
    let _inbox = tx;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("matrix worker idle (no protocol adapter attached)");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = rx.recv() => {
                match event {
                    Some(_) => bump(&counters, "inbox_events"),
                    None => break,
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// watchdog
// ---------------------------------------------------------------------------

async fn run_watchdog(
    state_dir: &StateDir,
    config: &KaitConfig,
    counters: Counters,
) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(state_dir.clone(), config.clone());
    let mut watchdog = Watchdog::new(config.watchdog.clone());

    let mut tick = tokio::time::interval(Duration::from_secs(config.watchdog.check_interval_s.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("watchdog running");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tick.tick() => {
                let results = watchdog.sweep(&supervisor);
                for result in results {
                    if matches!(result.action, kait_supervisor::watchdog::SweepAction::Restarted) {
                        bump(&counters, "restarts");
                    }
                }
            }
        }
    }
    Ok(())
}
