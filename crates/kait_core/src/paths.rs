use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Per-user state directory layout.
///
/// Everything the core persists lives under one root (default `~/.kait`,
/// override with `KAIT_HOME`). Tests point this at a tempdir.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Resolve the state directory and create it if missing.
    pub fn resolve() -> Result<Self> {
        let root = match std::env::var("KAIT_HOME") {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".kait"),
        };
        Self::at(root)
    }

    /// Use an explicit root (tests, alternate profiles).
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create state dir {}", root.display()))?;
        std::fs::create_dir_all(root.join("logs"))?;
        std::fs::create_dir_all(root.join("pids"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reasoning Bank backing store.
    pub fn bank_db(&self) -> PathBuf {
        self.root.join("sidekick.db")
    }

    /// Circuit breaker snapshot.
    pub fn breaker_state(&self) -> PathBuf {
        self.root.join("llm_health_state.json")
    }

    /// Persistent cost ledger.
    pub fn cost_db(&self) -> PathBuf {
        self.root.join("llm_costs.db")
    }

    /// Observability log (rotating: `.1`, `.2`, ...).
    pub fn llm_calls_log(&self) -> PathBuf {
        self.root.join("logs").join("llm_calls.jsonl")
    }

    pub fn worker_log(&self, worker: &str) -> PathBuf {
        self.root.join("logs").join(format!("{worker}.log"))
    }

    /// Single-instance PID lock for a worker.
    pub fn pid_lock(&self, worker: &str) -> PathBuf {
        self.root.join("pids").join(format!("{worker}.lock"))
    }

    /// Per-worker heartbeat file.
    pub fn heartbeat(&self, worker: &str) -> PathBuf {
        self.root.join(format!("{worker}_heartbeat.json"))
    }

    /// Bounded ingest quarantine.
    pub fn invalid_events(&self) -> PathBuf {
        self.root.join("invalid_events.jsonl")
    }

    /// Accepted-event spool the bridge worker drains.
    pub fn event_spool(&self) -> PathBuf {
        self.root.join("events.ndjson")
    }

    /// Evolution engine state.
    pub fn evolution_state(&self) -> PathBuf {
        self.root.join("sidekick_evolution.json")
    }

    /// Fallback location for the ingest bearer token.
    pub fn kaitd_token(&self) -> PathBuf {
        self.root.join("kaitd.token")
    }

    /// Sentinel file enabling plugin-only watchdog mode.
    pub fn plugin_only_sentinel(&self) -> PathBuf {
        self.root.join("plugin_only")
    }
}
