//! Watchdog: detects and restarts stale or dead workers.
//!
//! Policy:
//! - A worker is stale when its heartbeat age exceeds twice its interval.
//! - Restarts are budgeted per worker over a rolling window (default 5
//!   per 10 minutes); beyond the budget the worker is left down and the
//!   exhaustion is logged once per window.
//! - Plugin-only mode (config flag or sentinel file) restricts restarts
//!   to core services; auxiliary workers stay down.

use kait_core::WatchdogConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;

use crate::control::Supervisor;
use crate::worker::WorkerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAction {
    Healthy,
    Restarted,
    BudgetExhausted,
    SkippedPluginOnly,
    SkippedSelf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub worker: String,
    pub action: SweepAction,
}

pub struct Watchdog {
    config: WatchdogConfig,
    restart_log: HashMap<WorkerKind, VecDeque<Instant>>,
    exhaustion_logged: HashMap<WorkerKind, Instant>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            restart_log: HashMap::new(),
            exhaustion_logged: HashMap::new(),
        }
    }

    fn plugin_only(&self, supervisor: &Supervisor) -> bool {
        self.config.plugin_only || supervisor.state_dir().plugin_only_sentinel().exists()
    }

    /// Inspect every supervised worker once, restarting what the policy
    /// allows. The watchdog never restarts itself.
    pub fn sweep(&mut self, supervisor: &Supervisor) -> Vec<SweepResult> {
        let plugin_only = self.plugin_only(supervisor);
        let mut results = Vec::new();

        for worker in WorkerKind::start_order(supervisor.matrix_enabled()) {
            let action = self.check_worker(supervisor, worker, plugin_only);
            results.push(SweepResult {
                worker: worker.name().to_string(),
                action,
            });
        }
        results
    }

    fn check_worker(
        &mut self,
        supervisor: &Supervisor,
        worker: WorkerKind,
        plugin_only: bool,
    ) -> SweepAction {
        if worker == WorkerKind::Watchdog {
            return SweepAction::SkippedSelf;
        }

        let status = supervisor.status(worker);
        let stale_after = 2.0 * self.config.heartbeat_interval_s as f64;
        let stale = status
            .heartbeat_age_s
            .map(|age| age > stale_after)
            // A live pid without a heartbeat yet is a worker still booting
            .unwrap_or(false);
        let needs_restart = !status.running || stale;

        if !needs_restart {
            return SweepAction::Healthy;
        }

        if plugin_only && !worker.is_core() {
            tracing::debug!("{} down but plugin-only mode active, leaving it", worker);
            return SweepAction::SkippedPluginOnly;
        }

        if !self.budget_allows(worker) {
            // Log exhaustion once per window, not every sweep
            let now = Instant::now();
            let should_log = self
                .exhaustion_logged
                .get(&worker)
                .map(|t| now.duration_since(*t).as_secs() >= self.config.restart_window_s)
                .unwrap_or(true);
            if should_log {
                tracing::error!(
                    "{} exceeded restart budget ({} per {}s), leaving it down",
                    worker,
                    self.config.max_restarts,
                    self.config.restart_window_s
                );
                self.exhaustion_logged.insert(worker, now);
            }
            return SweepAction::BudgetExhausted;
        }

        tracing::warn!(
            "{} is {}, restarting",
            worker,
            if status.running { "stale" } else { "down" }
        );
        if status.running {
            let _ = supervisor.stop(worker);
        }
        match supervisor.start(worker) {
            Ok(_) => {
                self.restart_log.entry(worker).or_default().push_back(Instant::now());
                SweepAction::Restarted
            }
            Err(e) => {
                tracing::error!("Restart of {} failed: {}", worker, e);
                self.restart_log.entry(worker).or_default().push_back(Instant::now());
                SweepAction::Restarted
            }
        }
    }

    fn budget_allows(&mut self, worker: WorkerKind) -> bool {
        let window = std::time::Duration::from_secs(self.config.restart_window_s);
        let log = self.restart_log.entry(worker).or_default();
        while log.front().is_some_and(|t| t.elapsed() > window) {
            log.pop_front();
        }
        (log.len() as u32) < self.config.max_restarts
    }
}
