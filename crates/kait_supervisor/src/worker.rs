//! Worker registry and dependency order.

use serde::{Deserialize, Serialize};

/// The long-running workers the supervisor manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Ingest HTTP daemon.
    Kaitd,
    /// Drains the event spool into the Reasoning Bank.
    Bridge,
    /// Periodic jobs: reflection, archive, breaker snapshots, cost sync.
    Scheduler,
    /// Status/dashboard HTTP daemon.
    Pulse,
    /// Optional Matrix inbox worker.
    Matrix,
    /// Monitors and restarts the rest; always started last.
    Watchdog,
}

impl WorkerKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::Kaitd => "kaitd",
            WorkerKind::Bridge => "bridge_worker",
            WorkerKind::Scheduler => "scheduler",
            WorkerKind::Pulse => "pulse",
            WorkerKind::Matrix => "matrix_worker",
            WorkerKind::Watchdog => "watchdog",
        }
    }

    pub fn parse(name: &str) -> Option<WorkerKind> {
        match name {
            "kaitd" => Some(WorkerKind::Kaitd),
            "bridge_worker" | "bridge" => Some(WorkerKind::Bridge),
            "scheduler" => Some(WorkerKind::Scheduler),
            "pulse" => Some(WorkerKind::Pulse),
            "matrix_worker" | "matrix" => Some(WorkerKind::Matrix),
            "watchdog" => Some(WorkerKind::Watchdog),
            _ => None,
        }
    }

    /// Core services stay supervised even in plugin-only mode.
    pub fn is_core(&self) -> bool {
        matches!(self, WorkerKind::Kaitd | WorkerKind::Pulse | WorkerKind::Watchdog)
    }

    /// Start order, leaves first: the ingest daemon comes up before its
    /// consumers, and the watchdog last because it monitors the rest.
    pub fn start_order(matrix_enabled: bool) -> Vec<WorkerKind> {
        let mut order = vec![
            WorkerKind::Kaitd,
            WorkerKind::Bridge,
            WorkerKind::Scheduler,
            WorkerKind::Pulse,
        ];
        if matrix_enabled {
            order.push(WorkerKind::Matrix);
        }
        order.push(WorkerKind::Watchdog);
        order
    }

    /// Stop order is the reverse of start order.
    pub fn stop_order(matrix_enabled: bool) -> Vec<WorkerKind> {
        let mut order = Self::start_order(matrix_enabled);
        order.reverse();
        order
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
