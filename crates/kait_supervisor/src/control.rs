//! Process lifecycle control for the managed workers.
//!
//! Workers run as detached child processes of the form
//! `<current_exe> worker <name>`, each holding its own PID lock and
//! writing its own heartbeat. The supervisor only spawns, signals, and
//! inspects them.

use kait_core::{KaitConfig, KaitError, StateDir};
use serde::Serialize;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::heartbeat::read_heartbeat;
use crate::pidlock::{pid_alive, read_lock_pid, release_pid_lock};
use crate::worker::WorkerKind;

/// Grace period between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_alive: bool,
    pub heartbeat_age_s: Option<f64>,
    pub log_path: String,
}

pub struct Supervisor {
    state_dir: StateDir,
    config: KaitConfig,
    /// Binary to spawn workers from; overridable for tests.
    worker_exe: PathBuf,
}

impl Supervisor {
    pub fn new(state_dir: StateDir, config: KaitConfig) -> Self {
        let worker_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("kait"));
        Self {
            state_dir,
            config,
            worker_exe,
        }
    }

    pub fn with_worker_exe(mut self, exe: PathBuf) -> Self {
        self.worker_exe = exe;
        self
    }

    pub fn state_dir(&self) -> &StateDir {
        &self.state_dir
    }

    pub fn matrix_enabled(&self) -> bool {
        // Matrix rides on its configured port being nonzero
        self.config.ports.matrix_worker != 0
    }

    /// Start a worker. Idempotent: a running worker just returns its pid.
    pub fn start(&self, worker: WorkerKind) -> Result<u32, KaitError> {
        let lock_path = self.state_dir.pid_lock(worker.name());

        if let Some(existing) = read_lock_pid(&lock_path) {
            if pid_alive(existing) {
                tracing::debug!("{} already running (pid {})", worker, existing);
                return Ok(existing);
            }
            release_pid_lock(&lock_path);
        }

        let log_path = self.state_dir.worker_log(worker.name());
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| KaitError::StartFailed {
                worker: worker.name().to_string(),
                reason: format!("cannot open log file: {e}"),
            })?;
        let log_err = log_file.try_clone().map_err(|e| KaitError::StartFailed {
            worker: worker.name().to_string(),
            reason: format!("cannot clone log handle: {e}"),
        })?;

        let child = Command::new(&self.worker_exe)
            .arg("worker")
            .arg(worker.name())
            .env("KAIT_HOME", self.state_dir.root())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| KaitError::StartFailed {
                worker: worker.name().to_string(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        // The child is detached; the lock records its pid for stop/status.
        std::fs::write(&lock_path, pid.to_string()).map_err(|e| KaitError::StartFailed {
            worker: worker.name().to_string(),
            reason: format!("cannot write pid lock: {e}"),
        })?;
        reap_in_background(child);

        tracing::info!("Started {} (pid {})", worker, pid);
        Ok(pid)
    }

    /// Stop a worker: SIGTERM, grace period, then SIGKILL. Idempotent.
    pub fn stop(&self, worker: WorkerKind) -> Result<(), KaitError> {
        let lock_path = self.state_dir.pid_lock(worker.name());
        let heartbeat_path = self.state_dir.heartbeat(worker.name());

        let Some(pid) = read_lock_pid(&lock_path) else {
            tracing::debug!("{} not running (no lock)", worker);
            return Ok(());
        };
        if !pid_alive(pid) {
            release_pid_lock(&lock_path);
            let _ = std::fs::remove_file(&heartbeat_path);
            return Ok(());
        }

        terminate_pid(pid, false);
        let deadline = std::time::Instant::now() + STOP_GRACE;
        while pid_alive(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        if pid_alive(pid) {
            tracing::warn!("{} (pid {}) ignored SIGTERM, killing", worker, pid);
            terminate_pid(pid, true);
        }

        release_pid_lock(&lock_path);
        let _ = std::fs::remove_file(&heartbeat_path);
        tracing::info!("Stopped {} (pid {})", worker, pid);
        Ok(())
    }

    pub fn status(&self, worker: WorkerKind) -> WorkerStatus {
        let lock_path = self.state_dir.pid_lock(worker.name());
        let pid = read_lock_pid(&lock_path);
        let alive = pid.map(pid_alive).unwrap_or(false);
        let heartbeat_age = read_heartbeat(&self.state_dir.heartbeat(worker.name()))
            .map(|b| b.age_seconds());

        WorkerStatus {
            running: alive,
            pid,
            pid_alive: alive,
            heartbeat_age_s: heartbeat_age,
            log_path: self.state_dir.worker_log(worker.name()).display().to_string(),
        }
    }

    pub fn start_all(&self) -> Vec<(WorkerKind, Result<u32, KaitError>)> {
        WorkerKind::start_order(self.matrix_enabled())
            .into_iter()
            .map(|w| (w, self.start(w)))
            .collect()
    }

    pub fn stop_all(&self) -> Vec<(WorkerKind, Result<(), KaitError>)> {
        WorkerKind::stop_order(self.matrix_enabled())
            .into_iter()
            .map(|w| (w, self.stop(w)))
            .collect()
    }

    /// Treat the local LLM daemon as a managed dependency: probe it, and
    /// attempt a detached `ollama serve` when unreachable.
    pub fn ensure_ollama(&self) -> bool {
        if self.ollama_reachable() {
            return true;
        }
        tracing::info!("Ollama not reachable, attempting to start it");
        let spawned = Command::new("ollama")
            .arg("serve")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                reap_in_background(child);
                // Give the daemon a moment to bind
                std::thread::sleep(Duration::from_millis(1500));
                self.ollama_reachable()
            }
            Err(e) => {
                tracing::warn!("Could not start ollama: {}", e);
                false
            }
        }
    }

    pub fn ollama_reachable(&self) -> bool {
        let addr = format!("{}:{}", self.config.ollama.host, self.config.ollama.port);
        match addr.parse() {
            Ok(sock) => {
                std::net::TcpStream::connect_timeout(&sock, Duration::from_secs(2)).is_ok()
            }
            // Hostname: resolve through ToSocketAddrs
            Err(_) => std::net::TcpStream::connect(&addr).is_ok(),
        }
    }

    /// Per-worker status map for the pulse /api/status endpoint.
    pub fn service_status(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for worker in WorkerKind::start_order(true) {
            let status = self.status(worker);
            map.insert(
                worker.name().to_string(),
                serde_json::to_value(status).unwrap_or_default(),
            );
        }
        serde_json::Value::Object(map)
    }
}

/// Wait for the child on a background thread so it never lingers as a
/// zombie under a long-lived supervisor process.
fn reap_in_background(mut child: std::process::Child) {
    std::thread::spawn(move || {
        let _ = child.wait();
    });
}

fn terminate_pid(pid: u32, force: bool) {
    #[cfg(unix)]
    {
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, force);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn supervisor(dir: &tempfile::TempDir) -> Supervisor {
        let state_dir = StateDir::at(dir.path()).unwrap();
        Supervisor::new(state_dir, KaitConfig::default())
            // `sleep` stands in for a worker binary: it accepts the two
            // extra args and stays alive long enough to signal.
            .with_worker_exe(PathBuf::from("/bin/sleep"))
    }

    #[test]
    fn test_status_when_never_started() {
        let dir = tempdir().unwrap();
        let sup = supervisor(&dir);
        let status = sup.status(WorkerKind::Kaitd);
        assert!(!status.running);
        assert!(status.pid.is_none());
        assert!(status.heartbeat_age_s.is_none());
    }

    #[test]
    fn test_stop_when_not_running_is_noop() {
        let dir = tempdir().unwrap();
        let sup = supervisor(&dir);
        sup.stop(WorkerKind::Bridge).unwrap();
    }

    #[test]
    fn test_stale_lock_cleared_by_stop() {
        let dir = tempdir().unwrap();
        let sup = supervisor(&dir);
        let lock = sup.state_dir().pid_lock("scheduler");
        std::fs::write(&lock, "999999999").unwrap();

        sup.stop(WorkerKind::Scheduler).unwrap();
        assert!(!lock.exists());
    }

    #[test]
    fn test_start_records_pid_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let sup = supervisor(&dir);

        // /bin/sleep treats "worker" / "kaitd" as bad args and may exit
        // immediately on some platforms; accept either a live pid or a
        // recorded one. The invariant under test is the lock bookkeeping.
        let pid = sup.start(WorkerKind::Kaitd).unwrap();
        assert!(pid > 0);
        let lock = sup.state_dir().pid_lock("kaitd");
        assert_eq!(read_lock_pid(&lock), Some(pid));

        if pid_alive(pid) {
            // Second start returns the existing pid without spawning
            let again = sup.start(WorkerKind::Kaitd).unwrap();
            assert_eq!(again, pid);
        }

        sup.stop(WorkerKind::Kaitd).unwrap();
        assert!(!lock.exists());
    }

    #[test]
    fn test_stop_all_is_idempotent_and_reverse_ordered() {
        let dir = tempdir().unwrap();
        let sup = supervisor(&dir);

        let results = sup.stop_all();
        assert_eq!(results.len(), WorkerKind::stop_order(true).len());
        assert_eq!(results.first().unwrap().0, WorkerKind::Watchdog);
        assert_eq!(results.last().unwrap().0, WorkerKind::Kaitd);
        // Nothing was running; every stop is a clean no-op
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }

    #[test]
    fn test_service_status_lists_all_workers() {
        let dir = tempdir().unwrap();
        let sup = supervisor(&dir);
        let status = sup.service_status();
        for name in ["kaitd", "bridge_worker", "scheduler", "pulse", "matrix_worker", "watchdog"] {
            assert!(status.get(name).is_some(), "missing {name}");
            assert_eq!(status[name]["running"], false);
        }
    }
}
