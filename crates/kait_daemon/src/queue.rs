//! On-disk event spool between kaitd and the bridge worker.
//!
//! Accepted ingest events append here as NDJSON; the bridge drains them
//! into the Reasoning Bank. The spool reports a rotation flag when it
//! grows past its soft cap so the dashboard can surface backlog.

use kait_core::IngestEvent;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;

/// Soft size cap before the rotation flag raises.
const ROTATION_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub event_count: u64,
    pub size_bytes: u64,
    pub needs_rotation: bool,
}

pub struct EventQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventQueue {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append one accepted event.
    pub fn push(&self, event: &IngestEvent) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let line = serde_json::to_string(event)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let _guard = self.lock.lock().unwrap();
        let size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let event_count = std::fs::read_to_string(&self.path)
            .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count() as u64)
            .unwrap_or(0);
        QueueStats {
            event_count,
            size_bytes,
            needs_rotation: size_bytes > ROTATION_BYTES,
        }
    }

    /// Remove and return up to `max` events from the head of the spool.
    pub fn drain(&self, max: usize) -> Vec<IngestEvent> {
        let _guard = self.lock.lock().unwrap();
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let take = max.min(lines.len());

        let drained: Vec<IngestEvent> = lines[..take]
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();

        let rest = if take < lines.len() {
            lines[take..].join("\n") + "\n"
        } else {
            String::new()
        };
        let _ = std::fs::write(&self.path, rest);

        drained
    }
}
