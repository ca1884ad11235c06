//! Bounded quarantine for malformed ingest events.
//!
//! Invalid payloads are never retried; they land here for inspection.
//! The file keeps only the most recent N entries and truncates oversized
//! payloads, so a misbehaving adapter cannot grow it without bound.

use kait_core::now_ts;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

const TRUNCATION_MARKER: &str = "...<truncated>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub ts: f64,
    pub reason: String,
    pub payload: String,
}

pub struct Quarantine {
    path: PathBuf,
    max_lines: usize,
    max_payload_chars: usize,
    lock: Mutex<()>,
}

impl Quarantine {
    pub fn new(path: PathBuf, max_lines: usize, max_payload_chars: usize) -> Self {
        Self {
            path,
            max_lines: max_lines.max(1),
            max_payload_chars: max_payload_chars.max(1),
            lock: Mutex::new(()),
        }
    }

    /// File-backed quarantine with production defaults.
    pub fn with_defaults(path: PathBuf) -> Self {
        Self::new(path, 500, 2000)
    }

    /// Record an invalid payload with its rejection reason.
    pub fn record(&self, payload: &str, reason: &str) {
        let _guard = self.lock.lock().unwrap();

        let mut truncated: String = payload.chars().take(self.max_payload_chars).collect();
        if payload.chars().count() > self.max_payload_chars {
            truncated.push_str(TRUNCATION_MARKER);
        }
        let entry = QuarantineEntry {
            ts: now_ts(),
            reason: reason.to_string(),
            payload: truncated,
        };
        let Ok(line) = serde_json::to_string(&entry) else {
            return;
        };

        // Keep the newest max_lines entries, oldest dropped
        let mut lines: Vec<String> = std::fs::read_to_string(&self.path)
            .map(|content| content.lines().map(str::to_string).collect())
            .unwrap_or_default();
        lines.push(line);
        if lines.len() > self.max_lines {
            lines.drain(..lines.len() - self.max_lines);
        }

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&self.path, lines.join("\n") + "\n");
    }

    /// Entries currently on disk, oldest first.
    pub fn entries(&self) -> Vec<QuarantineEntry> {
        let _guard = self.lock.lock().unwrap();
        std::fs::read_to_string(&self.path)
            .map(|content| {
                content
                    .lines()
                    .filter_map(|l| serde_json::from_str(l).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bounded_and_truncated() {
        let dir = tempdir().unwrap();
        let q = Quarantine::new(dir.path().join("invalid_events.jsonl"), 3, 12);

        for i in 0..5 {
            q.record(&"x".repeat(200), &format!("reason-{i}"));
        }

        let entries = q.entries();
        assert_eq!(entries.len(), 3);
        // Oldest two dropped
        let reasons: Vec<&str> = entries.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["reason-2", "reason-3", "reason-4"]);
        // Payload truncated to 12 chars plus the marker
        assert!(entries[2].payload.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            entries[2].payload.len(),
            12 + TRUNCATION_MARKER.len()
        );
    }

    #[test]
    fn test_small_payload_not_truncated() {
        let dir = tempdir().unwrap();
        let q = Quarantine::new(dir.path().join("invalid_events.jsonl"), 3, 100);
        q.record("tiny", "parse error");
        let entries = q.entries();
        assert_eq!(entries[0].payload, "tiny");
        assert!(!entries[0].payload.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let q = Quarantine::new(dir.path().join("absent.jsonl"), 3, 100);
        assert!(q.entries().is_empty());
    }
}
