//! Per-worker heartbeat files.
//!
//! Each worker overwrites a small JSON file on its heartbeat interval;
//! the watchdog reads the timestamp to detect stalls. Writes go through a
//! temp file + rename so a reader never sees a torn heartbeat.

use kait_core::now_ts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ts: f64,
    pub pid: u32,
    pub status: String,
    /// Worker-specific counters (events drained, cycles run, ...).
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

impl Heartbeat {
    pub fn age_seconds(&self) -> f64 {
        (now_ts() - self.ts).max(0.0)
    }
}

pub fn write_heartbeat(
    path: &Path,
    status: &str,
    counters: &BTreeMap<String, u64>,
) -> anyhow::Result<()> {
    let beat = Heartbeat {
        ts: now_ts(),
        pid: std::process::id(),
        status: status.to_string(),
        counters: counters.clone(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&beat)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_heartbeat(path: &Path) -> Option<Heartbeat> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kaitd_heartbeat.json");

        let mut counters = BTreeMap::new();
        counters.insert("events_drained".to_string(), 17);
        write_heartbeat(&path, "running", &counters).unwrap();

        let beat = read_heartbeat(&path).unwrap();
        assert_eq!(beat.pid, std::process::id());
        assert_eq!(beat.status, "running");
        assert_eq!(beat.counters.get("events_drained"), Some(&17));
        assert!(beat.age_seconds() < 5.0);
    }

    #[test]
    fn test_missing_or_corrupt_reads_none() {
        let dir = tempdir().unwrap();
        assert!(read_heartbeat(&dir.path().join("absent.json")).is_none());

        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, "{{not json").unwrap();
        assert!(read_heartbeat(&path).is_none());
    }

    #[test]
    fn test_overwrite_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hb.json");
        write_heartbeat(&path, "starting", &BTreeMap::new()).unwrap();
        write_heartbeat(&path, "running", &BTreeMap::new()).unwrap();
        assert_eq!(read_heartbeat(&path).unwrap().status, "running");
    }
}
