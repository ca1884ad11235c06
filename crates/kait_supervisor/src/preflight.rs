//! Preflight checks for `kait check`.
//!
//! Verifies the environment can actually run the service mesh before
//! anything is started. All checks pass -> exit code 0.

use kait_core::{KaitConfig, StateDir};
use serde::Serialize;
use std::process::Command;

const MIN_FREE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        }
    }
}

/// Run every preflight check. GPU detection is informational and never
/// fails the run.
pub fn run_preflight_checks(state_dir: &StateDir, config: &KaitConfig) -> Vec<CheckResult> {
    vec![
        check_runtime(),
        check_ollama_binary(),
        check_ollama_reachable(config),
        check_data_dir_writable(state_dir),
        check_disk_space(state_dir),
        check_gpu(),
    ]
}

pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

fn check_runtime() -> CheckResult {
    // We are running, so the runtime exists; report the version if the
    // toolchain is installed.
    let version = Command::new("rustc")
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "runtime present (rustc not on PATH)".to_string());
    CheckResult::new("runtime", true, version)
}

fn check_ollama_binary() -> CheckResult {
    let found = Command::new("ollama")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    CheckResult::new(
        "ollama_binary",
        found,
        if found {
            "ollama binary found"
        } else {
            "ollama binary not on PATH"
        },
    )
}

fn check_ollama_reachable(config: &KaitConfig) -> CheckResult {
    let addr = format!("{}:{}", config.ollama.host, config.ollama.port);
    let reachable = match addr.parse() {
        Ok(sock) => std::net::TcpStream::connect_timeout(
            &sock,
            std::time::Duration::from_secs(2),
        )
        .is_ok(),
        Err(_) => std::net::TcpStream::connect(&addr).is_ok(),
    };
    CheckResult::new(
        "ollama_reachable",
        reachable,
        format!("{addr} {}", if reachable { "reachable" } else { "not reachable" }),
    )
}

fn check_data_dir_writable(state_dir: &StateDir) -> CheckResult {
    let probe = state_dir.root().join(".preflight_probe");
    let writable = std::fs::write(&probe, b"probe").is_ok();
    let _ = std::fs::remove_file(&probe);
    CheckResult::new(
        "data_dir_writable",
        writable,
        format!(
            "{} {}",
            state_dir.root().display(),
            if writable { "writable" } else { "not writable" }
        ),
    )
}

fn check_disk_space(state_dir: &StateDir) -> CheckResult {
    match free_bytes(state_dir) {
        Some(free) => {
            let passed = free >= MIN_FREE_BYTES;
            CheckResult::new(
                "disk_space",
                passed,
                format!("{:.1} GiB free", free as f64 / (1024.0 * 1024.0 * 1024.0)),
            )
        }
        None => CheckResult::new("disk_space", true, "free space unknown, assuming ok"),
    }
}

#[cfg(unix)]
fn free_bytes(state_dir: &StateDir) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let path = std::ffi::CString::new(state_dir.root().as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_bytes(_state_dir: &StateDir) -> Option<u64> {
    None
}

fn check_gpu() -> CheckResult {
    let detected = Command::new("nvidia-smi")
        .arg("--query-gpu=name")
        .arg("--format=csv,noheader")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty());
    match detected {
        // GPU is a bonus, not a requirement
        Some(name) => CheckResult::new("gpu", true, format!("GPU: {name}")),
        None => CheckResult::new("gpu", true, "no GPU detected (CPU inference)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_checks_run_and_report() {
        let dir = tempdir().unwrap();
        let state_dir = StateDir::at(dir.path()).unwrap();
        let results = run_preflight_checks(&state_dir, &KaitConfig::default());

        assert_eq!(results.len(), 6);
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"runtime"));
        assert!(names.contains(&"disk_space"));

        // These hold in any sane test environment
        let by_name = |name: &str| results.iter().find(|r| r.name == name).unwrap();
        assert!(by_name("runtime").passed);
        assert!(by_name("data_dir_writable").passed);
        assert!(by_name("gpu").passed);
    }

    #[test]
    fn test_all_passed() {
        let results = vec![
            CheckResult::new("a", true, ""),
            CheckResult::new("b", true, ""),
        ];
        assert!(all_passed(&results));
        let results = vec![
            CheckResult::new("a", true, ""),
            CheckResult::new("b", false, ""),
        ];
        assert!(!all_passed(&results));
    }
}
