//! Single-instance PID locks.
//!
//! A lock is an atomically-created file (`O_CREAT|O_EXCL`) containing the
//! owner's pid. A lock whose recorded pid is dead is stale and gets
//! reclaimed; a lock whose pid is alive means another instance runs.

use kait_core::KaitError;
use std::io::Write;
use std::path::Path;

/// Whether a process with this pid exists.
///
/// Signal 0 probes without delivering; EPERM still means the process
/// exists (it just belongs to someone else).
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Pid recorded in a lock file, if it parses.
pub fn read_lock_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Acquire the lock for `worker`, writing `pid` into it.
///
/// Stale locks (dead recorded pid) are reclaimed. Returns `LockHeld` when
/// a live instance owns the lock.
pub fn acquire_pid_lock(path: &Path, worker: &str, pid: u32) -> Result<(), KaitError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KaitError::Other(e.into()))?;
    }

    // Two attempts: the second runs after reclaiming a stale lock
    for _ in 0..2 {
        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                write!(file, "{pid}").map_err(|e| KaitError::Other(e.into()))?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_lock_pid(path) {
                    Some(existing) if pid_alive(existing) => {
                        return Err(KaitError::LockHeld {
                            worker: worker.to_string(),
                            pid: existing,
                        });
                    }
                    _ => {
                        // Stale or unreadable: reclaim and retry
                        tracing::info!(
                            "Reclaiming stale lock for {} at {}",
                            worker,
                            path.display()
                        );
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
            Err(e) => return Err(KaitError::Other(e.into())),
        }
    }

    Err(KaitError::StartFailed {
        worker: worker.to_string(),
        reason: "could not acquire pid lock".to_string(),
    })
}

pub fn release_pid_lock(path: &Path) {
    let _ = std::fs::remove_file(path);
}
