pub mod control;
pub mod heartbeat;
pub mod pidlock;
pub mod preflight;
pub mod watchdog;
pub mod worker;

pub use control::{Supervisor, WorkerStatus};
pub use heartbeat::{read_heartbeat, write_heartbeat, Heartbeat};
pub use pidlock::{acquire_pid_lock, pid_alive, release_pid_lock, read_lock_pid};
pub use preflight::{all_passed, run_preflight_checks, CheckResult};
pub use watchdog::Watchdog;
pub use worker::WorkerKind;
