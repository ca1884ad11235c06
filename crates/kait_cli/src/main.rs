mod workers;

use clap::{Parser, Subcommand};
use kait_core::{KaitConfig, StateDir};
use kait_supervisor::{all_passed, run_preflight_checks, Supervisor, WorkerKind};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to TOML config file
    #[arg(short, long, default_value = "kait.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Log file path (in addition to stderr)
    #[arg(long)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the service mesh (ingest daemon, bridge, scheduler, pulse,
    /// watchdog, optional matrix worker)
    Start {
        /// Only verify the environment and the local LLM; spawn nothing
        #[arg(long)]
        no_services: bool,
    },
    /// End supervision (stop the watchdog), leaving background services
    /// running unless told otherwise
    Stop {
        /// Also stop the background services (kaitd, bridge, scheduler,
        /// pulse, matrix) in reverse dependency order
        #[arg(long)]
        stop_services_on_exit: bool,
    },
    /// Show per-worker status
    Status,
    /// Run preflight checks and exit (0 = all passed)
    Check,
    /// Run a worker loop in-process (spawned by the supervisor)
    #[command(hide = true)]
    Worker {
        /// Worker name: kaitd, bridge_worker, scheduler, pulse,
        /// matrix_worker, watchdog
        name: String,
    },
}

fn init_tracing(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let stderr_layer = if args.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().map(|f| f.to_os_string()).unwrap_or_default();
            let appender = tracing_appender::rolling::never(dir, file);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(non_blocking).boxed()),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let _log_guard = init_tracing(&args);

    let config = KaitConfig::load_or_default(&args.config);
    let state_dir = StateDir::resolve()?;

    match args.command {
        Command::Start { no_services } => {
            let supervisor = Supervisor::new(state_dir, config);

            let ollama_up = supervisor.ensure_ollama();
            if !ollama_up {
                eprintln!("warning: local LLM is not reachable; cloud providers only");
            }
            if no_services {
                println!("Environment verified (services not started).");
                return Ok(());
            }

            let mut failed = false;
            for (worker, result) in supervisor.start_all() {
                match result {
                    Ok(pid) => println!("  started {worker} (pid {pid})"),
                    Err(e) => {
                        failed = true;
                        eprintln!("  failed to start {worker}: {e}");
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
        Command::Stop { stop_services_on_exit } => {
            let supervisor = Supervisor::new(state_dir, config);
            // Supervision ends first so nothing gets restarted mid-teardown
            match supervisor.stop(WorkerKind::Watchdog) {
                Ok(()) => println!("  stopped watchdog"),
                Err(e) => eprintln!("  failed to stop watchdog: {e}"),
            }
            if stop_services_on_exit {
                for worker in WorkerKind::stop_order(true) {
                    if worker == WorkerKind::Watchdog {
                        continue;
                    }
                    match supervisor.stop(worker) {
                        Ok(()) => println!("  stopped {worker}"),
                        Err(e) => eprintln!("  failed to stop {worker}: {e}"),
                    }
                }
            } else {
                println!(
                    "Background services left running; pass --stop-services-on-exit to stop them."
                );
            }
        }
        Command::Status => {
            let supervisor = Supervisor::new(state_dir, config);
            let ollama = if supervisor.ollama_reachable() { "up" } else { "down" };
            println!("local LLM: {ollama}");
            for worker in WorkerKind::start_order(true) {
                let status = supervisor.status(worker);
                let state = if status.running { "running" } else { "stopped" };
                let pid = status
                    .pid
                    .map(|p| format!(" (pid {p})"))
                    .unwrap_or_default();
                let heartbeat = status
                    .heartbeat_age_s
                    .map(|a| format!(", heartbeat {a:.0}s ago"))
                    .unwrap_or_default();
                println!("  {worker}: {state}{pid}{heartbeat}");
            }
        }
        Command::Check => {
            let results = run_preflight_checks(&state_dir, &config);
            for check in &results {
                let mark = if check.passed { "ok " } else { "FAIL" };
                println!("  [{mark}] {}: {}", check.name, check.detail);
            }
            if !all_passed(&results) {
                std::process::exit(1);
            }
        }
        Command::Worker { name } => {
            let Some(worker) = WorkerKind::parse(&name) else {
                anyhow::bail!("unknown worker: {name}");
            };
            info!("Worker {} starting (pid {})", worker, std::process::id());
            workers::run_worker(worker, state_dir, config).await?;
        }
    }

    Ok(())
}
