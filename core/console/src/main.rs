//! Operator console: runs the monitor against a supervisor socket and
//! prints one status line per process on every published update.
//!
//! Monitor errors are fatal here: the console prints them and exits
//! non-zero, leaving the clean-shutdown marker unset so the next run can
//! tell the difference.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use vigil_monitor::{
    supervisor, MonitorConfig, MonitorEvent, OomGuard, OomGuardConfig, PluginHost, ProcessMonitor,
    SocketSupervisorClient, StorageConfig,
};

const SUPERVISOR_SOCKET_NAME: &str = "supervisor.sock";

#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Health console for supervised services")]
struct Args {
    /// Path to the supervisor's control socket.
    /// Defaults to <storage-root>/supervisor.sock.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Supervisor poll interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Storage root for statefiles and persisted console state.
    /// Defaults to ~/.vigil.
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Memory limit in MiB for the self-recovery guard.
    #[arg(long, default_value_t = 512)]
    memory_limit_mb: u64,

    /// Disable the memory self-recovery guard.
    #[arg(long)]
    no_oom_guard: bool,
}

enum ConsoleEvent {
    Monitor(MonitorEvent),
    Quit,
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let storage = match &args.storage_root {
        Some(root) => StorageConfig::with_root(root.clone()),
        None => StorageConfig::default(),
    };
    if let Err(err) = storage.ensure_dirs() {
        eprintln!("vigil: cannot prepare storage root: {err}");
        return ExitCode::FAILURE;
    }

    if !storage.did_shutdown_cleanly() {
        warn!("Previous session did not shut down cleanly");
    }
    if let Err(err) = storage.clear_shutdown() {
        warn!(error = %err, "Failed to clear the clean-shutdown marker");
    }

    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| storage.root().join(SUPERVISOR_SOCKET_NAME));
    let client = Arc::new(SocketSupervisorClient::new(socket));

    match supervisor::main_logfile(client.as_ref()) {
        Ok(path) => debug!(path = %path.display(), "Supervisor logfile located"),
        Err(err) => debug!(error = %err, "Supervisor logfile not located"),
    }

    let (monitor_tx, monitor_rx) = mpsc::channel();
    let monitor = ProcessMonitor::new(
        MonitorConfig {
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            storage: storage.clone(),
        },
        client,
        monitor_tx,
    );

    let oom_guard = if args.no_oom_guard {
        None
    } else {
        Some(OomGuard::start(OomGuardConfig {
            memory_limit_bytes: args.memory_limit_mb * 1024 * 1024,
            ..OomGuardConfig::default()
        }))
    };

    // Plugin loading mechanics live outside the console; an empty host
    // still exercises the dispatch path.
    let plugins = PluginHost::new(Vec::new());

    let (events_tx, events_rx) = mpsc::channel::<ConsoleEvent>();

    let forward_tx = events_tx.clone();
    thread::spawn(move || {
        while let Ok(event) = monitor_rx.recv() {
            if forward_tx.send(ConsoleEvent::Monitor(event)).is_err() {
                break;
            }
        }
    });

    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if matches!(line.trim(), "q" | "quit") {
                let _ = events_tx.send(ConsoleEvent::Quit);
                break;
            }
        }
    });

    if let Err(err) = monitor.start() {
        eprintln!("vigil: failed to start monitoring: {err}");
        return ExitCode::FAILURE;
    }
    println!("vigil: monitoring (type 'q' to quit)");

    loop {
        match events_rx.recv() {
            Ok(ConsoleEvent::Monitor(MonitorEvent::Update(processes))) => {
                plugins.begin_tick();
                println!("── {} process(es)", processes.len());
                for process in &processes {
                    plugins.dispatch_update(process);
                    let effective = process.effective_state();
                    println!(
                        "{:<24} {:<8} {}",
                        process.display_name(),
                        effective.state,
                        effective.description
                    );
                }
            }
            Ok(ConsoleEvent::Monitor(MonitorEvent::Error(err))) => {
                // Fatal policy: report and exit without the clean marker.
                eprintln!("vigil: monitoring failed: {err}");
                monitor.stop();
                if let Some(guard) = &oom_guard {
                    guard.stop();
                }
                return ExitCode::FAILURE;
            }
            Ok(ConsoleEvent::Quit) | Err(_) => {
                monitor.stop();
                if let Some(guard) = &oom_guard {
                    guard.stop();
                }
                if let Err(err) = storage.mark_clean_shutdown() {
                    warn!(error = %err, "Failed to record clean shutdown");
                }
                return ExitCode::SUCCESS;
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = std::env::var("VIGIL_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
