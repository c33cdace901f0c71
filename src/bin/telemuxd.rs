use clap::Parser;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemux::daemon::coordinator::DaemonCoordinator;
use telemux::daemon::snapshot::SnapshotBus;
use telemux::util::config::AppConfig;
use telemux::util::logging::set_run_id;
use telemux::util::run_id::new_run_id;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "telemuxd", version, about = "Telemetry ingest, persist and broadcast daemon")]
struct Cli {
    /// Workspace directory holding config.toml, the database, logs and the PID file.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// HTTP listen address, overriding the configured `http_addr`.
    #[arg(long)]
    http_addr: Option<String>,

    /// Also log to stderr.
    #[arg(long)]
    foreground: bool,
}

fn ensure_workspace_dir(workspace_dir: &Path) {
    if !workspace_dir.exists() {
        std::fs::create_dir_all(workspace_dir).unwrap_or_else(|e| {
            eprintln!("Failed to create workspace directory: {}", e);
            std::process::exit(1);
        });
    }
}

fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn write_pid_file(pid_file: &Path) {
    if pid_file.exists() {
        match std::fs::read_to_string(pid_file) {
            Ok(content) => {
                if let Ok(existing_pid) = content.trim().parse::<u32>() {
                    if existing_pid != std::process::id() && is_process_running(existing_pid) {
                        eprintln!("telemuxd is already running (PID: {})", existing_pid);
                        std::process::exit(1);
                    }
                    info!("Removing stale PID file (process {} is gone)", existing_pid);
                }
                let _ = std::fs::remove_file(pid_file);
            }
            Err(_) => {
                info!("Removing unreadable PID file");
                let _ = std::fs::remove_file(pid_file);
            }
        }
    }

    std::fs::write(pid_file, std::process::id().to_string()).unwrap_or_else(|e| {
        eprintln!("Failed to write PID file: {}", e);
        std::process::exit(1);
    });
}

fn verify_pid_file(pid_file: &Path) {
    let current_pid = std::process::id();
    let file_pid = std::fs::read_to_string(pid_file)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok());
    if file_pid != Some(current_pid) {
        eprintln!(
            "PID file verification failed: expected {}, found {:?}",
            current_pid, file_pid
        );
        std::process::exit(1);
    }
    info!("PID file verified (PID: {})", current_pid);
}

fn cleanup_pid_file(pid_file: &Path) {
    let current_pid = std::process::id();
    match std::fs::read_to_string(pid_file) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(file_pid) if file_pid == current_pid => {
                if let Err(e) = std::fs::remove_file(pid_file) {
                    error!("Failed to remove PID file: {}", e);
                } else {
                    info!("Removed PID file");
                }
            }
            Ok(file_pid) => error!(
                "PID file belongs to process {}, not {}; leaving it",
                file_pid, current_pid
            ),
            Err(e) => error!("PID file contains invalid PID {:?}: {}", content, e),
        },
        Err(e) => error!("PID file disappeared during runtime: {}", e),
    }
}

fn setup_logging(log_dir: &Path, foreground: bool) {
    std::fs::create_dir_all(log_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create log directory: {}", e);
        std::process::exit(1);
    });

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("telemuxd")
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)
        .unwrap_or_else(|e| {
            eprintln!("Failed to create log appender: {}", e);
            std::process::exit(1);
        });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let timer = || fmt::time::ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.6fZ".to_string());

    let stderr_layer = foreground.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(timer())
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_timer(timer()),
        )
        .with(stderr_layer)
        .with(env_filter)
        .init();
}

fn load_app_config(cli: &Cli) -> AppConfig {
    let mut config = AppConfig::load_from(cli.workspace.clone()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {:#}", e);
        std::process::exit(1);
    });
    if let Some(addr) = &cli.http_addr {
        config.http_addr = addr.clone();
    }
    config
}

fn main() {
    let cli = Cli::parse();
    let config = load_app_config(&cli);
    ensure_workspace_dir(&config.workspace_dir);

    setup_logging(&telemux::util::paths::log_dir(&config.workspace_dir), cli.foreground);

    let run_id = new_run_id();
    set_run_id(run_id.clone());

    let pid_file = telemux::util::paths::pid_file(&config.workspace_dir);
    write_pid_file(&pid_file);
    verify_pid_file(&pid_file);

    info!("Starting telemuxd (run {})", run_id);

    let snapshot_bus = Arc::new(SnapshotBus::new());
    snapshot_bus.set_run_id(run_id);

    let coordinator = DaemonCoordinator::from_app_config(&config);
    let store = coordinator.open_store().unwrap_or_else(|e| {
        error!("Failed to open record store: {:#}", e);
        cleanup_pid_file(&pid_file);
        std::process::exit(1);
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to build async runtime: {}", e);
            cleanup_pid_file(&pid_file);
            std::process::exit(1);
        });

    let result = runtime.block_on(coordinator.run(
        Arc::clone(&store),
        Arc::clone(&snapshot_bus),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        },
    ));
    drop(runtime);

    info!("Closing {} store", store.backend_name());
    store.close();
    let live_threads = coordinator.thread_registry().active_count();
    if live_threads > 0 {
        error!("{} background threads still running at exit", live_threads);
    }

    cleanup_pid_file(&pid_file);

    if let Err(e) = result {
        error!("telemuxd error: {:#}", e);
        std::process::exit(1);
    }
}
