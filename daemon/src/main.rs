use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use horus_backend_supervisor::config;
use horus_backend_supervisor::paths;
use horus_backend_supervisor::status;
use horus_backend_supervisor::{Command, Supervisor, SupervisorHandle};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries status events only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir();
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        tracing::error!("Failed to create app data directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        tracing::error!("Config error (using defaults): {e:#}");
        config::Config::default()
    });

    // ── Supervisor ────────────────────────────────────────────────────────────
    let (supervisor, handle) = match Supervisor::from_config(&initial_config) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
    };

    let status_path = paths::status_file_path();
    let _status_listener = handle.on_status(move |event| {
        status::write_status(&status_path, event);
        match event.to_json() {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("Failed to serialize status event: {e}"),
        }
    });

    let running = tokio::spawn(supervisor.run());
    tokio::spawn(config::watch_config(config_path, handle.clone()));
    tokio::spawn(read_commands(handle.clone()));

    tracing::info!("horus-backend-supervisor v{} started", env!("CARGO_PKG_VERSION"));

    // ── Shutdown ──────────────────────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {e}");
    }
    tracing::info!("Shutting down");
    handle.shutdown().await;
    let _ = running.await;
}

/// Forwards each stdin line to the supervisor as a [`Command`].
async fn read_commands(handle: SupervisorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match line.parse::<Command>() {
                Ok(command) => handle.send(command),
                Err(e) => tracing::warn!("{e}"),
            },
            Ok(None) => {
                tracing::debug!("stdin closed; commands are no longer accepted");
                break;
            }
            Err(e) => {
                tracing::warn!("Failed to read stdin: {e}");
                break;
            }
        }
    }
}
