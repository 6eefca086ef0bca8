use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::control::SupervisorHandle;

pub const DEFAULT_PROBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROBE_PORT: u16 = 5000;
pub const DEFAULT_PROBE_PATH: &str = "/api/health";
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_ENTRY_POINT: &str = "app.py";
pub const DEFAULT_STOP_GRACE_MS: u64 = 3_000;
pub const DEFAULT_STARTUP_DELAY_MS: u64 = 3_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
/// Poll intervals below this are raised to it so probing never saturates the service.
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

/// Root configuration structure. Deserialized from `<config_dir>/horus/config.toml`.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Where and how the liveness probe reaches the companion service.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_host")]
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    /// Request path. Any HTTP answer counts as liveness unless `strict` is set.
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Only treat 2xx answers as reachable; anything else is ambiguous.
    #[serde(default)]
    pub strict: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
            path: default_probe_path(),
            timeout_ms: default_probe_timeout_ms(),
            strict: false,
        }
    }
}

impl ProbeConfig {
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How the companion service is started once an installation is found.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LaunchConfig {
    /// File whose presence identifies an installation; also the script that is run.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Explicit interpreter, bypassing runtime discovery.
    #[serde(default)]
    pub interpreter: Option<PathBuf>,
    /// Per-project runtime directories, relative to the installation, in preference order.
    #[serde(default = "default_runtime_dirs")]
    pub runtime_dirs: Vec<String>,
    /// System-wide interpreters looked up on `PATH`, in preference order.
    #[serde(default = "default_system_interpreters")]
    pub system_interpreters: Vec<String>,
    /// Output line fragments that signal the service finished starting.
    #[serde(default = "default_ready_patterns")]
    pub ready_patterns: Vec<String>,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Extra environment for the child process.
    #[serde(default = "default_launch_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            entry_point: default_entry_point(),
            interpreter: None,
            runtime_dirs: default_runtime_dirs(),
            system_interpreters: default_system_interpreters(),
            ready_patterns: default_ready_patterns(),
            stop_grace_ms: default_stop_grace_ms(),
            env: default_launch_env(),
        }
    }
}

impl LaunchConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Timing of the state machine.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Delay between a successful spawn and the confirming probe.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Period of the liveness re-probe while running.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Returns the poll interval, raised to [`MIN_POLL_INTERVAL_MS`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct PathsConfig {
    /// Searched before the platform candidate directories.
    #[serde(default)]
    pub extra_candidates: Vec<PathBuf>,
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`. Whenever the config
/// file is created or modified, reloads it and hands it to the supervisor.
pub async fn watch_config(path: PathBuf, supervisor: SupervisorHandle) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!("Failed to create config file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            tracing::error!("Config path {} has no parent directory", path.display());
            return;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&watch_dir) {
        tracing::error!("Failed to create config directory {}: {e}", watch_dir.display());
        return;
    }

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::error!("Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if !supervisor.reload_config(config) {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_probe_host() -> String {
    DEFAULT_PROBE_HOST.to_string()
}

fn default_probe_port() -> u16 {
    DEFAULT_PROBE_PORT
}

fn default_probe_path() -> String {
    DEFAULT_PROBE_PATH.to_string()
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

fn default_runtime_dirs() -> Vec<String> {
    vec!["venv".to_string(), ".venv".to_string()]
}

fn default_system_interpreters() -> Vec<String> {
    vec!["python3".to_string(), "python".to_string()]
}

fn default_ready_patterns() -> Vec<String> {
    vec![
        "Running on http".to_string(),
        "Starting HORUS Backend API".to_string(),
    ]
}

fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

fn default_launch_env() -> BTreeMap<String, String> {
    // Flask's debug reloader forks a second interpreter that outlives its parent.
    BTreeMap::from([("FLASK_DEBUG".to_string(), "False".to_string())])
}

fn default_startup_delay_ms() -> u64 {
    DEFAULT_STARTUP_DELAY_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
