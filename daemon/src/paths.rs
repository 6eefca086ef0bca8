/// Canonical file paths for the supervisor and the companion-service search list.
///
/// Supervisor files live under `<config_dir>/horus/`:
///   - config.toml  Read by the supervisor, optionally edited by the shell.
///   - status.toml  Written by the supervisor binary, read by out-of-process viewers.
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "horus";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Directory name the companion service is installed under inside each root.
pub const BACKEND_DIR_NAME: &str = "backend";

/// Overrides every other candidate when set to a non-empty value.
pub const BACKEND_DIR_ENV: &str = "HORUS_BACKEND_DIR";

/// Returns the application data directory: `<config_dir>/horus/`.
///
/// Falls back to the working directory when the platform reports no config dir.
pub fn app_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Returns the full path to the config file: `<config_dir>/horus/config.toml`
pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the full path to the status file: `<config_dir>/horus/status.toml`
pub fn status_file_path() -> PathBuf {
    app_data_dir().join(STATUS_FILE_NAME)
}

fn configured_backend_dir() -> Option<PathBuf> {
    std::env::var(BACKEND_DIR_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Directory holding bundled resources of the packaged shell.
///
/// On macOS bundles this is `Contents/Resources`, elsewhere the directory of
/// the running executable.
fn resource_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let exe_dir = exe.parent()?;

    #[cfg(target_os = "macos")]
    {
        if let Some(contents) = exe_dir.parent() {
            let resources = contents.join("Resources");
            if resources.is_dir() {
                return Some(resources);
            }
        }
    }

    Some(exe_dir.to_path_buf())
}

/// Platform candidate directories, in search order:
///
/// 1. `$HORUS_BACKEND_DIR` (if set)
/// 2. `extra` entries from the config file
/// 3. `<downloads>/backend`
/// 4. `<home>/backend`
/// 5. `<resources>/backend`
/// 6. `../backend` relative to the working directory (development checkout)
///
/// Duplicates are removed, keeping the first occurrence.
pub fn candidate_dirs(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(from_env) = configured_backend_dir() {
        candidates.push(from_env);
    }
    candidates.extend(extra.iter().cloned());
    if let Some(downloads) = dirs::download_dir() {
        candidates.push(downloads.join(BACKEND_DIR_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(BACKEND_DIR_NAME));
    }
    if let Some(resources) = resource_dir() {
        candidates.push(resources.join(BACKEND_DIR_NAME));
    }
    candidates.push(Path::new("..").join(BACKEND_DIR_NAME));

    dedup_preserving_order(candidates)
}

fn dedup_preserving_order(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = Vec::with_capacity(paths.len());
    for path in paths {
        if !seen.contains(&path) {
            seen.push(path);
        }
    }
    seen
}
