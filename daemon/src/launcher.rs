use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::config::{LaunchConfig, ProbeConfig};
use crate::resolver::InstallationPath;

/// Number of output lines retained for diagnostics.
pub const OUTPUT_TAIL_LINES: usize = 50;

#[cfg(windows)]
const RUNTIME_BIN: [&str; 2] = ["Scripts", "python.exe"];
#[cfg(not(windows))]
const RUNTIME_BIN: [&str; 2] = ["bin", "python"];

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no Python interpreter found (searched {searched})")]
    InterpreterNotFound { searched: String },
    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("child {0} was not captured")]
    MissingPipe(&'static str),
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Bounded buffer of the most recent output lines, shared with the readers.
#[derive(Debug, Clone, Default)]
pub struct OutputTail(Arc<Mutex<VecDeque<String>>>);

impl OutputTail {
    pub fn push(&self, line: String) {
        let mut lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn last(&self) -> Option<String> {
        let lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lines.back().cloned()
    }

    pub fn lines(&self) -> Vec<String> {
        let lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect()
    }
}

/// The supervisor's exclusive reference to a child process it spawned.
#[derive(Debug)]
pub struct ServiceHandle {
    pid: Option<u32>,
    install_dir: PathBuf,
    terminate_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    ready_rx: watch::Receiver<bool>,
    output: OutputTail,
}

/// The process side of a [`ServiceHandle`], held by whatever owns the child.
#[derive(Debug)]
pub struct HandleControls {
    /// Fires once when the supervisor asks for termination. Closes if the handle is dropped.
    pub terminate_rx: oneshot::Receiver<()>,
    /// Set exactly once, when the process has exited.
    pub exit_tx: watch::Sender<Option<ExitReport>>,
    /// Set to `true` when a readiness line was seen.
    pub ready_tx: watch::Sender<bool>,
    pub output: OutputTail,
}

impl ServiceHandle {
    /// Creates a handle and the controls its process owner drives.
    pub fn pair(pid: Option<u32>, install_dir: impl Into<PathBuf>) -> (Self, HandleControls) {
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = watch::channel(false);
        let output = OutputTail::default();
        (
            Self {
                pid,
                install_dir: install_dir.into(),
                terminate_tx: Some(terminate_tx),
                exit_rx,
                ready_rx,
                output: output.clone(),
            },
            HandleControls {
                terminate_rx,
                exit_tx,
                ready_tx,
                output,
            },
        )
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_report().is_some()
    }

    pub fn last_output_line(&self) -> Option<String> {
        self.output.last()
    }

    pub fn output_lines(&self) -> Vec<String> {
        self.output.lines()
    }

    /// Resolves with the exit report once the process has exited.
    ///
    /// Never resolves if the process owner disappears without reporting.
    pub fn wait_exit(&self) -> impl std::future::Future<Output = ExitReport> + Send + 'static {
        let mut rx = self.exit_rx.clone();
        async move {
            let report = match rx.wait_for(Option::is_some).await {
                Ok(report) => *report,
                Err(_) => None,
            };
            match report {
                Some(report) => report,
                None => std::future::pending().await,
            }
        }
    }

    /// Resolves once a readiness line was seen; never resolves otherwise.
    pub fn wait_ready(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.ready_rx.clone();
        async move {
            if rx.wait_for(|ready| *ready).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Asks the process owner to terminate the child and waits up to `wait`
    /// for the exit report.
    pub async fn terminate(mut self, wait: Duration) -> Option<ExitReport> {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(wait, self.wait_exit()).await.ok()
    }
}

/// Starts the companion service from a resolved installation.
///
/// Spawn success does not imply the service is ready. Implementations never retry.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, install: &InstallationPath) -> Result<ServiceHandle, LaunchError>;

    /// Time to allow a terminated child to exit before giving up on it.
    fn stop_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Runs `<interpreter> <entry point>` inside the installation directory.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: LaunchConfig,
    host: String,
    port: u16,
}

impl ProcessLauncher {
    pub fn new(config: LaunchConfig, probe: &ProbeConfig) -> Self {
        Self {
            config,
            host: probe.host.clone(),
            port: probe.port,
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, install: &InstallationPath) -> Result<ServiceHandle, LaunchError> {
        let interpreter = find_interpreter(install.dir(), &self.config)?;

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&self.config.entry_point)
            .current_dir(install.dir())
            .env("PYTHONUNBUFFERED", "1")
            .env("FLASK_HOST", &self.host)
            .env("FLASK_PORT", self.port.to_string())
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so termination reaches anything the service forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: interpreter.clone(),
            source,
        })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            (out, _) => {
                let _ = child.start_kill();
                let missing = if out.is_none() { "stdout" } else { "stderr" };
                return Err(LaunchError::MissingPipe(missing));
            }
        };

        let pid = child.id();
        let (handle, controls) = ServiceHandle::pair(pid, install.dir());
        let ready_tx = Arc::new(controls.ready_tx);
        let patterns: Arc<[String]> = self.config.ready_patterns.clone().into();

        tokio::spawn(read_output(
            stdout,
            "stdout",
            Arc::clone(&patterns),
            Arc::clone(&ready_tx),
            controls.output.clone(),
        ));
        tokio::spawn(read_output(
            stderr,
            "stderr",
            patterns,
            ready_tx,
            controls.output.clone(),
        ));
        tokio::spawn(reap(
            child,
            controls.terminate_rx,
            controls.exit_tx,
            self.config.stop_grace(),
        ));

        tracing::info!(
            "Launched {} {} in {} (pid {})",
            interpreter.display(),
            self.config.entry_point,
            install.dir().display(),
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );
        Ok(handle)
    }

    fn stop_timeout(&self) -> Duration {
        self.config.stop_grace() + Duration::from_secs(2)
    }
}

/// Picks the interpreter: explicit override, then a per-project runtime under
/// the installation, then the first system interpreter found on `PATH`.
pub fn find_interpreter(install_dir: &Path, config: &LaunchConfig) -> Result<PathBuf, LaunchError> {
    if let Some(explicit) = &config.interpreter {
        return Ok(explicit.clone());
    }

    for runtime in &config.runtime_dirs {
        let candidate = install_dir
            .join(runtime)
            .join(RUNTIME_BIN[0])
            .join(RUNTIME_BIN[1]);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    for name in &config.system_interpreters {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    let searched = config
        .runtime_dirs
        .iter()
        .map(|dir| format!("{dir}/"))
        .chain(config.system_interpreters.iter().cloned())
        .collect::<Vec<_>>()
        .join(", ");
    Err(LaunchError::InterpreterNotFound { searched })
}

async fn read_output<R>(
    stream: R,
    name: &'static str,
    ready_patterns: Arc<[String]>,
    ready_tx: Arc<watch::Sender<bool>>,
    tail: OutputTail,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "companion", stream = name, "{line}");
                if !*ready_tx.borrow() && ready_patterns.iter().any(|p| line.contains(p.as_str()))
                {
                    tracing::debug!("Readiness line seen on {name}");
                    let _ = ready_tx.send(true);
                }
                tail.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading companion {name}: {e}");
                break;
            }
        }
    }
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    TerminateRequested,
    HandleDropped,
}

/// Owns the child until it exits; terminates it on request.
async fn reap(
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitReport>>,
    grace: Duration,
) {
    let mut detached = false;
    let status = loop {
        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            request = &mut terminate_rx, if !detached => match request {
                Ok(()) => Wake::TerminateRequested,
                Err(_) => Wake::HandleDropped,
            },
        };
        match wake {
            Wake::Exited(status) => break status,
            Wake::TerminateRequested => break terminate(&mut child, grace).await,
            Wake::HandleDropped => detached = true,
        }
    };

    let report = match status {
        Ok(status) => ExitReport::from(status),
        Err(e) => {
            tracing::warn!("Failed to collect companion exit status: {e}");
            ExitReport::unknown()
        }
    };
    tracing::info!("Companion service exited ({report})");
    let _ = exit_tx.send(Some(report));
}

async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group(pid, libc::SIGTERM);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => return status,
                Err(_) => {
                    tracing::warn!("Companion ignored SIGTERM for {grace:?}; killing");
                    signal_group(pid, libc::SIGKILL);
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.start_kill() {
        tracing::debug!("Kill after group signal failed: {e}");
    }
    child.wait().await
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    #[allow(unsafe_code)]
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == -1 {
        tracing::debug!(
            "killpg({pgid}, {signal}) failed: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_at(dir: &Path) -> InstallationPath {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("app.py"), "").unwrap();
        crate::resolver::PathResolver::new(vec![dir.to_path_buf()], "app.py")
            .resolve()
            .unwrap()
            .unwrap()
    }

    #[cfg(unix)]
    fn write_runtime(install: &Path, runtime: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = install.join(runtime).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, script).unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        python
    }

    fn isolated_config() -> LaunchConfig {
        LaunchConfig {
            system_interpreters: vec!["horus-no-such-interpreter".to_string()],
            stop_grace_ms: 500,
            ..LaunchConfig::default()
        }
    }

    // ── ExitReport ────────────────────────────────────────────────────────────

    #[test]
    fn exit_report_display() {
        assert_eq!(ExitReport::code(3).to_string(), "exit code 3");
        assert_eq!(ExitReport::signal(15).to_string(), "signal 15");
        assert_eq!(ExitReport::unknown().to_string(), "unknown exit status");
    }

    #[test]
    fn output_tail_is_bounded() {
        let tail = OutputTail::default();
        for i in 0..(OUTPUT_TAIL_LINES + 10) {
            tail.push(format!("line {i}"));
        }
        let lines = tail.lines();
        assert_eq!(lines.len(), OUTPUT_TAIL_LINES);
        assert_eq!(lines[0], "line 10");
        assert_eq!(tail.last().as_deref(), Some("line 59"));
    }

    // ── find_interpreter ──────────────────────────────────────────────────────

    #[test]
    fn explicit_interpreter_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = LaunchConfig {
            interpreter: Some(PathBuf::from("/opt/python/bin/python3")),
            ..isolated_config()
        };
        assert_eq!(
            find_interpreter(dir.path(), &config).unwrap(),
            PathBuf::from("/opt/python/bin/python3")
        );
    }

    #[cfg(unix)]
    #[test]
    fn per_project_runtime_is_preferred_in_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let dot_venv = write_runtime(dir.path(), ".venv", "#!/bin/sh\n");
        assert_eq!(find_interpreter(dir.path(), &isolated_config()).unwrap(), dot_venv);

        let venv = write_runtime(dir.path(), "venv", "#!/bin/sh\n");
        assert_eq!(find_interpreter(dir.path(), &isolated_config()).unwrap(), venv);
    }

    #[test]
    fn missing_interpreter_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_interpreter(dir.path(), &isolated_config()).unwrap_err();
        assert!(matches!(err, LaunchError::InterpreterNotFound { .. }));
        assert!(err.to_string().contains("horus-no-such-interpreter"));
    }

    #[cfg(unix)]
    #[test]
    fn system_interpreter_is_found_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = LaunchConfig {
            runtime_dirs: Vec::new(),
            system_interpreters: vec!["horus-no-such-interpreter".to_string(), "sh".to_string()],
            ..LaunchConfig::default()
        };
        let found = find_interpreter(dir.path(), &config).unwrap();
        assert_eq!(found.file_name().unwrap(), "sh");
    }

    // ── ProcessLauncher ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn launch_with_missing_executable_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let install = install_at(dir.path());
        let config = LaunchConfig {
            interpreter: Some(dir.path().join("no-such-python")),
            ..isolated_config()
        };
        let launcher = ProcessLauncher::new(config, &ProbeConfig::default());
        let err = launcher.launch(&install).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_signals_readiness_and_terminates_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let install = install_at(dir.path());
        write_runtime(
            dir.path(),
            "venv",
            "#!/bin/sh\necho \"entry=$1 port=$FLASK_PORT\"\necho \" * Running on http://$FLASK_HOST:$FLASK_PORT\"\nexec sleep 30\n",
        );

        let probe = ProbeConfig {
            port: 5123,
            ..ProbeConfig::default()
        };
        let launcher = ProcessLauncher::new(isolated_config(), &probe);
        let handle = launcher.launch(&install).await.unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.install_dir(), dir.path());

        tokio::time::timeout(Duration::from_secs(10), handle.wait_ready())
            .await
            .expect("readiness line not seen");
        assert!(handle
            .output_lines()
            .contains(&"entry=app.py port=5123".to_string()));
        assert!(!handle.has_exited());

        let report = handle.terminate(Duration::from_secs(10)).await;
        assert_eq!(report, Some(ExitReport::signal(libc::SIGTERM)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_reported_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let install = install_at(dir.path());
        write_runtime(dir.path(), "venv", "#!/bin/sh\necho bye >&2\nexit 3\n");

        let launcher = ProcessLauncher::new(isolated_config(), &ProbeConfig::default());
        let handle = launcher.launch(&install).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), handle.wait_exit())
            .await
            .unwrap();
        assert_eq!(report, ExitReport::code(3));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn dropped_handle_detaches_without_terminating() {
        let (handle, mut controls) = ServiceHandle::pair(None, "/tmp/backend");
        drop(handle);
        assert!(matches!(
            controls.terminate_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn terminate_gives_up_when_nobody_reports_exit() {
        let (handle, _controls) = ServiceHandle::pair(None, "/tmp/backend");
        assert_eq!(handle.terminate(Duration::from_millis(20)).await, None);
    }
}
