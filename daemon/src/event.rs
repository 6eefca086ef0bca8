use tokio::sync::oneshot;

use crate::config::Config;
use crate::control::Command;
use crate::launcher::ExitReport;

/// Messages processed one at a time by the supervisor task.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A control command from the presentation layer.
    Command(Command),
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Box<Config>),
    /// The post-launch delay for launch `generation` elapsed, or its readiness line was seen.
    StartupElapsed { generation: u64 },
    /// The child process of launch `generation` exited.
    ProcessExited { generation: u64, report: ExitReport },
    /// The shell is quitting; terminate owned processes, then acknowledge.
    Shutdown(oneshot::Sender<()>),
}
