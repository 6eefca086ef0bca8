use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::{Config, SupervisorConfig};
use crate::control::{Command, StatusHub, SupervisorHandle};
use crate::event::SupervisorEvent;
use crate::launcher::{ExitReport, Launcher, ProcessLauncher, ServiceHandle};
use crate::paths;
use crate::probe::{HttpProbe, Probe};
use crate::resolver::PathResolver;
use crate::status::{ErrorKind, LifecycleState, StatusEvent};

struct OwnedService {
    generation: u64,
    handle: ServiceHandle,
}

pub struct Supervisor<P: Probe, L: Launcher> {
    probe: P,
    launcher: L,
    resolver: PathResolver,
    timing: SupervisorConfig,

    state: LifecycleState,
    /// The child this supervisor launched, if any. At most one exists.
    owned: Option<OwnedService>,
    generation: u64,

    inbox_tx: mpsc::WeakUnboundedSender<SupervisorEvent>,
    inbox_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    hub: Arc<StatusHub>,
}

impl Supervisor<HttpProbe, ProcessLauncher> {
    /// Builds the production supervisor: HTTP probe, child-process launcher,
    /// platform candidate directories.
    pub fn from_config(config: &Config) -> anyhow::Result<(Self, SupervisorHandle)> {
        let probe = HttpProbe::new(&config.probe)
            .context("Failed to build the HTTP client for the liveness probe")?;
        let launcher = ProcessLauncher::new(config.launch.clone(), &config.probe);
        let resolver = PathResolver::new(
            paths::candidate_dirs(&config.paths.extra_candidates),
            config.launch.entry_point.clone(),
        );
        Ok(Self::new(probe, launcher, resolver, config.supervisor.clone()))
    }
}

impl<P: Probe, L: Launcher> Supervisor<P, L> {
    /// Creates the supervisor in `Checking` and its control handle.
    /// Nothing happens until [`Supervisor::run`] is polled.
    pub fn new(
        probe: P,
        launcher: L,
        resolver: PathResolver,
        timing: SupervisorConfig,
    ) -> (Self, SupervisorHandle) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let hub = StatusHub::new(StatusEvent::new(LifecycleState::Checking, None));
        let handle = SupervisorHandle::new(inbox_tx.clone(), Arc::clone(&hub));

        tracing::debug!(
            "Supervisor initialized with {} candidate directories",
            resolver.candidates().len()
        );

        (
            Self {
                probe,
                launcher,
                resolver,
                timing,
                state: LifecycleState::Checking,
                owned: None,
                generation: 0,
                inbox_tx: inbox_tx.downgrade(),
                inbox_rx,
                hub,
            },
            handle,
        )
    }

    /// Runs the initial check, then processes commands and timers until shutdown
    /// or until every handle is gone.
    pub async fn run(mut self) {
        tracing::info!("Supervisor started");

        self.check().await;

        let mut ticker = poll_ticker(&self.timing);
        loop {
            tokio::select! {
                event = self.inbox_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SupervisorEvent::Shutdown(done) => {
                            self.shutdown().await;
                            let _ = done.send(());
                            break;
                        }
                        SupervisorEvent::ConfigReloaded(config) => {
                            if self.apply_config(*config) {
                                ticker = poll_ticker(&self.timing);
                            }
                        }
                        SupervisorEvent::Command(command) => self.on_command(command).await,
                        SupervisorEvent::StartupElapsed { generation } => {
                            self.on_startup_elapsed(generation).await;
                        }
                        SupervisorEvent::ProcessExited { generation, report } => {
                            self.on_process_exited(generation, report);
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.state == LifecycleState::Running {
                        self.reprobe().await;
                    }
                }
            }
        }

        tracing::info!("Supervisor stopped");
    }

    async fn on_command(&mut self, command: Command) {
        tracing::debug!("Received {command} in state {}", self.state);

        match (command, self.state) {
            (Command::Stop, _) => self.stop().await,
            (_, LifecycleState::Starting) => {
                tracing::debug!("Ignoring {command}: a launch is already in progress");
            }
            (Command::Check, LifecycleState::Running) => self.reprobe().await,
            (Command::Start, LifecycleState::Running) => {
                tracing::debug!("Ignoring {command}: companion service already running");
            }
            (Command::Check | Command::Start, _) => self.check().await,
        }
    }

    /// `Checking`: probe, then either adopt a live service or resolve and launch.
    async fn check(&mut self) {
        self.transition(StatusEvent::new(LifecycleState::Checking, None));

        let outcome = self.probe.probe().await;
        self.release_if_exited();

        if outcome.is_reachable() {
            self.enter_running();
            return;
        }

        // Our earlier launch is still alive but silent; never start a second copy.
        if let Some(owned) = &self.owned {
            let generation = owned.generation;
            let message = format!(
                "Waiting for the companion service{} to respond",
                describe_pid(&owned.handle)
            );
            self.schedule_startup_probe(generation);
            self.transition(StatusEvent::new(LifecycleState::Starting, Some(message)));
            return;
        }

        let install = match self.resolver.resolve() {
            Ok(Some(install)) => install,
            Ok(None) => {
                let searched = self
                    .resolver
                    .candidates()
                    .iter()
                    .map(|dir| dir.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let message = ErrorKind::NotFound.message(format!(
                    "install it so that {} exists in one of: {searched}",
                    self.resolver.entry_point()
                ));
                self.transition(StatusEvent::error(ErrorKind::NotFound, message));
                return;
            }
            Err(e) => {
                let message = ErrorKind::Resolve.message(&e);
                self.transition(StatusEvent::error(ErrorKind::Resolve, message));
                return;
            }
        };

        self.transition(StatusEvent::new(
            LifecycleState::Starting,
            Some(format!("Launching from {}", install.dir().display())),
        ));

        match self.launcher.launch(&install).await {
            Ok(handle) => {
                self.generation += 1;
                let generation = self.generation;
                self.watch_exit(generation, &handle);
                self.owned = Some(OwnedService { generation, handle });
                self.schedule_startup_probe(generation);
            }
            Err(e) => {
                let message = ErrorKind::Spawn.message(&e);
                self.transition(StatusEvent::error(ErrorKind::Spawn, message));
            }
        }
    }

    /// The single post-launch probe.
    async fn on_startup_elapsed(&mut self, generation: u64) {
        let current = self.owned.as_ref().map(|owned| owned.generation);
        if self.state != LifecycleState::Starting || current != Some(generation) {
            tracing::debug!("Ignoring stale startup timer for launch {generation}");
            return;
        }

        let outcome = self.probe.probe().await;
        if outcome.is_reachable() {
            self.enter_running();
            return;
        }

        // The child is left running: it may still be initializing.
        let detail = outcome.detail().unwrap_or("no answer").to_string();
        let message = ErrorKind::Unreachable.message(self.with_last_output(detail));
        self.transition(StatusEvent::error(ErrorKind::Unreachable, message));
    }

    fn on_process_exited(&mut self, generation: u64, report: ExitReport) {
        let is_current = self
            .owned
            .as_ref()
            .is_some_and(|owned| owned.generation == generation);
        if !is_current {
            tracing::debug!("Ignoring exit of released launch {generation} ({report})");
            return;
        }
        let Some(owned) = self.owned.take() else {
            return;
        };

        match self.state {
            LifecycleState::Running | LifecycleState::Starting => {
                let mut detail = report.to_string();
                if let Some(line) = owned.handle.last_output_line() {
                    detail.push_str(&format!("; last output: {line}"));
                }
                let message = ErrorKind::UnexpectedExit.message(detail);
                self.transition(StatusEvent::error(ErrorKind::UnexpectedExit, message));
            }
            state => tracing::info!("Companion service exited ({report}) while {state}"),
        }
    }

    /// Liveness re-check while `Running`. Success is silent.
    async fn reprobe(&mut self) {
        let outcome = self.probe.probe().await;
        if outcome.is_reachable() {
            return;
        }

        let detail = format!(
            "stopped responding ({})",
            outcome.detail().unwrap_or("no answer")
        );
        let message = ErrorKind::UnexpectedExit.message(self.with_last_output(detail));
        self.transition(StatusEvent::error(ErrorKind::UnexpectedExit, message));
    }

    async fn stop(&mut self) {
        if let Some(owned) = self.owned.take() {
            let pid = describe_pid(&owned.handle);
            match owned.handle.terminate(self.launcher.stop_timeout()).await {
                Some(report) => tracing::info!("Companion service{pid} stopped ({report})"),
                None => tracing::warn!("Companion service{pid} did not confirm exit"),
            }
            self.transition(StatusEvent::new(
                LifecycleState::Stopped,
                Some("Companion service stopped".to_string()),
            ));
            return;
        }

        if self.state == LifecycleState::Running {
            // Not ours to terminate.
            self.transition(StatusEvent::new(
                LifecycleState::Stopped,
                Some("Stopped monitoring the external companion service; it was left running".to_string()),
            ));
            return;
        }

        tracing::debug!("Nothing to stop in state {}", self.state);
    }

    async fn shutdown(&mut self) {
        if self.owned.is_some() {
            self.stop().await;
        } else {
            tracing::debug!("No owned companion process to stop on shutdown");
        }
    }

    fn enter_running(&mut self) {
        let message = match &self.owned {
            Some(owned) => format!(
                "Companion service running{}",
                describe_pid(&owned.handle)
            ),
            None => "Connected to an already running companion service".to_string(),
        };
        self.transition(StatusEvent::new(LifecycleState::Running, Some(message)));
    }

    /// Drops the handle if its process already exited.
    fn release_if_exited(&mut self) {
        if self
            .owned
            .as_ref()
            .is_some_and(|owned| owned.handle.has_exited())
        {
            self.owned = None;
        }
    }

    fn with_last_output(&self, detail: String) -> String {
        match self
            .owned
            .as_ref()
            .and_then(|owned| owned.handle.last_output_line())
        {
            Some(line) => format!("{detail}; last output: {line}"),
            None => detail,
        }
    }

    fn schedule_startup_probe(&self, generation: u64) {
        let tx = self.inbox_tx.clone();
        let delay = self.timing.startup_delay();
        let ready = self.owned.as_ref().map(|owned| owned.handle.wait_ready());

        tokio::spawn(async move {
            match ready {
                Some(ready) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ready => tracing::debug!("Readiness line seen; probing early"),
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SupervisorEvent::StartupElapsed { generation });
            }
        });
    }

    /// Holds only a weak sender, so a live child never keeps the actor running.
    fn watch_exit(&self, generation: u64, handle: &ServiceHandle) {
        let tx = self.inbox_tx.clone();
        let exited = handle.wait_exit();
        tokio::spawn(async move {
            let report = exited.await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SupervisorEvent::ProcessExited { generation, report });
            }
        });
    }

    /// Returns `true` if the poll interval changed.
    fn apply_config(&mut self, config: Config) -> bool {
        tracing::info!("Config reloaded");
        self.resolver = PathResolver::new(
            paths::candidate_dirs(&config.paths.extra_candidates),
            config.launch.entry_point,
        );
        let poll_changed = self.timing.poll_interval() != config.supervisor.poll_interval();
        self.timing = config.supervisor;
        poll_changed
    }

    /// Publishes `event` unless it repeats the current state and message.
    fn transition(&mut self, event: StatusEvent) {
        if self.hub.latest().same_transition(&event) {
            tracing::trace!("Suppressed repeated {} event", event.state());
            return;
        }

        let message = event.message().unwrap_or_default();
        if event.kind().is_some() {
            tracing::error!("{} -> {}: {message}", self.state, event.state());
        } else {
            tracing::info!("{} -> {}: {message}", self.state, event.state());
        }

        self.state = event.state();
        self.hub.publish(event);
    }
}

fn poll_ticker(timing: &SupervisorConfig) -> Interval {
    let period = timing.poll_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn describe_pid(handle: &ServiceHandle) -> String {
    handle
        .pid()
        .map(|pid| format!(" (pid {pid})"))
        .unwrap_or_default()
}
