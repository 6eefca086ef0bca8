use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::SupervisorEvent;
use crate::status::StatusEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Check,
    Start,
    Stop,
}

impl Command {
    /// Wire name used by the presentation layer.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Check => "check-backend",
            Command::Start => "start-backend",
            Command::Stop => "stop-backend",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command {0:?} (expected check-backend, start-backend or stop-backend)")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "check-backend" | "check" => Ok(Command::Check),
            "start-backend" | "start" => Ok(Command::Start),
            "stop-backend" | "stop" => Ok(Command::Stop),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

// ── Status fan-out ────────────────────────────────────────────────────────────

/// One producer, many consumers. Each subscriber has its own unbounded queue,
/// so a slow consumer never causes another to miss events.
#[derive(Debug)]
pub struct StatusHub {
    inner: Mutex<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    next_id: u64,
    latest: StatusEvent,
    subscribers: Vec<(u64, mpsc::UnboundedSender<StatusEvent>)>,
}

impl StatusHub {
    pub fn new(initial: StatusEvent) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                next_id: 0,
                latest: initial,
                subscribers: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn latest(&self) -> StatusEvent {
        self.lock().latest.clone()
    }

    pub fn publish(&self, event: StatusEvent) {
        let mut inner = self.lock();
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        inner.latest = event;
    }

    /// Registers a subscriber; the latest event is delivered first.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let _ = tx.send(inner.latest.clone());
        inner.subscribers.push((id, tx));
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn remove(&self, id: u64) {
        self.lock().subscribers.retain(|(sub_id, _)| *sub_id != id);
    }
}

/// A live status subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<StatusEvent>,
    hub: Weak<StatusHub>,
}

impl Subscription {
    /// Next event in transition order; `None` once the supervisor is gone.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

/// Callback registration returned by [`SupervisorHandle::on_status`].
/// Dropping it, or calling [`ListenerGuard::unsubscribe`], stops delivery.
#[derive(Debug)]
pub struct ListenerGuard {
    task: JoinHandle<()>,
}

impl ListenerGuard {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable control surface of a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    inbox: mpsc::UnboundedSender<SupervisorEvent>,
    hub: Arc<StatusHub>,
}

impl SupervisorHandle {
    pub(crate) fn new(inbox: mpsc::UnboundedSender<SupervisorEvent>, hub: Arc<StatusHub>) -> Self {
        Self { inbox, hub }
    }

    /// Queues `command`. Effects are observed only through status events.
    pub fn send(&self, command: Command) {
        if self.inbox.send(SupervisorEvent::Command(command)).is_err() {
            tracing::debug!("Dropped {command}: supervisor has shut down");
        }
    }

    pub fn check(&self) {
        self.send(Command::Check);
    }

    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Calls `listener` for every status event, starting with the latest one.
    pub fn on_status<F>(&self, mut listener: F) -> ListenerGuard
    where
        F: FnMut(&StatusEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                listener(&event);
            }
        });
        ListenerGuard { task }
    }

    /// Hands a freshly parsed config to the supervisor. Returns `false` once it has shut down.
    pub fn reload_config(&self, config: Config) -> bool {
        self.inbox
            .send(SupervisorEvent::ConfigReloaded(Box::new(config)))
            .is_ok()
    }

    /// Terminates an owned companion process and stops the supervisor.
    /// An externally started instance is left running.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inbox.send(SupervisorEvent::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::LifecycleState;

    fn event(state: LifecycleState) -> StatusEvent {
        StatusEvent::new(state, None)
    }

    #[test]
    fn command_wire_names_round_trip() {
        for command in [Command::Check, Command::Start, Command::Stop] {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
        assert_eq!(" start ".parse::<Command>().unwrap(), Command::Start);
        assert!("restart-backend".parse::<Command>().is_err());
    }

    #[test]
    fn subscriber_receives_latest_then_published_events_in_order() {
        let hub = StatusHub::new(event(LifecycleState::Checking));
        let mut sub = hub.subscribe();
        hub.publish(event(LifecycleState::Starting));
        hub.publish(event(LifecycleState::Running));

        let states: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.state())
            .collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Checking,
                LifecycleState::Starting,
                LifecycleState::Running
            ]
        );
    }

    #[test]
    fn every_subscriber_gets_every_event() {
        let hub = StatusHub::new(event(LifecycleState::Checking));
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.publish(event(LifecycleState::Error));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.try_recv().unwrap().state(), LifecycleState::Checking);
            assert_eq!(sub.try_recv().unwrap().state(), LifecycleState::Error);
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn unsubscribe_removes_subscriber() {
        let hub = StatusHub::new(event(LifecycleState::Checking));
        let a = hub.subscribe();
        let _b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        a.unsubscribe();
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn late_subscriber_sees_current_state() {
        let hub = StatusHub::new(event(LifecycleState::Checking));
        hub.publish(event(LifecycleState::Running));
        let mut sub = hub.subscribe();
        assert_eq!(sub.try_recv().unwrap().state(), LifecycleState::Running);
        assert_eq!(hub.latest().state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn on_status_invokes_listener_until_unsubscribed() {
        let (inbox, _rx) = mpsc::unbounded_channel();
        let hub = StatusHub::new(event(LifecycleState::Checking));
        let handle = SupervisorHandle::new(inbox, Arc::clone(&hub));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let guard = {
            let seen = Arc::clone(&seen);
            handle.on_status(move |e| seen.lock().unwrap().push(e.state()))
        };
        hub.publish(event(LifecycleState::Starting));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        guard.unsubscribe();
        tokio::task::yield_now().await;
        hub.publish(event(LifecycleState::Running));
        tokio::task::yield_now().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![LifecycleState::Checking, LifecycleState::Starting]
        );
    }

    #[tokio::test]
    async fn commands_are_queued_in_order() {
        let (inbox, mut rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle::new(inbox, StatusHub::new(event(LifecycleState::Checking)));
        handle.check();
        handle.stop();

        assert!(matches!(
            rx.recv().await,
            Some(SupervisorEvent::Command(Command::Check))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SupervisorEvent::Command(Command::Stop))
        ));
    }

    #[tokio::test]
    async fn commands_after_shutdown_are_dropped_quietly() {
        let (inbox, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = SupervisorHandle::new(inbox, StatusHub::new(event(LifecycleState::Checking)));
        handle.start();
        assert!(handle.is_closed());
        assert!(!handle.reload_config(Config::default()));
        handle.shutdown().await;
    }
}
