pub mod config;
pub mod control;
mod event;
pub mod launcher;
pub mod paths;
pub mod probe;
pub mod resolver;
pub mod status;
pub mod supervisor;

pub use control::{Command, ListenerGuard, Subscription, SupervisorHandle};
pub use status::{ErrorKind, LifecycleState, StatusEvent};
pub use supervisor::Supervisor;
