//! Launchers create worker processes for the supervisor.
//!
//! A [`Launcher`] turns a freshly assigned [`WorkerId`] into a running worker
//! and hands back a [`ProcessHandle`] the supervisor keeps exclusive ownership
//! of. Everything the worker does afterwards reaches the supervisor as
//! [`LifecycleEvent`]s through the [`EventSender`].
//!
//! - [`ProcessLauncher`] re-executes the current binary as an OS process.
//! - [`TaskLauncher`] runs a [`Service`](crate::Service) in-process as a tokio
//!   task behind the same worker runtime.

mod process;
mod task;

pub use process::ProcessLauncher;
pub(crate) use process::stdio_link;
pub use task::TaskLauncher;

use crate::protocol::ControlMessage;
use crate::supervisor::ClusterError;
use crate::types::{LifecycleEvent, WorkerEvent, WorkerId};
use tokio::sync::mpsc;

/// Creates worker processes.
pub trait Launcher: Send + Sync + 'static {
    /// Starts worker `id`. Lifecycle notifications for it must be sent
    /// through `events`, in order, ending with [`LifecycleEvent::Exited`].
    fn launch(&self, id: WorkerId, events: EventSender)
    -> Result<Box<dyn ProcessHandle>, ClusterError>;
}

/// Supervisor-side handle to one worker process.
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if the worker is a real process.
    fn pid(&self) -> Option<u32>;

    /// Whether the control channel to the worker is still open.
    fn is_connected(&self) -> bool;

    /// Sends an in-band control message. Never waits for a reply.
    fn send(&self, message: ControlMessage) -> Result<(), ClusterError>;

    /// Forcefully terminates the worker (SIGTERM).
    fn terminate(&self) -> Result<(), ClusterError>;
}

/// Internal events consumed by the supervisor runtime.
pub(crate) enum RuntimeEvent {
    Worker(WorkerEvent),
    Replace { retired: WorkerId },
    ShutdownDeadline,
}

/// Channel a launcher uses to report worker lifecycle events.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RuntimeEvent>) -> Self {
        Self { tx }
    }

    /// Reports `kind` for worker `id`. Dropped silently once the supervisor
    /// has stopped.
    pub fn send(&self, id: WorkerId, kind: LifecycleEvent) {
        let _ = self.tx.send(RuntimeEvent::Worker(WorkerEvent { id, kind }));
    }

    pub(crate) fn send_internal(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }
}
