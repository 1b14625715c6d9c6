//! In-process launcher.
//!
//! Each worker is a tokio task running [`run_worker`] with channels in place
//! of pipes. A panic or service error maps to exit code 1, and terminate
//! aborts the task and reports the exit as SIGTERM, so the supervisor sees
//! the same lifecycle it would from an OS process.

use super::{EventSender, Launcher, ProcessHandle};
use crate::protocol::{ControlMessage, WorkerReport};
use crate::supervisor::ClusterError;
use crate::types::{ExitStatus, LifecycleEvent, WorkerId};
use crate::worker::{EXIT_FAULT, Service, WorkerLink, run_worker};
use nix::sys::signal::Signal;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

/// Launches workers as tokio tasks in the current process.
pub struct TaskLauncher<S: Service> {
    factory: Arc<dyn Fn(WorkerId) -> S + Send + Sync>,
}

impl<S: Service> TaskLauncher<S> {
    /// The factory builds a fresh service for every fork, including replacements.
    pub fn new(factory: impl Fn(WorkerId) -> S + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl<S: Service> Clone for TaskLauncher<S> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<S: Service> fmt::Debug for TaskLauncher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLauncher").finish_non_exhaustive()
    }
}

impl<S: Service> Launcher for TaskLauncher<S> {
    fn launch(
        &self,
        id: WorkerId,
        events: EventSender,
    ) -> Result<Box<dyn ProcessHandle>, ClusterError> {
        let service = (self.factory)(id);
        let (control_tx, control) = mpsc::unbounded_channel();
        let (reports, report_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(id, service, WorkerLink { control, reports }));
        let abort = worker.abort_handle();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(watch_task(
            id,
            worker,
            report_rx,
            Arc::clone(&connected),
            events,
        ));

        Ok(Box::new(TaskProcess {
            id,
            connected,
            control_tx,
            abort,
        }))
    }
}

struct TaskProcess {
    id: WorkerId,
    connected: Arc<AtomicBool>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    abort: AbortHandle,
}

impl ProcessHandle for TaskProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, message: ControlMessage) -> Result<(), ClusterError> {
        if !self.is_connected() {
            return Err(ClusterError::Disconnected(self.id));
        }
        self.control_tx
            .send(message)
            .map_err(|_| ClusterError::Disconnected(self.id))
    }

    fn terminate(&self) -> Result<(), ClusterError> {
        self.abort.abort();
        Ok(())
    }
}

async fn watch_task(
    id: WorkerId,
    mut worker: JoinHandle<i32>,
    mut report_rx: mpsc::UnboundedReceiver<WorkerReport>,
    connected: Arc<AtomicBool>,
    events: EventSender,
) {
    let outcome = loop {
        tokio::select! {
            biased;
            Some(report) = report_rx.recv() => events.send(id, report.into()),
            outcome = &mut worker => break outcome,
        }
    };

    while let Ok(report) = report_rx.try_recv() {
        events.send(id, report.into());
    }

    connected.store(false, Ordering::SeqCst);
    events.send(id, LifecycleEvent::Disconnected);
    events.send(id, LifecycleEvent::Exited(exit_status(id, outcome)));
}

fn exit_status(id: WorkerId, outcome: Result<i32, JoinError>) -> ExitStatus {
    match outcome {
        Ok(code) => ExitStatus::Code(code),
        Err(err) if err.is_cancelled() => ExitStatus::Signal(Signal::SIGTERM as i32),
        Err(err) => {
            slog::error!(slog_scope::logger(), "worker panicked";
                "worker" => %id,
                "error" => %err
            );
            ExitStatus::Code(EXIT_FAULT)
        }
    }
}
