#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tidepool::protocol::ControlMessage;
use tidepool::{
    ClusterConfig, ClusterError, EventSender, Launcher, ProcessHandle, Service, SupervisorHandle,
    TaskLauncher, WorkerContext, WorkerCounts, WorkerId, WorkerInfo,
};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// How a fake worker behaves once it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Drains immediately on shutdown
    Steady,
    /// Takes its time to drain
    SlowDrain(Duration),
    /// Never returns after shutdown
    Stubborn,
    /// Panics instead of failing with an error when crashed
    Panicky,
}

/// Crash switch shared by the test and every worker it launches.
#[derive(Clone)]
pub struct Faults {
    crashed: Arc<watch::Sender<HashSet<WorkerId>>>,
    launched: Arc<AtomicUsize>,
}

impl Faults {
    pub fn new() -> Self {
        let (crashed, _) = watch::channel(HashSet::new());
        Self {
            crashed: Arc::new(crashed),
            launched: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes worker `id` fail as if it hit an unrecoverable fault.
    pub fn crash(&self, id: WorkerId) {
        self.crashed.send_modify(|ids| {
            ids.insert(id);
        });
    }

    /// Number of services the launcher has built so far.
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn launcher(&self, behavior: Behavior) -> TaskLauncher<FakeService> {
        let faults = self.clone();
        TaskLauncher::new(move |_| {
            faults.launched.fetch_add(1, Ordering::SeqCst);
            FakeService {
                crashed: faults.crashed.subscribe(),
                behavior,
            }
        })
    }
}

/// Reports a listening address, then waits for shutdown or an injected crash.
pub struct FakeService {
    crashed: watch::Receiver<HashSet<WorkerId>>,
    behavior: Behavior,
}

#[async_trait]
impl Service for FakeService {
    type Error = io::Error;

    async fn serve(&mut self, ctx: WorkerContext) -> Result<(), Self::Error> {
        let id = ctx.id();
        let address: SocketAddr = ([127, 0, 0, 1], 20_000 + id.get() as u16).into();
        ctx.listening(address);

        let mut crashed = self.crashed.clone();
        let crash = async move {
            if crashed.wait_for(|ids| ids.contains(&id)).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = crash => {
                if self.behavior == Behavior::Panicky {
                    panic!("worker {} hit an injected fault", id);
                }
                Err(io::Error::other("injected fault"))
            }
            _ = ctx.shutdown_requested() => match self.behavior {
                Behavior::SlowDrain(delay) => {
                    sleep(delay).await;
                    Ok(())
                }
                Behavior::Stubborn => std::future::pending().await,
                Behavior::Steady | Behavior::Panicky => Ok(()),
            },
        }
    }
}

/// Launcher whose first `failures` launches fail.
pub struct FlakyLauncher<L> {
    inner: L,
    failures: AtomicUsize,
}

impl<L: Launcher> FlakyLauncher<L> {
    pub fn new(inner: L, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

impl<L: Launcher> Launcher for FlakyLauncher<L> {
    fn launch(
        &self,
        id: WorkerId,
        events: EventSender,
    ) -> Result<Box<dyn ProcessHandle>, ClusterError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClusterError::ForkFailed {
                id,
                source: io::Error::other("out of process slots"),
            });
        }
        self.inner.launch(id, events)
    }
}

/// Launcher whose workers fail with an error when told to terminate,
/// so a termination looks like a crash from the outside.
pub struct FaultOnTerminate<L> {
    inner: L,
    faults: Faults,
}

impl<L: Launcher> FaultOnTerminate<L> {
    pub fn new(inner: L, faults: Faults) -> Self {
        Self { inner, faults }
    }
}

impl<L: Launcher> Launcher for FaultOnTerminate<L> {
    fn launch(
        &self,
        id: WorkerId,
        events: EventSender,
    ) -> Result<Box<dyn ProcessHandle>, ClusterError> {
        let inner = self.inner.launch(id, events)?;
        Ok(Box::new(FaultingHandle {
            id,
            inner,
            faults: self.faults.clone(),
        }))
    }
}

struct FaultingHandle {
    id: WorkerId,
    inner: Box<dyn ProcessHandle>,
    faults: Faults,
}

impl ProcessHandle for FaultingHandle {
    fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn send(&self, message: ControlMessage) -> Result<(), ClusterError> {
        self.inner.send(message)
    }

    fn terminate(&self) -> Result<(), ClusterError> {
        self.faults.crash(self.id);
        Ok(())
    }
}

/// Short timings so healing and replacement happen within a test.
pub fn fast_config(workers: usize) -> ClusterConfig {
    ClusterConfig::default()
        .with_workers(workers)
        .with_health_check_interval(Duration::from_millis(100))
        .with_replacement_delay(Duration::from_millis(20))
}

/// Polls the registry until `ready` holds and returns that snapshot.
pub async fn wait_for_workers<F>(handle: &SupervisorHandle, ready: F) -> Vec<WorkerInfo>
where
    F: Fn(&[WorkerInfo]) -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let workers = handle.which_workers().await.unwrap();
        if ready(&workers) {
            return workers;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for workers, last saw {:?}",
            workers
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Waits for exactly `count` workers, all listening.
pub async fn wait_for_listening(handle: &SupervisorHandle, count: usize) -> Vec<WorkerInfo> {
    wait_for_workers(handle, |workers| {
        workers.len() == count && workers.iter().all(|w| w.address.is_some() && w.connected)
    })
    .await
}

/// Polls the counts until `ready` holds and returns them.
pub async fn wait_for_counts<F>(handle: &SupervisorHandle, ready: F) -> WorkerCounts
where
    F: Fn(&WorkerCounts) -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let counts = handle.worker_counts().await.unwrap();
        if ready(&counts) {
            return counts;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for counts, last saw {:?}",
            counts
        );
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn ids(workers: &[WorkerInfo]) -> Vec<WorkerId> {
    workers.iter().map(|w| w.id).collect()
}
