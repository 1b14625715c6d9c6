//! Supervisor runtime - owns the worker registry and all of its mutations

use super::error::ClusterError;
use super::record::WorkerRecord;
use crate::config::ClusterConfig;
use crate::launcher::{EventSender, Launcher, RuntimeEvent};
use crate::protocol::ControlMessage;
use crate::stats::WorkerCounts;
use crate::types::{
    ExitStatus, LifecycleEvent, ScaleOutcome, WorkerEvent, WorkerId, WorkerInfo, WorkerState,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Internal commands sent to supervisor runtime
pub(crate) enum SupervisorCommand {
    Fork {
        respond_to: oneshot::Sender<Result<WorkerInfo, ClusterError>>,
    },
    Scale {
        target: usize,
        respond_to: oneshot::Sender<Result<ScaleOutcome, ClusterError>>,
    },
    RestartAll {
        respond_to: oneshot::Sender<Result<Vec<WorkerId>, ClusterError>>,
    },
    WhichWorkers {
        respond_to: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Counts {
        respond_to: oneshot::Sender<WorkerCounts>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Single owner of the supervisor state. Every handler runs on the one task
/// driving [`SupervisorRuntime::run`], so the registry has no concurrent
/// writers.
pub(crate) struct SupervisorRuntime {
    config: ClusterConfig,
    launcher: Arc<dyn Launcher>,
    target: usize,
    next_id: u64,
    /// Forked workers that have not disconnected yet
    registry: BTreeMap<WorkerId, WorkerRecord>,
    /// Disconnected workers waiting to be reaped
    departed: BTreeMap<WorkerId, WorkerRecord>,
    /// Workers the supervisor terminated on purpose; their exit is not a crash
    expected_exits: HashSet<WorkerId>,
    /// Crash replacements scheduled but not yet forked
    pending_replacements: usize,
    shutting_down: bool,
    /// Workers sent `shutdown` that have not disconnected yet
    draining: HashSet<WorkerId>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    control_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    event_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    events: EventSender,
    observers: broadcast::Sender<WorkerEvent>,
}

impl SupervisorRuntime {
    pub(crate) fn new(
        config: ClusterConfig,
        launcher: Arc<dyn Launcher>,
        control_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
        observers: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            target: config.target_workers(),
            config,
            launcher,
            next_id: 1,
            registry: BTreeMap::new(),
            departed: BTreeMap::new(),
            expected_exits: HashSet::new(),
            pending_replacements: 0,
            shutting_down: false,
            draining: HashSet::new(),
            shutdown_waiters: Vec::new(),
            control_rx,
            event_rx,
            events: EventSender::new(event_tx),
            observers,
        }
    }

    pub(crate) async fn run(mut self) {
        slog::info!(slog_scope::logger(), "supervisor starting";
            "workers" => self.target,
            "health_check_interval" => ?self.config.health_check_interval
        );

        for _ in 0..self.target {
            if let Err(err) = self.fork() {
                slog::error!(slog_scope::logger(), "initial fork failed, health check will retry";
                    "error" => %err
                );
                break;
            }
        }

        let period = self.config.health_check_interval;
        let mut health = time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut control_open = true;

        loop {
            tokio::select! {
                command = self.control_rx.recv(), if control_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        slog::debug!(slog_scope::logger(), "all supervisor handles dropped");
                        control_open = false;
                        self.begin_shutdown();
                    }
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
                _ = health.tick() => self.health_check(),
            }

            if self.finish_if_drained() {
                break;
            }
        }

        slog::info!(slog_scope::logger(), "supervisor stopped");
    }

    fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Fork { respond_to } => {
                let result = self.handle_fork();
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Scale { target, respond_to } => {
                let result = self.handle_scale(target);
                let _ = respond_to.send(result);
            }
            SupervisorCommand::RestartAll { respond_to } => {
                let result = self.handle_restart_all();
                let _ = respond_to.send(result);
            }
            SupervisorCommand::WhichWorkers { respond_to } => {
                let workers = self.registry.values().map(WorkerRecord::info).collect();
                let _ = respond_to.send(workers);
            }
            SupervisorCommand::Counts { respond_to } => {
                let _ = respond_to.send(self.counts());
            }
            SupervisorCommand::Shutdown { respond_to } => {
                self.shutdown_waiters.push(respond_to);
                self.begin_shutdown();
            }
        }
    }

    fn handle_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Worker(event) => self.handle_worker_event(event),
            RuntimeEvent::Replace { retired } => self.handle_replace(retired),
            RuntimeEvent::ShutdownDeadline => self.handle_shutdown_deadline(),
        }
    }

    /// Creates one worker and registers it. The only place entries are added.
    fn fork(&mut self) -> Result<WorkerId, ClusterError> {
        let id = WorkerId::new(self.next_id);
        self.next_id += 1;

        let process = self.launcher.launch(id, self.events.clone())?;
        let record = WorkerRecord::new(id, process);
        slog::debug!(slog_scope::logger(), "forked worker";
            "worker" => %id,
            "worker_pid" => ?record.pid()
        );
        self.registry.insert(id, record);

        let _ = self.observers.send(WorkerEvent {
            id,
            kind: LifecycleEvent::Forked,
        });
        Ok(id)
    }

    fn handle_fork(&mut self) -> Result<WorkerInfo, ClusterError> {
        if self.shutting_down {
            return Err(ClusterError::ShuttingDown);
        }
        let id = self.fork()?;
        self.registry
            .get(&id)
            .map(WorkerRecord::info)
            .ok_or(ClusterError::Disconnected(id))
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let id = event.id;
        match &event.kind {
            // Fork notifications come from `fork` itself.
            LifecycleEvent::Forked => return,
            LifecycleEvent::Online => self.handle_online(id),
            LifecycleEvent::Listening { address } => self.handle_listening(id, address),
            LifecycleEvent::Health {
                pid,
                uptime_secs,
                max_rss_kib,
            } => {
                slog::debug!(slog_scope::logger(), "worker health";
                    "worker" => %id,
                    "worker_pid" => pid,
                    "uptime_secs" => uptime_secs,
                    "max_rss_kib" => max_rss_kib
                );
            }
            LifecycleEvent::Disconnected => self.handle_disconnect(id),
            LifecycleEvent::Exited(status) => self.handle_exit(id, *status),
        }

        let _ = self.observers.send(event);
    }

    fn handle_online(&mut self, id: WorkerId) {
        match self.registry.get_mut(&id) {
            Some(record) => {
                if record.advance(WorkerState::Online) {
                    slog::info!(slog_scope::logger(), "worker online";
                        "worker" => %id,
                        "worker_pid" => ?record.pid()
                    );
                }
            }
            None => {
                slog::debug!(slog_scope::logger(), "online from unregistered worker"; "worker" => %id);
            }
        }
    }

    fn handle_listening(&mut self, id: WorkerId, address: &str) {
        if let Some(record) = self.registry.get_mut(&id) {
            if record.advance(WorkerState::Listening) {
                record.set_address(address.to_string());
                slog::info!(slog_scope::logger(), "worker listening";
                    "worker" => %id,
                    "address" => address
                );
            }
        }
    }

    fn handle_disconnect(&mut self, id: WorkerId) {
        if let Some(mut record) = self.registry.remove(&id) {
            record.advance(WorkerState::Disconnecting);
            slog::debug!(slog_scope::logger(), "worker disconnected"; "worker" => %id);
            self.departed.insert(id, record);
        }
        self.draining.remove(&id);
    }

    fn handle_exit(&mut self, id: WorkerId, status: ExitStatus) {
        let record = self
            .registry
            .remove(&id)
            .or_else(|| self.departed.remove(&id));

        let Some(mut record) = record else {
            slog::warn!(slog_scope::logger(), "exit from unknown worker";
                "worker" => %id,
                "status" => %status
            );
            return;
        };
        record.advance(WorkerState::Exited);
        self.draining.remove(&id);

        let expected = self.expected_exits.remove(&id);

        if self.shutting_down {
            slog::info!(slog_scope::logger(), "worker exited during shutdown";
                "worker" => %id,
                "status" => %status
            );
            return;
        }

        if expected {
            slog::info!(slog_scope::logger(), "worker retired";
                "worker" => %id,
                "status" => %status
            );
            return;
        }

        slog::warn!(slog_scope::logger(), "worker died, scheduling replacement";
            "worker" => %id,
            "status" => %status,
            "delay" => ?self.config.replacement_delay
        );

        self.pending_replacements += 1;
        let events = self.events.clone();
        let delay = self.config.replacement_delay;
        tokio::spawn(async move {
            time::sleep(delay).await;
            events.send_internal(RuntimeEvent::Replace { retired: id });
        });
    }

    fn handle_replace(&mut self, retired: WorkerId) {
        self.pending_replacements = self.pending_replacements.saturating_sub(1);

        if self.shutting_down {
            return;
        }

        let live = self.live_count();
        if live >= self.target {
            slog::debug!(slog_scope::logger(), "pool already at target, skipping replacement";
                "retired" => %retired,
                "live" => live,
                "target" => self.target
            );
            return;
        }

        match self.fork() {
            Ok(id) => {
                slog::info!(slog_scope::logger(), "replaced worker";
                    "retired" => %retired,
                    "replacement" => %id
                );
            }
            Err(err) => {
                slog::error!(slog_scope::logger(), "replacement fork failed, health check will retry";
                    "retired" => %retired,
                    "error" => %err
                );
            }
        }
    }

    fn health_check(&mut self) {
        if self.shutting_down {
            return;
        }

        let live = self.live_count();
        let shortfall = self
            .target
            .saturating_sub(live + self.pending_replacements);

        if shortfall > 0 {
            slog::warn!(slog_scope::logger(), "pool below target, forking";
                "live" => live,
                "target" => self.target,
                "shortfall" => shortfall
            );
            for _ in 0..shortfall {
                if let Err(err) = self.fork() {
                    slog::error!(slog_scope::logger(), "auto-heal fork failed"; "error" => %err);
                    break;
                }
            }
        }

        let mut reached = 0usize;
        for (id, record) in self.registry.iter().filter(|(_, r)| r.is_connected()) {
            match record.send(ControlMessage::HealthCheck) {
                Ok(()) => reached += 1,
                Err(err) => {
                    slog::debug!(slog_scope::logger(), "health check not delivered";
                        "worker" => %id,
                        "error" => %err
                    );
                }
            }
        }

        slog::debug!(slog_scope::logger(), "health check sent"; "workers" => reached);
    }

    fn handle_scale(&mut self, target: usize) -> Result<ScaleOutcome, ClusterError> {
        if self.shutting_down {
            return Err(ClusterError::ShuttingDown);
        }
        if target == 0 {
            return Err(ClusterError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }

        let previous = self.target;
        self.target = target;
        let live = self.live_count();
        let mut outcome = ScaleOutcome::default();

        if target > live {
            for _ in 0..(target - live) {
                outcome.forked.push(self.fork()?);
            }
        } else if target < live {
            let victims: Vec<WorkerId> = self
                .registry
                .iter()
                .filter(|(id, record)| record.is_connected() && !self.expected_exits.contains(*id))
                .map(|(id, _)| *id)
                .take(live - target)
                .collect();

            for id in victims {
                let Some(record) = self.registry.get_mut(&id) else {
                    continue;
                };
                // Mark before signalling so the exit can never look like a crash.
                self.expected_exits.insert(id);
                match record.terminate() {
                    Ok(()) => {
                        record.advance(WorkerState::Disconnecting);
                        outcome.terminated.push(id);
                    }
                    Err(err) => {
                        self.expected_exits.remove(&id);
                        slog::warn!(slog_scope::logger(), "failed to terminate worker";
                            "worker" => %id,
                            "error" => %err
                        );
                    }
                }
            }
        }

        slog::info!(slog_scope::logger(), "scaled worker pool";
            "from" => previous,
            "to" => target,
            "forked" => outcome.forked.len(),
            "terminated" => outcome.terminated.len()
        );
        Ok(outcome)
    }

    fn handle_restart_all(&mut self) -> Result<Vec<WorkerId>, ClusterError> {
        if self.shutting_down {
            return Err(ClusterError::ShuttingDown);
        }

        let mut restarted = Vec::new();
        for (id, record) in self.registry.iter_mut() {
            if !record.is_connected() || self.expected_exits.contains(id) {
                continue;
            }
            // Not marked as expected: each exit takes the crash replacement path.
            match record.terminate() {
                Ok(()) => {
                    record.advance(WorkerState::Disconnecting);
                    restarted.push(*id);
                }
                Err(err) => {
                    slog::warn!(slog_scope::logger(), "failed to terminate worker";
                        "worker" => %id,
                        "error" => %err
                    );
                }
            }
        }

        slog::info!(slog_scope::logger(), "restarting all workers"; "workers" => restarted.len());
        Ok(restarted)
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            slog::debug!(slog_scope::logger(), "shutdown already in progress");
            return;
        }
        self.shutting_down = true;

        for (id, record) in self.registry.iter_mut() {
            if !record.is_connected() {
                continue;
            }
            match record.send(ControlMessage::Shutdown) {
                Ok(()) => {
                    record.advance(WorkerState::Disconnecting);
                    self.draining.insert(*id);
                }
                Err(err) => {
                    slog::debug!(slog_scope::logger(), "shutdown not delivered";
                        "worker" => %id,
                        "error" => %err
                    );
                }
            }
        }

        slog::info!(slog_scope::logger(), "graceful shutdown started";
            "workers" => self.draining.len()
        );

        if let Some(timeout) = self.config.shutdown_timeout {
            let events = self.events.clone();
            tokio::spawn(async move {
                time::sleep(timeout).await;
                events.send_internal(RuntimeEvent::ShutdownDeadline);
            });
        }
    }

    fn handle_shutdown_deadline(&mut self) {
        if self.draining.is_empty() {
            return;
        }

        slog::warn!(slog_scope::logger(), "shutdown timed out, terminating stragglers";
            "workers" => self.draining.len()
        );

        let stragglers: Vec<WorkerId> = self.draining.drain().collect();
        for id in stragglers {
            let record = self.registry.get(&id).or_else(|| self.departed.get(&id));
            if let Some(record) = record {
                if let Err(err) = record.terminate() {
                    slog::warn!(slog_scope::logger(), "failed to terminate worker";
                        "worker" => %id,
                        "error" => %err
                    );
                }
            }
        }
    }

    /// Resolves shutdown waiters once every drained worker has disconnected.
    fn finish_if_drained(&mut self) -> bool {
        if !self.shutting_down || !self.draining.is_empty() {
            return false;
        }

        slog::info!(slog_scope::logger(), "all workers drained");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }

    /// Registered workers that are not on their way out after a scale-down.
    fn live_count(&self) -> usize {
        self.registry
            .keys()
            .filter(|id| !self.expected_exits.contains(*id))
            .count()
    }

    fn counts(&self) -> WorkerCounts {
        WorkerCounts {
            total: self.registry.len(),
            expected: self.target,
            active: self.registry.values().filter(|r| r.is_connected()).count(),
        }
    }
}
