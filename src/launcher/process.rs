//! OS process launcher.
//!
//! Workers are the current executable re-run with [`WORKER_ID_ENV`] set.
//! Control messages go down the child's stdin, reports come back on its
//! stdout, and stderr is inherited so worker logs land next to the
//! supervisor's. Stdout EOF is the `disconnect` event; reaping the child is
//! the `exit` event.

use super::{EventSender, Launcher, ProcessHandle};
use crate::cluster::WORKER_ID_ENV;
use crate::protocol::{ControlMessage, WorkerReport};
use crate::supervisor::ClusterError;
use crate::types::{ExitStatus, LifecycleEvent, WorkerId};
use crate::worker::WorkerLink;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

/// Launches workers as child processes of the current binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    /// Launches `program` with `args` for every worker.
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = OsString>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Re-executes the running binary with the arguments it was started with.
    pub fn current_exe() -> Result<Self, ClusterError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, std::env::args_os().skip(1)))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        id: WorkerId,
        events: EventSender,
    ) -> Result<Box<dyn ProcessHandle>, ClusterError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|source| ClusterError::ForkFailed { id, source })?;

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(ClusterError::ForkFailed {
                id,
                source: std::io::Error::other("worker pipes unavailable"),
            });
        };

        let connected = Arc::new(AtomicBool::new(true));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_control(id, stdin, control_rx));
        tokio::spawn(watch_process(
            id,
            child,
            stdout,
            Arc::clone(&connected),
            events,
        ));

        Ok(Box::new(OsProcess {
            id,
            pid,
            connected,
            control_tx,
        }))
    }
}

struct OsProcess {
    id: WorkerId,
    pid: Option<u32>,
    connected: Arc<AtomicBool>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ProcessHandle for OsProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
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
        let pid = self.pid.ok_or(ClusterError::Disconnected(self.id))?;
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|source| {
            ClusterError::SignalFailed {
                id: self.id,
                source,
            }
        })
    }
}

async fn write_control(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
) {
    while let Some(message) = control_rx.recv().await {
        if let Err(err) = write_line(&mut stdin, message.to_line()).await {
            slog::debug!(slog_scope::logger(), "control write failed";
                "worker" => %id,
                "error" => %err
            );
            break;
        }
    }
}

async fn watch_process(
    id: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    connected: Arc<AtomicBool>,
    events: EventSender,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match WorkerReport::from_line(&line) {
                Ok(report) => events.send(id, report.into()),
                Err(err) => {
                    slog::warn!(slog_scope::logger(), "ignoring malformed worker report";
                        "worker" => %id,
                        "error" => %err
                    );
                }
            },
            Ok(None) => break,
            Err(err) => {
                slog::warn!(slog_scope::logger(), "worker report stream failed";
                    "worker" => %id,
                    "error" => %err
                );
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    events.send(id, LifecycleEvent::Disconnected);

    let status = match child.wait().await {
        Ok(status) => ExitStatus::from(status),
        Err(err) => {
            slog::error!(slog_scope::logger(), "failed to reap worker";
                "worker" => %id,
                "error" => %err
            );
            ExitStatus::Code(-1)
        }
    };
    events.send(id, LifecycleEvent::Exited(status));
}

/// Worker-side end of the pipes: control messages from stdin, reports to
/// stdout. Stdin EOF closes the control channel.
pub(crate) fn stdio_link() -> WorkerLink {
    let (control_tx, control) = mpsc::unbounded_channel();
    let (reports, mut report_rx) = mpsc::unbounded_channel::<WorkerReport>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match ControlMessage::from_line(&line) {
                Ok(message) => {
                    if control_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    slog::warn!(slog_scope::logger(), "ignoring unknown control message";
                        "error" => %err
                    );
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(report) = report_rx.recv().await {
            if write_line(&mut stdout, report.to_line()).await.is_err() {
                break;
            }
        }
    });

    WorkerLink { control, reports }
}

async fn write_line<W>(writer: &mut W, line: Result<String, serde_json::Error>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = line.map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
