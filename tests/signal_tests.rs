use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use tidepool::admin::AdminClient;
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant, sleep, timeout};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

fn spawn_master(socket: &Path, workers: usize) -> Child {
    Command::new(env!("CARGO_BIN_EXE_tidepool"))
        .args(["serve", "--addr", "127.0.0.1:0", "--workers"])
        .arg(workers.to_string())
        .arg("--admin-socket")
        .arg(socket)
        .env("ENABLE_CLUSTERING", "true")
        .env_remove("TIDEPOOL_WORKER_ID")
        .env_remove("CLUSTER_WORKERS")
        .env_remove("CLUSTER_ADMIN_SOCKET")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

/// Waits until every worker listens and returns their pids. The admin socket
/// only answers once the master has installed its signal handlers.
async fn wait_for_worker_pids(socket: &Path, workers: usize) -> Vec<i32> {
    let client = AdminClient::new(socket);
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if let Ok(listed) = client.workers().await {
            if listed.len() == workers && listed.iter().all(|w| w.address.is_some()) {
                return listed.iter().filter_map(|w| w.pid).map(|pid| pid as i32).collect();
            }
        }
        assert!(Instant::now() < deadline, "master never reported {} workers", workers);
        sleep(Duration::from_millis(50)).await;
    }
}

/// A process is gone once it no longer exists or only a zombie is left.
fn is_gone(pid: i32) -> bool {
    if kill(Pid::from_raw(pid), None).is_err() {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false)
        })
        .unwrap_or(true)
}

#[tokio::test]
async fn test_repeated_signals_shut_the_master_down_once() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("admin.sock");
    let mut master = spawn_master(&socket, 2);
    let master_pid = Pid::from_raw(master.id().unwrap() as i32);

    let workers = wait_for_worker_pids(&socket, 2).await;
    assert_eq!(workers.len(), 2);

    kill(master_pid, Signal::SIGINT).unwrap();
    // The drain may already be over by the time the repeats land.
    let _ = kill(master_pid, Signal::SIGINT);
    let _ = kill(master_pid, Signal::SIGTERM);

    let status = timeout(WAIT_LIMIT, master.wait()).await.unwrap().unwrap();
    assert!(status.success(), "master exited with {}", status);

    let deadline = Instant::now() + WAIT_LIMIT;
    while !workers.iter().all(|pid| is_gone(*pid)) {
        assert!(Instant::now() < deadline, "workers {:?} outlived the master", workers);
        sleep(Duration::from_millis(20)).await;
    }

    assert!(!socket.exists(), "admin socket left behind");
}

#[tokio::test]
async fn test_sigterm_drains_workers_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("admin.sock");
    let mut master = spawn_master(&socket, 1);
    let master_pid = Pid::from_raw(master.id().unwrap() as i32);

    let workers = wait_for_worker_pids(&socket, 1).await;

    kill(master_pid, Signal::SIGTERM).unwrap();

    let status = timeout(WAIT_LIMIT, master.wait()).await.unwrap().unwrap();
    assert_eq!(status.code(), Some(0));

    let deadline = Instant::now() + WAIT_LIMIT;
    while !is_gone(workers[0]) {
        assert!(Instant::now() < deadline, "worker {} outlived the master", workers[0]);
        sleep(Duration::from_millis(20)).await;
    }
}
