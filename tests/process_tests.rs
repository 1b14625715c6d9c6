mod common;

use common::{fast_config, wait_for_listening, wait_for_workers};
use std::ffi::OsString;
use tidepool::{ExitStatus, LifecycleEvent, ProcessLauncher, SupervisorHandle, WorkerId};
use tokio::time::{Duration, sleep, timeout};

// Speaks the report protocol on stdout and exits 0 on `"shutdown"`.
const SHELL_WORKER: &str = r#"
printf '{"type":"online"}\n'
printf '{"type":"listening","address":"127.0.0.1:%s"}\n' "$TIDEPOOL_WORKER_ID"
while read -r line; do
  case "$line" in
    *shutdown*) exit 0 ;;
    *health-check*) printf '{"type":"health","pid":%s,"uptime_secs":0,"max_rss_kib":0}\n' "$$" ;;
  esac
done
"#;

fn shell_launcher() -> ProcessLauncher {
    ProcessLauncher::new(
        "/bin/sh",
        [OsString::from("-c"), OsString::from(SHELL_WORKER)],
    )
}

#[tokio::test]
async fn test_process_workers_report_over_stdio() {
    let handle = SupervisorHandle::start(fast_config(2), shell_launcher()).unwrap();

    let workers = wait_for_listening(&handle, 2).await;
    for worker in &workers {
        assert!(worker.pid.is_some());
        assert_eq!(
            worker.address.as_deref(),
            Some(format!("127.0.0.1:{}", worker.id).as_str())
        );
    }

    timeout(Duration::from_secs(5), handle.shutdown_gracefully())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_process_health_reply_carries_pid() {
    let handle = SupervisorHandle::start(fast_config(1), shell_launcher()).unwrap();
    let mut events = handle.subscribe();
    let workers = wait_for_listening(&handle, 1).await;
    let pid = workers[0].pid.unwrap();

    let reported = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(event) = events.recv().await {
                if let LifecycleEvent::Health { pid, .. } = event.kind {
                    return pid;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reported, pid);

    handle.shutdown_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_process_scale_down_sends_sigterm() {
    let handle = SupervisorHandle::start(fast_config(2), shell_launcher()).unwrap();
    let mut events = handle.subscribe();
    wait_for_listening(&handle, 2).await;

    let outcome = handle.scale_workers(1).await.unwrap();
    assert_eq!(outcome.terminated, [WorkerId::new(1)]);

    let status = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(event) = events.recv().await {
                if let (LifecycleEvent::Exited(status), 1) = (event.kind, event.id.get()) {
                    return status;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(status, ExitStatus::Signal(15));

    sleep(Duration::from_millis(300)).await;
    let workers = wait_for_workers(&handle, |workers| workers.len() == 1).await;
    assert_eq!(workers[0].id, WorkerId::new(2));

    handle.shutdown_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_killed_process_is_replaced() {
    let handle = SupervisorHandle::start(fast_config(1), shell_launcher()).unwrap();
    let workers = wait_for_listening(&handle, 1).await;
    let pid = workers[0].pid.unwrap() as i32;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let workers = wait_for_workers(&handle, |workers| {
        workers.len() == 1 && workers[0].id == WorkerId::new(2) && workers[0].address.is_some()
    })
    .await;
    assert_ne!(workers[0].pid, Some(pid as u32));

    handle.shutdown_gracefully().await.unwrap();
}
