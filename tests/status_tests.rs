mod common;

use common::{fast_config, wait_for_listening};
use std::net::SocketAddr;
use tidepool::status::StatusService;
use tidepool::{SupervisorHandle, TaskLauncher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn fetch(address: SocketAddr) -> serde_json::Value {
    let mut stream = TcpStream::connect(address).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got {}", response);

    let (_, body) = response.split_once("\r\n\r\n").unwrap();
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_status_service_names_the_worker() {
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let launcher = TaskLauncher::new(move |_| StatusService::new(bind));
    let handle = SupervisorHandle::start(fast_config(1), launcher).unwrap();

    let workers = wait_for_listening(&handle, 1).await;
    let address: SocketAddr = workers[0].address.as_deref().unwrap().parse().unwrap();
    assert_ne!(address.port(), 0);

    let body = fetch(address).await;
    assert_eq!(body["worker"], 1);
    assert_eq!(body["pid"], std::process::id());

    handle.shutdown_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_workers_share_one_port() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let launcher = TaskLauncher::new(move |_| StatusService::new(bind));
    let handle = SupervisorHandle::start(fast_config(2), launcher).unwrap();

    let workers = wait_for_listening(&handle, 2).await;
    for worker in &workers {
        assert_eq!(worker.address.as_deref(), Some(bind.to_string().as_str()));
    }

    let body = fetch(bind).await;
    let served_by = body["worker"].as_u64().unwrap();
    assert!(served_by == 1 || served_by == 2);

    handle.shutdown_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_status_service_stops_accepting_after_shutdown() {
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let launcher = TaskLauncher::new(move |_| StatusService::new(bind));
    let handle = SupervisorHandle::start(fast_config(1), launcher).unwrap();

    let workers = wait_for_listening(&handle, 1).await;
    let address: SocketAddr = workers[0].address.as_deref().unwrap().parse().unwrap();

    handle.shutdown_gracefully().await.unwrap();
    assert!(TcpStream::connect(address).await.is_err());
}
