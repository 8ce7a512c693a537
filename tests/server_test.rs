// Integration test for the DownloadServer endpoints.
#![cfg(unix)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use download_orchestrator::api::gateway::ControlGateway;
use download_orchestrator::config::WorkerConfig;
use download_orchestrator::engine::registry::{RegistrySettings, SessionRegistry};
use download_orchestrator::server::handler::DownloadServer;
use download_orchestrator::worker::command::CommandLauncher;

const WORKER_SCRIPT: &str = r#"
case "$1" in
  missing.dat) echo 'not found' >&2; exit 2 ;;
  big.bin) echo 1%; exec sleep 30 ;;
  *) echo 10%; sleep 0.1; echo 55%; exit 0 ;;
esac
"#;

async fn start_server(dir: &Path) -> DownloadServer {
    let launcher = CommandLauncher::new(WorkerConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), WORKER_SCRIPT.to_string(), "worker".to_string()],
        output_dir: dir.to_path_buf(),
        signal_control: false,
    });
    let settings = RegistrySettings {
        terminate_grace: Duration::from_secs(2),
        ..RegistrySettings::default()
    };
    let registry = SessionRegistry::new(Arc::new(launcher), settings);
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    DownloadServer::start(ControlGateway::new(registry), addr)
        .await
        .unwrap()
}

async fn post(server: &DownloadServer, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(server.url("/download"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

/// Read the whole event stream (it closes after the terminal message).
async fn read_events(server: &DownloadServer, filename: &str) -> Vec<Value> {
    let resp = reqwest::Client::new()
        .get(server.url("/download"))
        .query(&[("filename", filename)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = tokio::time::timeout(Duration::from_secs(10), resp.text())
        .await
        .expect("event stream did not close")
        .unwrap();
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_start_and_stream_progress() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (status, body) = post(&server, json!({"filename": "report.csv", "action": "start"})).await;
    assert_eq!(status, 200);
    assert!(body["message"].as_str().unwrap().contains("report.csv"));

    let events = read_events(&server, "report.csv").await;
    assert_eq!(
        events,
        vec![
            json!({"filename": "report.csv", "progress": "10"}),
            json!({"filename": "report.csv", "progress": "55"}),
            json!({"filename": "report.csv", "complete": true, "code": 0}),
        ]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_worker_stream() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (status, _) = post(&server, json!({"filename": "missing.dat", "action": "start"})).await;
    assert_eq!(status, 200);

    let events = read_events(&server, "missing.dat").await;
    assert_eq!(
        events,
        vec![
            json!({"filename": "missing.dat", "error": "not found"}),
            json!({"filename": "missing.dat", "complete": true, "code": 2}),
        ]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_control_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (status, body) = post(&server, json!({"action": "start"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Filename is required");

    let (status, body) = post(&server, json!({"filename": "a.bin", "action": "explode"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid action");

    let (status, _) = post(&server, json!({"filename": "../a.bin", "action": "start"})).await;
    assert_eq!(status, 400);

    let (status, body) = post(&server, json!({"filename": "idle.bin", "action": "cancel"})).await;
    assert_eq!(status, 200);
    assert!(body["message"].is_string());

    let (status, _) = post(&server, json!({"filename": "idle.bin", "action": "pause"})).await;
    assert_eq!(status, 404);

    let (status, _) = post(&server, json!({"filename": "big.bin", "action": "start"})).await;
    assert_eq!(status, 200);

    let (status, _) = post(&server, json!({"filename": "big.bin", "action": "start"})).await;
    assert_eq!(status, 409);

    let (status, body) = post(&server, json!({"filename": "big.bin", "action": "pause"})).await;
    assert_eq!(status, 501);
    assert_eq!(body["reason"], "unsupported_action");

    let resp = reqwest::get(server.url("/sessions")).await.unwrap();
    let sessions: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["filename"], "big.bin");
    assert_eq!(sessions[0]["state"], "downloading");

    let resp = reqwest::get(server.url("/download?filename=nobody.bin"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.shutdown().await;
}

#[tokio::test]
async fn test_cancel_ends_open_stream() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (status, _) = post(&server, json!({"filename": "big.bin", "action": "start"})).await;
    assert_eq!(status, 200);

    let url = server.url("/download?filename=big.bin");
    let reader = tokio::spawn(async move {
        let resp = reqwest::get(url).await.unwrap();
        resp.text().await.unwrap()
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (status, _) = post(&server, json!({"filename": "big.bin", "action": "cancel"})).await;
    assert_eq!(status, 200);

    let body = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("stream stayed open after cancel")
        .unwrap();
    let last: Value = body
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .last()
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .unwrap();
    assert_eq!(
        last,
        json!({"filename": "big.bin", "complete": true, "cancelled": true})
    );

    let (status, _) = post(&server, json!({"filename": "big.bin", "action": "cancel"})).await;
    assert_eq!(status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_second_stream_supersedes_first() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (status, _) = post(&server, json!({"filename": "big.bin", "action": "start"})).await;
    assert_eq!(status, 200);

    let url = server.url("/download?filename=big.bin");
    let first_url = url.clone();
    let first = tokio::spawn(async move {
        let resp = reqwest::get(first_url).await.unwrap();
        resp.text().await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = reqwest::get(url).await.unwrap();
    assert_eq!(second.status(), 200);

    let body = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("first stream stayed open after a second subscriber")
        .unwrap();
    let frames: Vec<Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect();
    assert_eq!(
        frames.last(),
        Some(&json!({"filename": "big.bin", "complete": true, "superseded": true}))
    );

    let (status, _) = post(&server, json!({"filename": "big.bin", "action": "cancel"})).await;
    assert_eq!(status, 200);
    let body = tokio::time::timeout(Duration::from_secs(5), second.text())
        .await
        .expect("second stream stayed open after cancel")
        .unwrap();
    assert!(body.contains(r#""cancelled":true"#));

    server.shutdown().await;
}
