mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use civitai_browser::common::client::CivitaiClient;
use civitai_browser::common::config::Settings;
use civitai_browser::downloader::aria2::{Aria2Options, Aria2Rpc};
use civitai_browser::downloader::{
    Aria2Bridge, DirectDownloader, DownloadTask, ModelDownloader, QueueManager, TaskStatus,
};
use civitai_browser::server::{AppState, build_router};
use common::{FileServer, fast_options, spawn_server, task, test_settings, wait_for_terminal};
use serde_json::{Value, json};
use tower::ServiceExt;

/// 模拟 aria2 JSON-RPC 服务
#[derive(Clone, Default)]
struct MockAria2 {
    calls: Arc<Mutex<Vec<Value>>>,
    fail_add_uri: bool,
}

impl MockAria2 {
    fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn last_call(&self, method: &str) -> Option<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c["method"] == method)
            .cloned()
    }

    async fn start(&self) -> SocketAddr {
        let app = Router::new()
            .route("/jsonrpc", post(handle_rpc))
            .with_state(self.clone());
        spawn_server(app).await
    }
}

async fn handle_rpc(State(mock): State<MockAria2>, Json(body): Json<Value>) -> Json<Value> {
    mock.calls.lock().unwrap().push(body.clone());
    let id = body["id"].clone();
    let result = match body["method"].as_str().unwrap_or_default() {
        "aria2.getVersion" => json!({"version": "1.37.0"}),
        "aria2.addUri" if mock.fail_add_uri => {
            return Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": 1, "message": "boom"}}));
        }
        "aria2.addUri" => json!("gid0001"),
        "aria2.tellStatus" => json!({"gid": "gid0001", "status": "active"}),
        "aria2.tellActive" => json!([{
            "gid": "gid0001",
            "status": "active",
            "completedLength": "50",
            "totalLength": "100",
            "downloadSpeed": "10",
            "files": [{"path": "/models/Lora/a.bin", "uris": [{"uri": "http://example/a", "status": "used"}]}]
        }]),
        "aria2.tellWaiting" => json!([]),
        "aria2.tellStopped" => json!([{
            "gid": "orphan",
            "status": "complete",
            "completedLength": "10",
            "totalLength": "10",
            "errorCode": "0",
            "files": [{"path": "/models/Other/orphan.bin", "uris": []}]
        }]),
        _ => json!("OK"),
    };
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

// 取一个当前没有监听的端口
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn bridge(settings: &Settings, port: u16) -> Arc<Aria2Bridge> {
    let options = Aria2Options {
        binary: "civitai-browser-missing-aria2c".to_string(),
        port,
        probe_attempts: 1,
        probe_interval: Duration::from_millis(10),
        ..Aria2Options::from_settings(settings)
    };
    let direct = Arc::new(DirectDownloader::new(settings).unwrap());
    Arc::new(Aria2Bridge::with_options(settings, options, direct).unwrap())
}

#[tokio::test]
async fn test_missing_aria2_falls_back_to_direct() {
    let server = FileServer::default();
    let addr = server.start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.download_with_aria2 = true;

    let bridge = bridge(&settings, closed_port().await);
    assert!(!bridge.ensure_running().await);

    let direct = Arc::new(DirectDownloader::new(&settings).unwrap());
    let downloader = ModelDownloader::new(direct, Some(bridge));
    let manager = QueueManager::new(Arc::new(downloader), fast_options());

    let stored = manager.enqueue(task(format!("http://{}/files/small", addr), "fallback.bin"));
    let done = wait_for_terminal(&manager, &stored.id).await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.aria2_gid.is_none());
    assert!(dir.path().join("Lora/fallback.bin").is_file());
    println!("✅ aria2 不可用时已回退到直接下载");
}

#[tokio::test]
async fn test_submit_delegates_to_aria2() {
    let mock = MockAria2::default();
    let rpc_addr = mock.start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.api_key = "secret-key".to_string();

    let bridge = bridge(&settings, rpc_addr.port());
    assert!(bridge.ensure_running().await);

    let result = bridge.submit(task("http://example/a", "a.bin"), None).await;
    assert_eq!(result.status, TaskStatus::Downloading);
    assert_eq!(result.progress, 0.0);
    assert_eq!(result.aria2_gid.as_deref(), Some("gid0001"));

    let add = mock.last_call("aria2.addUri").expect("应当调用 addUri");
    assert_eq!(add["params"][0], "token:civitai-browser");
    assert_eq!(add["params"][1], json!(["http://example/a"]));
    let options = &add["params"][2];
    assert_eq!(options["out"], "a.bin");
    assert_eq!(options["split"], "5");
    assert_eq!(options["allow-overwrite"], "true");
    assert!(options["dir"].as_str().unwrap().ends_with("Lora"));
    let headers: Vec<&str> = options["header"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(headers.contains(&"Authorization: Bearer secret-key"));
    assert!(headers.contains(&"Referer: https://civitai.com/"));

    assert!(mock.methods().contains(&"aria2.tellStatus".to_string()));
}

#[tokio::test]
async fn test_rpc_error_falls_back_to_direct() {
    let server = FileServer::default();
    let addr = server.start().await;
    let mock = MockAria2 {
        fail_add_uri: true,
        ..Default::default()
    };
    let rpc_addr = mock.start().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let bridge = bridge(&settings, rpc_addr.port());
    let result = bridge
        .submit(task(format!("http://{}/files/small", addr), "rpc.bin"), None)
        .await;

    assert_eq!(result.status, TaskStatus::Completed);
    assert!(result.aria2_gid.is_none());
    assert!(dir.path().join("Lora/rpc.bin").is_file());
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_existing_file_skips_aria2() {
    let mock = MockAria2::default();
    let rpc_addr = mock.start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("Lora")).unwrap();
    std::fs::write(dir.path().join("Lora/have.bin"), b"data").unwrap();

    let bridge = bridge(&test_settings(dir.path()), rpc_addr.port());
    let result = bridge.submit(task("http://example/have", "have.bin"), None).await;

    assert_eq!(result.status, TaskStatus::Completed);
    assert!(mock.last_call("aria2.addUri").is_none());
}

#[tokio::test]
async fn test_list_tasks_reconciles_and_syncs_history() {
    let mock = MockAria2::default();
    let rpc_addr = mock.start().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let bridge = bridge(&settings, rpc_addr.port());
    let direct = Arc::new(DirectDownloader::new(&settings).unwrap());
    let downloader = ModelDownloader::new(direct, Some(Arc::clone(&bridge)));
    let manager = QueueManager::new(Arc::new(downloader), fast_options());

    let stored = manager.enqueue(task("http://example/a", "a.bin"));
    // aria2 接手后任务以 downloading 状态进入历史
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let delegated = loop {
        let current = manager.status_of(&stored.id).unwrap();
        if current.aria2_gid.is_some() && manager.queued().is_empty() {
            break current;
        }
        assert!(tokio::time::Instant::now() < deadline, "任务未交给 aria2");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(delegated.status, TaskStatus::Downloading);

    let reconciled = bridge.list_tasks(&manager.snapshot()).await;
    assert_eq!(reconciled.len(), 2);
    let orphan = reconciled.iter().find(|t| t.id == "aria2-orphan").unwrap();
    assert_eq!(orphan.status, TaskStatus::Completed);
    assert_eq!(orphan.target.filename, "orphan.bin");

    assert_eq!(manager.sync_external(&reconciled), 1);
    let synced = manager.status_of(&stored.id).unwrap();
    assert_eq!(synced.status, TaskStatus::Downloading);
    assert_eq!(synced.progress, 50.0);
    assert_eq!(synced.download_speed, 10.0);
}

#[tokio::test]
async fn test_rpc_call_uses_token_param() {
    let mock = MockAria2::default();
    let rpc_addr = mock.start().await;
    let rpc = Aria2Rpc::new(format!("http://{}/jsonrpc", rpc_addr), "s3cret").unwrap();

    assert!(rpc.probe().await);
    let call = mock.last_call("aria2.getVersion").unwrap();
    assert_eq!(call["params"], json!(["token:s3cret"]));
    assert_eq!(call["jsonrpc"], "2.0");
}

// 入队一个任务并等待它交给 aria2
async fn delegated(bridge: &Arc<Aria2Bridge>, settings: &Settings) -> (QueueManager, DownloadTask) {
    let direct = Arc::new(DirectDownloader::new(settings).unwrap());
    let downloader = ModelDownloader::new(direct, Some(Arc::clone(bridge)));
    let manager = QueueManager::new(Arc::new(downloader), fast_options());

    let stored = manager.enqueue(task("http://example/a", "a.bin"));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = manager.status_of(&stored.id).unwrap();
        if current.aria2_gid.is_some() && manager.queued().is_empty() {
            return (manager, current);
        }
        assert!(tokio::time::Instant::now() < deadline, "任务未交给 aria2");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_download_routes_report_aria2_tasks() {
    let mock = MockAria2::default();
    let rpc_addr = mock.start().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let bridge = bridge(&settings, rpc_addr.port());
    let (manager, stored) = delegated(&bridge, &settings).await;
    let state = AppState::new(
        manager,
        CivitaiClient::new(&settings).unwrap(),
        Some(Arc::clone(&bridge)),
        settings,
        dir.path().join("settings.json"),
    );
    let app = build_router(state);

    // 单个任务查询也会同步 aria2 的进度
    let (status, single) = get_json(&app, &format!("/api/downloads/{}", stored.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(single["status"], "downloading");
    assert_eq!(single["progress"], 50.0);

    // 本地没有记录的 aria2 任务出现在列表中
    let (status, list) = get_json(&app, "/api/downloads").await;
    assert_eq!(status, StatusCode::OK);
    let tasks: Vec<DownloadTask> = serde_json::from_value(list).unwrap();
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids.len(), 2, "{:?}", ids);
    assert!(ids.contains(&stored.id.as_str()));
    let orphan = tasks.iter().find(|t| t.id == "aria2-orphan").unwrap();
    assert_eq!(orphan.status, TaskStatus::Completed);
    assert_eq!(orphan.target.model_name, "Aria2 download");
    for pair in tasks.windows(2) {
        assert!(pair[0].created_at >= pair[1].created_at);
    }
    println!("✅ aria2 任务已合并到下载列表");
}

#[tokio::test]
async fn test_waiting_record_does_not_requeue_delegated_task() {
    let mock = MockAria2::default();
    let rpc_addr = mock.start().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let bridge = bridge(&settings, rpc_addr.port());
    let (manager, stored) = delegated(&bridge, &settings).await;

    let mut waiting = stored.clone();
    waiting.status = TaskStatus::Queued;
    waiting.progress = 70.0;
    assert_eq!(manager.sync_external(&[waiting]), 1);

    let synced = manager.status_of(&stored.id).unwrap();
    assert_eq!(synced.status, TaskStatus::Downloading);
    assert_eq!(synced.progress, 70.0);

    let mut finished = synced.clone();
    finished.mark_completed();
    manager.sync_external(&[finished]);
    let done = manager.status_of(&stored.id).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100.0);
}
