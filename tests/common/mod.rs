#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use civitai_browser::common::config::Settings;
use civitai_browser::downloader::{DownloadTask, QueueManager, QueueOptions, TaskTarget};

pub const SMALL_FILE_LEN: usize = 100;
pub const SLOW_CHUNKS: usize = 12;
pub const SLOW_CHUNK_LEN: usize = 1024;

/// 在随机端口上启动一个 axum 服务
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// 测试用文件服务器，记录请求次数
#[derive(Clone, Default)]
pub struct FileServer {
    pub hits: Arc<AtomicUsize>,
}

impl FileServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> SocketAddr {
        let app = Router::new()
            .route("/files/small", get(small_file))
            .route("/files/slow", get(slow_file))
            .route("/files/missing", get(missing_file))
            .route("/files/forbidden", get(forbidden_file))
            .with_state(self.clone());
        spawn_server(app).await
    }
}

async fn small_file(State(server): State<FileServer>) -> Vec<u8> {
    server.hits.fetch_add(1, Ordering::SeqCst);
    vec![7u8; SMALL_FILE_LEN]
}

// 分块慢速返回，让进度回调有机会触发
async fn slow_file(State(server): State<FileServer>) -> Response {
    server.hits.fetch_add(1, Ordering::SeqCst);
    let stream = futures_util::stream::unfold(0usize, |sent| async move {
        if sent >= SLOW_CHUNKS {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let chunk: Result<Bytes, Infallible> = Ok(Bytes::from(vec![1u8; SLOW_CHUNK_LEN]));
        Some((chunk, sent + 1))
    });

    Response::builder()
        .header(header::CONTENT_LENGTH, SLOW_CHUNKS * SLOW_CHUNK_LEN)
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn missing_file(State(server): State<FileServer>) -> impl IntoResponse {
    server.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "not found")
}

async fn forbidden_file(State(server): State<FileServer>) -> impl IntoResponse {
    server.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::FORBIDDEN, "forbidden")
}

pub fn test_settings(model_dir: &Path) -> Settings {
    Settings {
        model_dir: model_dir.to_path_buf(),
        download_with_aria2: false,
        timeout: 5,
        ..Settings::default()
    }
}

pub fn fast_options() -> QueueOptions {
    QueueOptions {
        recent_capacity: 20,
        startup_delay: Duration::ZERO,
        error_backoff: Duration::from_millis(10),
    }
}

pub fn target(url: impl Into<String>, filename: &str) -> TaskTarget {
    TaskTarget {
        model_id: 1,
        version_id: 10,
        file_id: 100,
        model_name: "Test Model".to_string(),
        filename: filename.to_string(),
        model_type: "LORA".to_string(),
        url: url.into(),
        ..Default::default()
    }
}

pub fn task(url: impl Into<String>, filename: &str) -> DownloadTask {
    QueueManager::create_task(target(url, filename))
}

/// 等待任务进入终态
pub async fn wait_for_terminal(manager: &QueueManager, id: &str) -> DownloadTask {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = manager.status_of(id) {
            if task.is_terminal() {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "任务 {} 未在限定时间内结束",
            id
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 等待后台任务退出
pub async fn wait_for_idle(manager: &QueueManager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.is_worker_running() {
        assert!(tokio::time::Instant::now() < deadline, "下载队列未在限定时间内清空");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
