use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::core::{DirectDownloader, is_existing_file, prepare_target};
use super::error::DownloadError;
use super::folder::FolderResolver;
use super::progress::ProgressCallback;
use super::task::{DownloadTask, TaskStatus, TaskTarget};
use crate::common::config::Settings;

const RPC_ID: &str = "civitai-browser";
const RPC_TIMEOUT: Duration = Duration::from_secs(5);
const REFERER: &str = "https://civitai.com/";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const LIST_PAGE: u64 = 100;

/// aria2 进程与 RPC 参数
#[derive(Debug, Clone)]
pub struct Aria2Options {
    pub binary: String,
    pub port: u16,
    pub secret: String,
    pub extra_flags: Vec<String>,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
}

impl Aria2Options {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            binary: settings.aria2_binary.clone(),
            port: settings.aria2_rpc_port,
            secret: settings.aria2_secret.clone(),
            extra_flags: settings
                .aria2_flags
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            probe_attempts: 5,
            probe_interval: Duration::from_secs(1),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}/jsonrpc", self.port)
    }

    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--enable-rpc".to_string(),
            "--rpc-listen-all".to_string(),
            format!("--rpc-listen-port={}", self.port),
            format!("--rpc-secret={}", self.secret),
            "--check-certificate=false".to_string(),
            "--file-allocation=none".to_string(),
            "--continue=true".to_string(),
            "--auto-file-renaming=false".to_string(),
        ];
        args.extend(self.extra_flags.iter().cloned());
        args
    }
}

/// aria2 JSON-RPC 客户端
#[derive(Debug, Clone)]
pub struct Aria2Rpc {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl Aria2Rpc {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            secret: secret.into(),
        })
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, DownloadError> {
        let mut full = vec![json!(format!("token:{}", self.secret))];
        full.extend(params);
        let body = json!({
            "jsonrpc": "2.0",
            "id": RPC_ID,
            "method": method,
            "params": full,
        });

        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| DownloadError::Rpc(format!("{} 响应无法解析 ({}): {}", method, status, e)))?;

        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(DownloadError::Rpc(format!("{}: {}", method, message)));
        }
        if !status.is_success() {
            return Err(DownloadError::Rpc(format!("{}: HTTP {}", method, status)));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| DownloadError::Rpc(format!("{}: 响应缺少 result", method)))
    }

    pub async fn probe(&self) -> bool {
        match self.call("aria2.getVersion", vec![]).await {
            Ok(version) => {
                debug!("aria2 版本: {}", version["version"]);
                true
            }
            Err(e) => {
                debug!("aria2 RPC 不可达: {}", e);
                false
            }
        }
    }

    pub async fn add_uri(&self, url: &str, options: Value) -> Result<String, DownloadError> {
        let result = self.call("aria2.addUri", vec![json!([url]), options]).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DownloadError::Rpc(format!("aria2.addUri 返回了无效的 GID: {}", result)))
    }

    pub async fn tell_status(&self, gid: &str) -> Result<Aria2Status, DownloadError> {
        let result = self.call("aria2.tellStatus", vec![json!(gid)]).await?;
        serde_json::from_value(result).map_err(|e| DownloadError::Rpc(e.to_string()))
    }

    pub async fn remove(&self, gid: &str) -> Result<(), DownloadError> {
        self.call("aria2.remove", vec![json!(gid)]).await.map(|_| ())
    }

    pub async fn tell_active(&self) -> Result<Vec<Aria2Status>, DownloadError> {
        self.list("aria2.tellActive", vec![]).await
    }

    pub async fn tell_waiting(&self, offset: u64, num: u64) -> Result<Vec<Aria2Status>, DownloadError> {
        self.list("aria2.tellWaiting", vec![json!(offset), json!(num)])
            .await
    }

    pub async fn tell_stopped(&self, offset: u64, num: u64) -> Result<Vec<Aria2Status>, DownloadError> {
        self.list("aria2.tellStopped", vec![json!(offset), json!(num)])
            .await
    }

    async fn list(&self, method: &str, params: Vec<Value>) -> Result<Vec<Aria2Status>, DownloadError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| DownloadError::Rpc(format!("{}: {}", method, e)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aria2Status {
    #[serde(default)]
    pub gid: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub completed_length: Option<String>,
    #[serde(default)]
    pub total_length: Option<String>,
    #[serde(default)]
    pub download_speed: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub files: Vec<Aria2File>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aria2File {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub uris: Vec<Aria2Uri>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aria2Uri {
    #[serde(default)]
    pub uri: String,
}

/// aria2 的三个任务列表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aria2List {
    Active,
    Waiting,
    Stopped,
}

fn parse_len(value: Option<&String>) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// 把一条 aria2 记录对应到已知任务上，找不到就生成占位任务
pub fn reconcile(list: Aria2List, record: &Aria2Status, known: &[DownloadTask]) -> DownloadTask {
    let mut task = known
        .iter()
        .find(|t| t.aria2_gid.as_deref() == Some(record.gid.as_str()))
        .cloned()
        .unwrap_or_else(|| placeholder(record));

    let completed = parse_len(record.completed_length.as_ref());
    let total = parse_len(record.total_length.as_ref());
    let speed = parse_len(record.download_speed.as_ref()) as f64;
    let progress = if total > 0 {
        (completed as f64 / total as f64 * 100.0).min(100.0)
    } else {
        0.0
    };

    task.progress = progress;
    task.download_speed = speed;
    task.eta = (speed > 0.0 && total > completed).then(|| (total - completed) as f64 / speed);

    match list {
        Aria2List::Active => task.status = TaskStatus::Downloading,
        Aria2List::Waiting => task.status = TaskStatus::Queued,
        Aria2List::Stopped => {
            let code = record.error_code.as_deref().unwrap_or("0");
            if code != "0" {
                let message = record
                    .error_message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("aria2 error code {}", code));
                task.mark_failed(message);
            } else if record.status.as_deref() == Some("complete") || (total > 0 && completed >= total) {
                task.mark_completed();
                task.download_speed = 0.0;
            } else {
                task.mark_failed("stopped before completion");
            }
        }
    }
    task
}

fn placeholder(record: &Aria2Status) -> DownloadTask {
    let first = record.files.first();
    let path = first.map(|f| f.path.as_str()).unwrap_or_default();
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let url = first
        .and_then(|f| f.uris.first())
        .map(|u| u.uri.clone())
        .unwrap_or_default();

    DownloadTask {
        id: format!("aria2-{}", record.gid),
        target: TaskTarget {
            model_name: "Aria2 download".to_string(),
            filename,
            model_type: "Unknown".to_string(),
            url,
            ..Default::default()
        },
        status: TaskStatus::Queued,
        progress: 0.0,
        download_speed: 0.0,
        eta: None,
        file_path: (!path.is_empty()).then(|| path.into()),
        created_at: Utc::now(),
        aria2_gid: Some(record.gid.clone()),
    }
}

/// aria2 加速下载，任何失败都回退到直接下载
pub struct Aria2Bridge {
    rpc: Aria2Rpc,
    options: Aria2Options,
    resolver: FolderResolver,
    direct: Arc<DirectDownloader>,
    api_key: String,
    process: Mutex<Option<Child>>,
}

impl Aria2Bridge {
    pub fn new(settings: &Settings, direct: Arc<DirectDownloader>) -> Result<Self, DownloadError> {
        Self::with_options(settings, Aria2Options::from_settings(settings), direct)
    }

    pub fn with_options(
        settings: &Settings,
        options: Aria2Options,
        direct: Arc<DirectDownloader>,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            rpc: Aria2Rpc::new(options.endpoint(), options.secret.clone())?,
            options,
            resolver: FolderResolver::new(&settings.model_dir),
            direct,
            api_key: settings.api_key.clone(),
            process: Mutex::new(None),
        })
    }

    /// 确保 aria2 RPC 可用，必要时启动进程
    pub async fn ensure_running(&self) -> bool {
        if self.rpc.probe().await {
            return true;
        }

        if !self.process_alive() {
            info!("🚀 启动 aria2 RPC 服务，端口: {}", self.options.port);
            if let Err(e) = self.spawn() {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!("⚠️ 找不到 aria2 可执行文件: {}", self.options.binary);
                } else {
                    warn!("⚠️ 启动 aria2 失败: {}", e);
                }
                return false;
            }
        }

        let attempts = self.options.probe_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.options.probe_interval).await;
            if self.rpc.probe().await {
                info!("✅ aria2 RPC 服务已就绪");
                return true;
            }
            debug!("等待 aria2 RPC 服务启动 ({}/{})", attempt, attempts);
        }

        warn!("⚠️ aria2 RPC 服务启动超时");
        false
    }

    fn process_alive(&self) -> bool {
        let mut guard = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }

    fn spawn(&self) -> std::io::Result<()> {
        let child = Command::new(&self.options.binary)
            .args(self.options.launch_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        debug!("aria2 进程已启动, pid: {:?}", child.id());
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        Ok(())
    }

    /// 交给 aria2 下载，失败时用直接下载处理同一个任务
    pub async fn submit(
        &self,
        mut task: DownloadTask,
        on_progress: Option<&ProgressCallback>,
    ) -> DownloadTask {
        match self.delegate(&mut task).await {
            Ok(()) => task,
            Err(e) => {
                warn!("⚠️ aria2 下载设置失败: {}，回退到直接下载", e);
                task.aria2_gid = None;
                self.direct.download(task, on_progress).await
            }
        }
    }

    async fn delegate(&self, task: &mut DownloadTask) -> Result<(), DownloadError> {
        let file_path = prepare_target(&self.resolver, task).await?;

        if is_existing_file(&file_path).await {
            info!("文件已存在，跳过下载: {}", file_path.display());
            task.mark_completed();
            return Ok(());
        }

        if !self.rpc.probe().await {
            return Err(DownloadError::Unavailable(self.options.endpoint()));
        }

        let folder = file_path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let gid = self
            .rpc
            .add_uri(&task.target.url, self.add_options(&folder, &task.target.filename))
            .await?;
        info!("📥 已提交到 aria2: {} (GID: {})", task.target.filename, gid);

        task.aria2_gid = Some(gid.clone());
        task.mark_downloading();
        task.progress = 0.0;

        if let Err(e) = self.rpc.tell_status(&gid).await {
            if let Err(remove_err) = self.rpc.remove(&gid).await {
                debug!("移除 aria2 任务失败: {}", remove_err);
            }
            return Err(e);
        }
        Ok(())
    }

    fn add_options(&self, dir: &str, out: &str) -> Value {
        let mut headers = Vec::new();
        if !self.api_key.is_empty() {
            headers.push(format!("Authorization: Bearer {}", self.api_key));
        }
        headers.push(format!("Referer: {}", REFERER));
        headers.push(format!("User-Agent: {}", BROWSER_USER_AGENT));

        json!({
            "dir": dir,
            "out": out,
            "header": headers,
            "continue": "true",
            "max-connection-per-server": "5",
            "split": "5",
            "min-split-size": "1M",
            "conditional-get": "true",
            "auto-file-renaming": "false",
            "check-integrity": "false",
            "file-allocation": "none",
            "allow-overwrite": "true",
        })
    }

    /// 读取 aria2 中的全部任务并对应到已知任务，失败时返回已取得的部分
    pub async fn list_tasks(&self, known: &[DownloadTask]) -> Vec<DownloadTask> {
        let mut tasks = Vec::new();
        if !self.rpc.probe().await {
            return tasks;
        }

        let lists = [
            (Aria2List::Active, self.rpc.tell_active().await),
            (Aria2List::Waiting, self.rpc.tell_waiting(0, LIST_PAGE).await),
            (Aria2List::Stopped, self.rpc.tell_stopped(0, LIST_PAGE).await),
        ];
        for (list, result) in lists {
            match result {
                Ok(records) => tasks.extend(records.iter().map(|r| reconcile(list, r, known))),
                Err(e) => warn!("⚠️ 读取 aria2 任务列表失败 ({:?}): {}", list, e),
            }
        }
        tasks
    }
}
