use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use url::Url;

use super::error::DownloadError;
use super::folder::FolderResolver;
use super::progress::{ProgressCallback, ProgressMeter};
use super::task::DownloadTask;
use crate::common::config::Settings;

const DOWNLOAD_USER_AGENT: &str = "Civitai-Browser-Docker/1.0";
const TEMP_SUFFIX: &str = ".downloading";

/// 直接下载：流式写入临时文件，完成后改名
#[derive(Debug, Clone)]
pub struct DirectDownloader {
    client: reqwest::Client,
    resolver: FolderResolver,
}

impl DirectDownloader {
    pub fn new(settings: &Settings) -> Result<Self, DownloadError> {
        let client = settings
            .client_builder()?
            .default_headers(Self::get_default_headers(&settings.api_key))
            .build()?;

        Ok(Self {
            client,
            resolver: FolderResolver::new(&settings.model_dir),
        })
    }

    pub fn get_default_headers(api_key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DOWNLOAD_USER_AGENT));
        if !api_key.is_empty() {
            match HeaderValue::from_str(&format!("Bearer {}", api_key)) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("API Key 含有非法字符，下载请求不带认证"),
            }
        }
        headers
    }

    /// 下载一个任务，所有失败都记录在返回的任务上
    pub async fn download(
        &self,
        mut task: DownloadTask,
        on_progress: Option<&ProgressCallback>,
    ) -> DownloadTask {
        info!("开始下载任务: {} ({})", task.target.filename, task.id);

        match self.run(&mut task, on_progress).await {
            Ok(()) => info!("✅ 下载任务完成: {}", task.target.filename),
            Err(e) => {
                error!("❌ 下载任务失败: {}, 错误: {}", task.target.filename, e);
                task.mark_failed(e.to_string());
            }
        }
        task
    }

    async fn run(
        &self,
        task: &mut DownloadTask,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<(), DownloadError> {
        let file_path = prepare_target(&self.resolver, task).await?;

        if is_existing_file(&file_path).await {
            info!("文件已存在，跳过下载: {}", file_path.display());
            task.mark_completed();
            return Ok(());
        }

        task.mark_downloading();
        let temp_path = temp_path_for(&file_path);

        if let Err(e) = self.stream_to_file(task, &temp_path, on_progress).await {
            remove_quietly(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = replace_file(&temp_path, &file_path).await {
            remove_quietly(&temp_path).await;
            return Err(e);
        }

        task.mark_completed();
        task.download_speed = 0.0;
        Ok(())
    }

    // 流式下载到临时文件，每个分块后更新任务进度
    async fn stream_to_file(
        &self,
        task: &mut DownloadTask,
        temp_path: &Path,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<(), DownloadError> {
        let url = parse_download_url(&task.target.url)?;
        let response = self.client.get(url.clone()).send().await?;
        Self::check_response_status(&response, url.as_str())?;

        let mut meter = ProgressMeter::new(response.content_length());
        debug!("开始下载二进制文件: {} -> {}", url, temp_path.display());

        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::Stream(e.to_string()))?;
            file.write_all(&chunk).await?;
            meter.advance(chunk.len() as u64);

            let now = Instant::now();
            let update = meter.snapshot_at(now);
            task.apply_progress(&update);

            if meter.should_emit_at(now) {
                if let Some(callback) = on_progress {
                    callback(&task.id, update);
                }
            }
        }

        file.flush().await?;
        debug!("下载写入完成: {} 字节", meter.downloaded());
        Ok(())
    }

    // 检查响应状态并处理特殊情况
    fn check_response_status(response: &reqwest::Response, url: &str) -> Result<(), DownloadError> {
        let status = response.status();
        debug!("Response Status: {}", status);

        match status {
            reqwest::StatusCode::UNAUTHORIZED => {
                warn!("🔐 检测到 401 Unauthorized 状态码，认证失败");
                Err(DownloadError::AccessDenied(format!(
                    "认证失败 (401 Unauthorized)，URL: {}，请检查 API Key",
                    url
                )))
            }
            reqwest::StatusCode::FORBIDDEN => {
                warn!("🚫 检测到 403 Forbidden 状态码");
                Err(DownloadError::AccessDenied(format!(
                    "访问被拒绝 (403 Forbidden)，URL: {}，该模型可能需要登录或 API Key",
                    url
                )))
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                warn!("⚠️ 检测到 429 Too Many Requests 状态码，请求过于频繁");
                Err(DownloadError::AccessDenied(format!(
                    "请求过于频繁 (429 Too Many Requests)，URL: {}，请稍后重试",
                    url
                )))
            }
            status if status.is_success() => Ok(()),
            status => {
                warn!("❌ 非成功状态码: {}", status);
                Err(DownloadError::Status {
                    status,
                    url: url.to_string(),
                })
            }
        }
    }
}

fn parse_download_url(raw: &str) -> Result<Url, DownloadError> {
    let url = Url::parse(raw).map_err(|e| DownloadError::InvalidUrl(format!("{} ({})", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(DownloadError::InvalidUrl(format!("不支持的协议 {}: {}", scheme, raw))),
    }
}

/// 解析并创建任务目标目录，记录最终文件路径
pub(crate) async fn prepare_target(
    resolver: &FolderResolver,
    task: &mut DownloadTask,
) -> Result<PathBuf, DownloadError> {
    let folder = resolver.target_folder(task);
    tokio::fs::create_dir_all(&folder)
        .await
        .map_err(|source| DownloadError::CreateDir {
            path: folder.clone(),
            source,
        })?;

    let file_path = folder.join(&task.target.filename);
    task.file_path = Some(file_path.clone());
    Ok(file_path)
}

/// 目标文件存在且非空
pub(crate) async fn is_existing_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

async fn replace_file(temp_path: &Path, file_path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(file_path).await {
        Ok(()) => debug!("已删除旧文件: {}", file_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::rename(temp_path, file_path).await?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已清理临时文件: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("清理临时文件失败 {}: {}", path.display(), e),
    }
}
