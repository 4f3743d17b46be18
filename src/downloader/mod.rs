use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::common::config::Settings;

pub mod aria2;
pub mod core;
pub mod error;
pub mod folder;
pub mod history;
pub mod manager;
pub mod progress;
pub mod task;

pub use aria2::Aria2Bridge;
pub use self::core::DirectDownloader;
pub use error::DownloadError;
pub use folder::FolderResolver;
pub use manager::{QueueManager, QueueOptions};
pub use progress::{ProgressCallback, ProgressUpdate};
pub use task::{DownloadTask, TaskStatus, TaskTarget};

/// 队列后台任务调用的下载执行器
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 执行一个任务并返回更新后的任务，失败记录在任务上
    async fn execute(&self, task: DownloadTask, on_progress: ProgressCallback) -> DownloadTask;
}

/// 模型下载策略：aria2 已启用且可用时交给 aria2，否则直接下载
pub struct ModelDownloader {
    direct: Arc<DirectDownloader>,
    aria2: Option<Arc<Aria2Bridge>>,
}

impl ModelDownloader {
    pub fn new(direct: Arc<DirectDownloader>, aria2: Option<Arc<Aria2Bridge>>) -> Self {
        Self { direct, aria2 }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, DownloadError> {
        let direct = Arc::new(DirectDownloader::new(settings)?);
        let aria2 = if settings.download_with_aria2 {
            Some(Arc::new(Aria2Bridge::new(settings, Arc::clone(&direct))?))
        } else {
            None
        };
        Ok(Self::new(direct, aria2))
    }

    pub fn aria2(&self) -> Option<&Arc<Aria2Bridge>> {
        self.aria2.as_ref()
    }
}

#[async_trait]
impl TaskExecutor for ModelDownloader {
    async fn execute(&self, task: DownloadTask, on_progress: ProgressCallback) -> DownloadTask {
        if let Some(bridge) = &self.aria2 {
            if bridge.ensure_running().await {
                info!("使用 aria2 下载: {}", task.target.filename);
                return bridge.submit(task, Some(&on_progress)).await;
            }
            warn!("⚠️ aria2 不可用，使用直接下载: {}", task.target.filename);
        }
        self.direct.download(task, Some(&on_progress)).await
    }
}
