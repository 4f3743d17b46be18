use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::common::logger::PrettyLogger;
use crate::downloader::task::{DownloadTask, TaskStatus};

/// 按状态分组后的下载列表
#[derive(Debug, Default)]
pub struct StatusGroups {
    pub current: Vec<DownloadTask>,
    pub queued: Vec<DownloadTask>,
    pub recent: Vec<DownloadTask>,
}

impl StatusGroups {
    pub fn from_tasks(tasks: Vec<DownloadTask>) -> Self {
        let mut groups = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Downloading => groups.current.push(task),
                TaskStatus::Queued => groups.queued.push(task),
                TaskStatus::Completed | TaskStatus::Failed { .. } => groups.recent.push(task),
            }
        }
        // 排队按先后顺序显示
        groups.queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        groups
    }

    pub fn render(&self) {
        PrettyLogger::title("Civitai 下载状态");

        PrettyLogger::section("当前下载");
        if self.current.is_empty() {
            PrettyLogger::info("没有正在进行的下载");
        }
        for task in &self.current {
            PrettyLogger::current_task(task);
        }

        PrettyLogger::section(format!("等待队列 ({})", self.queued.len()));
        if self.queued.is_empty() {
            PrettyLogger::info("队列为空");
        }
        for task in &self.queued {
            PrettyLogger::task_line(task);
        }

        PrettyLogger::section(format!("最近下载 ({})", self.recent.len()));
        for task in &self.recent {
            PrettyLogger::task_line(task);
        }
        PrettyLogger::separator();

        let failed = self.recent.iter().filter(|t| t.status.error().is_some()).count();
        if failed > 0 {
            PrettyLogger::warning(format!("{} 个下载失败", failed));
        }
        if self.current.is_empty() && self.queued.is_empty() && !self.recent.is_empty() {
            PrettyLogger::success("队列中的下载已全部处理");
        }
    }
}

/// 通过 HTTP API 读取下载状态
pub struct StatusViewer {
    client: reqwest::Client,
    endpoint: String,
}

impl StatusViewer {
    pub fn new(server: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/downloads", server.trim_end_matches('/')),
        })
    }

    pub async fn fetch(&self) -> Result<Vec<DownloadTask>> {
        debug!("获取下载状态: {}", self.endpoint);
        let resp = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .with_context(|| format!("无法连接到服务: {}", self.endpoint))?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn show_once(&self) -> Result<()> {
        let tasks = self.fetch().await?;
        StatusGroups::from_tasks(tasks).render();
        Ok(())
    }

    /// 持续刷新，直到 Ctrl-C
    pub async fn watch(&self, interval: Duration) -> Result<()> {
        loop {
            // 清屏
            print!("\x1b[2J\x1b[H");
            match self.fetch().await {
                Ok(tasks) => StatusGroups::from_tasks(tasks).render(),
                Err(e) => PrettyLogger::error(format!("获取状态失败: {:#}", e)),
            }
            PrettyLogger::waiting(format!("每 {} 秒刷新，按 Ctrl-C 退出", interval.as_secs()));

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }
}

pub async fn run(server: &str, watch: bool, interval_secs: u64) -> Result<()> {
    let viewer = StatusViewer::new(server)?;
    if watch {
        viewer.watch(Duration::from_secs(interval_secs.max(1))).await
    } else {
        viewer.show_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::TaskTarget;

    #[test]
    fn groups_tasks_by_status() {
        let mut done = DownloadTask::new(TaskTarget::default());
        done.mark_completed();
        let mut running = DownloadTask::new(TaskTarget::default());
        running.mark_downloading();
        let first = DownloadTask::new(TaskTarget::default());
        let mut second = DownloadTask::new(TaskTarget::default());
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        let groups = StatusGroups::from_tasks(vec![second.clone(), done, running, first.clone()]);
        assert_eq!(groups.current.len(), 1);
        assert_eq!(groups.recent.len(), 1);
        let queued: Vec<_> = groups.queued.iter().map(|t| t.id.clone()).collect();
        assert_eq!(queued, vec![first.id, second.id]);
    }
}
