use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::progress::ProgressUpdate;
use crate::common::client::models::clean_filename;

/// 下载目标：下载哪个文件、存到哪一类目录
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskTarget {
    pub model_id: u64,
    pub version_id: u64,
    pub file_id: u64,
    pub model_name: String,
    pub filename: String,
    pub model_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfolder: Option<String>,
    /// 模型描述，用于区分放大模型的子目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 任务生命周期状态，失败信息只存在于 Failed 中
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Completed,
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TaskStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    pub id: String,
    #[serde(flatten)]
    pub target: TaskTarget,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub progress: f64,
    #[serde(default)]
    pub download_speed: f64,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aria2_gid: Option<String>,
}

impl DownloadTask {
    // 新建任务，文件名会被清理
    pub fn new(mut target: TaskTarget) -> Self {
        target.filename = clean_filename(&target.filename);
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            status: TaskStatus::Queued,
            progress: 0.0,
            download_speed: 0.0,
            eta: None,
            file_path: None,
            created_at: Utc::now(),
            aria2_gid: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.progress = 100.0;
        self.eta = Some(0.0);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed {
            error: error.into(),
        };
        self.download_speed = 0.0;
        self.eta = None;
    }

    /// 合并一次进度回报。进度只增不减，终态不会被覆盖。
    pub fn apply_progress(&mut self, update: &ProgressUpdate) {
        if self.is_terminal() {
            return;
        }
        self.progress = self.progress.max(update.progress.clamp(0.0, 100.0));
        self.download_speed = update.download_speed.max(0.0);
        self.eta = update.eta;
        self.status = update.status.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TaskTarget {
        TaskTarget {
            model_id: 1,
            version_id: 2,
            file_id: 3,
            model_name: "Test".into(),
            filename: "a:b?.safetensors".into(),
            model_type: "LORA".into(),
            url: "http://localhost/file".into(),
            ..Default::default()
        }
    }

    #[test]
    fn new_task_is_queued_with_clean_filename() {
        let task = DownloadTask::new(target());
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.target.filename, "a_b_.safetensors");
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn failed_status_is_flattened_into_task_json() {
        let mut task = DownloadTask::new(target());
        task.mark_failed("HTTP 404");
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "HTTP 404");
        assert_eq!(value["model_type"], "LORA");

        let back: DownloadTask = serde_json::from_value(value).unwrap();
        assert_eq!(back.status.error(), Some("HTTP 404"));
    }

    #[test]
    fn progress_never_goes_backwards() {
        let mut task = DownloadTask::new(target());
        task.mark_downloading();
        let update = |progress| ProgressUpdate {
            progress,
            download_speed: 10.0,
            eta: Some(1.0),
            status: TaskStatus::Downloading,
        };
        task.apply_progress(&update(40.0));
        task.apply_progress(&update(20.0));
        assert_eq!(task.progress, 40.0);

        task.mark_completed();
        task.apply_progress(&update(50.0));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
    }
}
