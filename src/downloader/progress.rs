use std::sync::Arc;
use std::time::{Duration, Instant};

use super::task::TaskStatus;

/// 进度回调的最小间隔
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

/// 下载器发给队列的一次进度回报
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub download_speed: f64,
    pub eta: Option<f64>,
    pub status: TaskStatus,
}

/// 进度回调：任务 ID + 进度
pub type ProgressCallback = Arc<dyn Fn(&str, ProgressUpdate) + Send + Sync>;

/// 按字节统计进度、速度和剩余时间
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    total: Option<u64>,
    downloaded: u64,
    started: Instant,
    last_emit: Instant,
    interval: Duration,
}

impl ProgressMeter {
    pub fn new(total: Option<u64>) -> Self {
        Self::starting_at(total, Instant::now())
    }

    pub fn starting_at(total: Option<u64>, now: Instant) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            downloaded: 0,
            started: now,
            last_emit: now,
            interval: PROGRESS_INTERVAL,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.downloaded += bytes;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn snapshot_at(&self, now: Instant) -> ProgressUpdate {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.downloaded as f64 / elapsed
        } else {
            0.0
        };

        let (progress, eta) = match self.total {
            Some(total) => {
                let progress = (self.downloaded as f64 / total as f64 * 100.0).min(100.0);
                let remaining = total.saturating_sub(self.downloaded) as f64;
                let eta = (speed > 0.0).then(|| remaining / speed);
                (progress, eta)
            }
            // 总大小未知
            None => (0.0, None),
        };

        ProgressUpdate {
            progress,
            download_speed: speed,
            eta,
            status: TaskStatus::Downloading,
        }
    }

    /// 距离上次回报超过间隔时返回 true 并重置计时
    pub fn should_emit_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_emit) >= self.interval {
            self.last_emit = now;
            true
        } else {
            false
        }
    }
}
