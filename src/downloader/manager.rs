//! 下载队列：单个后台任务按 FIFO 顺序执行下载，读操作随时返回状态副本。

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::TaskExecutor;
use super::history::RecentHistory;
use super::progress::{ProgressCallback, ProgressUpdate};
use super::task::{DownloadTask, TaskStatus, TaskTarget};
use crate::common::config::Settings;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// 最近任务保留数量
    pub recent_capacity: usize,
    /// 后台任务启动前的等待
    pub startup_delay: Duration,
    /// 执行崩溃后的等待
    pub error_backoff: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            recent_capacity: 20,
            startup_delay: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl QueueOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            recent_capacity: settings.recent_capacity,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<DownloadTask>,
    current: Option<DownloadTask>,
    recent: RecentHistory,
    worker_running: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    executor: Arc<dyn TaskExecutor>,
    options: QueueOptions,
}

#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    pub fn new(executor: Arc<dyn TaskExecutor>, options: QueueOptions) -> Self {
        let state = QueueState {
            queue: VecDeque::new(),
            current: None,
            recent: RecentHistory::new(options.recent_capacity),
            worker_running: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                executor,
                options,
            }),
        }
    }

    /// 新建一个排队中的任务，不入队
    pub fn create_task(target: TaskTarget) -> DownloadTask {
        DownloadTask::new(target)
    }

    /// 入队并确保后台任务在运行，返回队列中保存的副本
    pub fn enqueue(&self, mut task: DownloadTask) -> DownloadTask {
        task.status = TaskStatus::Queued;

        let mut state = self.shared.lock();
        state.queue.push_back(task.clone());
        state.recent.push(task.clone());
        info!(
            "📋 已添加下载任务: {} - {} (ID: {})，队列长度: {}",
            task.target.model_name,
            task.target.filename,
            task.id,
            state.queue.len()
        );
        Shared::ensure_worker(&self.shared, &mut state);
        task
    }

    /// 取消尚未开始的任务
    pub fn dequeue(&self, id: &str) -> bool {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if state.current.as_ref().is_some_and(|c| c.id == id) {
            debug!("任务正在执行，无法取消: {}", id);
            return false;
        }

        let Some(index) = state
            .queue
            .iter()
            .position(|t| t.id == id && t.status == TaskStatus::Queued)
        else {
            return false;
        };

        state.queue.remove(index);
        state.recent.remove(id);
        info!("🗑️ 已取消下载任务: {}", id);
        true
    }

    pub fn status_of(&self, id: &str) -> Option<DownloadTask> {
        let state = self.shared.lock();
        state
            .current
            .iter()
            .chain(state.queue.iter())
            .chain(state.recent.iter())
            .find(|t| t.id == id)
            .cloned()
    }

    /// 当前 + 队列 + 历史，按 ID 去重，创建时间倒序
    pub fn snapshot(&self) -> Vec<DownloadTask> {
        let state = self.shared.lock();
        let mut seen = HashSet::new();
        let mut tasks: Vec<DownloadTask> = state
            .current
            .iter()
            .chain(state.queue.iter())
            .chain(state.recent.iter())
            .filter(|t| seen.insert(t.id.clone()))
            .cloned()
            .collect();
        drop(state);

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn queued(&self) -> Vec<DownloadTask> {
        self.shared.lock().queue.iter().cloned().collect()
    }

    /// 清空历史，只保留尚未结束的当前和排队任务
    pub fn clear_history(&self) {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let active: Vec<DownloadTask> = state
            .current
            .iter()
            .chain(state.queue.iter())
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect();

        state.recent.clear();
        for task in active.into_iter().rev() {
            state.recent.push(task);
        }
        info!("🧹 已清除下载历史，保留 {} 个进行中的任务", state.recent.len());
    }

    /// 把 aria2 的状态同步到历史中同 GID 且未结束的任务上，返回更新数量
    pub fn sync_external(&self, tasks: &[DownloadTask]) -> usize {
        let mut state = self.shared.lock();
        let mut updated = 0;

        for external in tasks {
            let Some(gid) = external.aria2_gid.as_deref() else {
                continue;
            };
            for entry in state.recent.iter_mut() {
                if entry.is_terminal() || entry.aria2_gid.as_deref() != Some(gid) {
                    continue;
                }
                entry.progress = entry.progress.max(external.progress);
                entry.download_speed = external.download_speed;
                entry.eta = external.eta;
                // 只接受终态，aria2 的等待状态不会让任务退回排队
                if external.is_terminal() {
                    entry.status = external.status.clone();
                }
                if entry.status == TaskStatus::Completed {
                    entry.progress = 100.0;
                }
                updated += 1;
            }
        }
        updated
    }

    pub fn is_worker_running(&self) -> bool {
        self.shared.lock().worker_running
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // 调用方持有锁；标记和启动在同一临界区内完成
    fn ensure_worker(shared: &Arc<Shared>, state: &mut QueueState) {
        if state.worker_running {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.worker_running = true;
                handle.spawn(Shared::run_worker(Arc::clone(shared)));
                debug!("下载队列后台任务已启动");
            }
            Err(e) => error!("❌ 无法启动下载队列后台任务，缺少 tokio 运行时: {}", e),
        }
    }

    async fn run_worker(shared: Arc<Shared>) {
        if !shared.options.startup_delay.is_zero() {
            tokio::time::sleep(shared.options.startup_delay).await;
        }
        info!("开始处理下载队列");

        while let Some(task) = shared.begin_next() {
            info!(
                "*** 开始下载任务 ***: {} - {} (ID: {})",
                task.target.model_name, task.target.filename, task.id
            );

            let executor = Arc::clone(&shared.executor);
            let on_progress = Shared::progress_callback(&shared);
            let job = tokio::spawn(async move { executor.execute(task, on_progress).await });

            match job.await {
                Ok(result) => shared.finish(result),
                Err(e) => {
                    let message = match e.try_into_panic() {
                        Ok(payload) => panic_message(payload),
                        Err(e) => e.to_string(),
                    };
                    error!("❌ 处理下载队列时出错: {}", message);
                    shared.abort_current(&message);
                    tokio::time::sleep(shared.options.error_backoff).await;
                }
            }
        }

        info!("下载队列处理完成，当前队列为空");
    }

    fn progress_callback(shared: &Arc<Shared>) -> ProgressCallback {
        let shared = Arc::clone(shared);
        Arc::new(move |id: &str, update: ProgressUpdate| shared.merge_progress(id, &update))
    }

    // 取出队首作为当前任务；队列为空时清除标记并返回 None
    fn begin_next(&self) -> Option<DownloadTask> {
        let mut guard = self.lock();
        let state = &mut *guard;

        match state.queue.front_mut() {
            Some(head) => {
                head.mark_downloading();
                let snapshot = head.clone();
                state.current = Some(snapshot.clone());
                Some(snapshot)
            }
            None => {
                state.current = None;
                state.worker_running = false;
                None
            }
        }
    }

    fn merge_progress(&self, id: &str, update: &ProgressUpdate) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(current) = state.current.as_mut().filter(|c| c.id == id) {
            current.apply_progress(update);
        }
        if let Some(head) = state.queue.front_mut().filter(|h| h.id == id) {
            head.apply_progress(update);
        }
    }

    fn finish(&self, result: DownloadTask) {
        let mut guard = self.lock();
        let state = &mut *guard;

        match &result.status {
            TaskStatus::Failed { error } => {
                warn!("❌ 下载任务失败: {} ({}), 错误: {}", result.target.filename, result.id, error)
            }
            TaskStatus::Completed => info!("✅ 下载任务完成: {} ({})", result.target.filename, result.id),
            status => info!("📤 下载任务已提交: {} ({}), 状态: {}", result.target.filename, result.id, status.label()),
        }

        if state.queue.front().is_some_and(|h| h.id == result.id) {
            state.queue.pop_front();
        } else {
            warn!("⚠️ 任务已不在队列头部: {}", result.id);
        }
        state.recent.push(result);
        state.current = None;
    }

    // 执行崩溃：当前任务记为失败并移出队列
    fn abort_current(&self, message: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(mut task) = state.current.take() else {
            return;
        };
        task.mark_failed(message);

        if state.queue.front().is_some_and(|h| h.id == task.id) {
            state.queue.pop_front();
        }
        state.recent.push(task);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "下载执行时发生未知错误".to_string()
    }
}
