use std::collections::VecDeque;

use super::task::{DownloadTask, TaskStatus};

/// 最近任务列表，最新的在前，按 ID 去重，超出容量淘汰最旧的
#[derive(Debug, Clone)]
pub struct RecentHistory {
    entries: VecDeque<DownloadTask>,
    capacity: usize,
}

impl RecentHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, mut task: DownloadTask) {
        if task.status == TaskStatus::Completed {
            task.progress = 100.0;
        }
        self.entries.retain(|t| t.id != task.id);
        self.entries.push_front(task);
        self.entries.truncate(self.capacity);
    }

    pub fn get(&self, id: &str) -> Option<&DownloadTask> {
        self.entries.iter().find(|t| t.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<DownloadTask> {
        let index = self.entries.iter().position(|t| t.id == id)?;
        self.entries.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DownloadTask> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DownloadTask> {
        self.entries.iter_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
