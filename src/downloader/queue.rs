//! 工作队列
//!
//! 无界先进先出队列：生产者从不阻塞，工作者在队列为空时等待。
//! 入队时按 (频道, 消息) 去重，键从入队一直占用到工作者处理完毕并调用 `release`。

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Notify;
use tracing::debug;

use super::task::{DownloadKey, DownloadTask};

#[derive(Default)]
struct QueueInner {
    items: VecDeque<DownloadTask>,
    /// 排队中或处理中的任务键
    claimed: HashSet<DownloadKey>,
}

#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，同一任务已在排队或处理中时返回 false
    pub fn push(&self, task: DownloadTask) -> bool {
        let key = task.key();
        {
            let mut inner = self.inner.lock();
            if !inner.claimed.insert(key) {
                debug!("任务已在队列或处理中，跳过: {}", key);
                return false;
            }
            inner.items.push_back(task);
        }
        self.notify.notify_one();
        true
    }

    /// 非阻塞出队
    pub fn try_pop(&self) -> Option<DownloadTask> {
        let mut inner = self.inner.lock();
        let task = inner.items.pop_front();
        if task.is_some() && !inner.items.is_empty() {
            // 还有剩余任务，唤醒下一个等待者
            self.notify.notify_one();
        }
        task
    }

    /// 出队，队列为空时等待
    pub async fn pop(&self) -> DownloadTask {
        loop {
            if let Some(task) = self.try_pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// 处理完毕，释放任务键
    pub fn release(&self, key: &DownloadKey) {
        self.inner.lock().claimed.remove(key);
    }

    /// 排队中的任务数（不含处理中）
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// 是否已被占用（排队或处理中）
    pub fn is_claimed(&self, key: &DownloadKey) -> bool {
        self.inner.lock().claimed.contains(key)
    }
}
