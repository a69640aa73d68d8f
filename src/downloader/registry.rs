//! 活动下载登记表
//!
//! 记录正在下载的文件及字节进度，供健康检查和进度报告读取。同时维护最近一次下载活动时间。

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::task::DownloadKey;

/// 活动下载信息
#[derive(Debug, Clone)]
pub struct ActiveDownloadInfo {
    pub file_name: String,
    pub started_at: Instant,
    /// 预期字节数，未知为 0
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

impl ActiveDownloadInfo {
    /// 完成比例（0.0 ~ 1.0），大小未知时为 None
    pub fn fraction(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some((self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0))
    }

    pub fn percent(&self) -> u64 {
        self.fraction().map(|f| (f * 100.0) as u64).unwrap_or(0)
    }
}

pub struct ActiveDownloadRegistry {
    entries: DashMap<DownloadKey, ActiveDownloadInfo>,
    last_activity: Mutex<Instant>,
}

impl Default for ActiveDownloadRegistry {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            last_activity: Mutex::new(Instant::now()),
        }
    }
}

impl ActiveDownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, key: DownloadKey, file_name: &str, total_bytes: u64) {
        self.entries.insert(
            key,
            ActiveDownloadInfo {
                file_name: file_name.to_string(),
                started_at: Instant::now(),
                total_bytes,
                downloaded_bytes: 0,
            },
        );
    }

    /// 进度回调，条目已移除时忽略
    pub fn update_progress(&self, key: &DownloadKey, downloaded: u64, total: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.downloaded_bytes = downloaded;
            if entry.total_bytes == 0 && total > 0 {
                entry.total_bytes = total;
            }
        }
    }

    pub fn finish(&self, key: &DownloadKey) -> Option<ActiveDownloadInfo> {
        self.entries.remove(key).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 快照（按开始时间排序）
    pub fn snapshot(&self) -> Vec<(DownloadKey, ActiveDownloadInfo)> {
        let mut items: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        items.sort_by_key(|(key, info)| (info.started_at, *key));
        items
    }

    /// 所有活动下载的完成比例之和
    pub fn partial_progress(&self) -> f64 {
        self.entries
            .iter()
            .filter_map(|entry| entry.value().fraction())
            .sum()
    }

    /// 超过给定时长仍未结束的下载
    pub fn stuck(&self, limit: Duration) -> Vec<(DownloadKey, ActiveDownloadInfo)> {
        self.snapshot()
            .into_iter()
            .filter(|(_, info)| info.started_at.elapsed() > limit)
            .collect()
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}
