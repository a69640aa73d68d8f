//! 进度账本
//!
//! 每个频道一个 JSON 文件 `channel_{id}.json`：
//! - 先写 `.tmp` 再原子重命名，读者不会看到写了一半的记录
//! - 每次 读取-修改-保存 都持有该频道的互斥锁
//! - I/O 错误只记录日志，不向流水线传播

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::types::{ChannelProgress, FileStatus, LedgerStats, Outcome, PendingEntry};
use crate::platform::{ChannelId, MessageId};

const FILE_PREFIX: &str = "channel_";
const FILE_SUFFIX: &str = ".json";

pub struct ProgressLedger {
    dir: PathBuf,
    max_retries: u32,
    /// 频道级互斥锁
    locks: DashMap<ChannelId, Arc<Mutex<()>>>,
}

impl ProgressLedger {
    pub fn new(dir: impl Into<PathBuf>, max_retries: u32) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("创建进度目录失败: {:?}, 错误: {}", dir, e);
        }
        Self {
            dir,
            max_retries,
            locks: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn record_path(&self, channel_id: ChannelId) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", FILE_PREFIX, channel_id, FILE_SUFFIX))
    }

    fn channel_lock(&self, channel_id: ChannelId) -> Arc<Mutex<()>> {
        self.locks
            .entry(channel_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 加载频道进度，不存在或损坏时返回空记录
    pub fn load(&self, channel_id: ChannelId) -> ChannelProgress {
        let path = self.record_path(channel_id);
        if !path.exists() {
            return ChannelProgress::empty(channel_id);
        }
        match read_record(&path) {
            Ok(progress) => progress,
            Err(e) => {
                error!("加载进度文件失败: {:?}, 错误: {}", path, e);
                ChannelProgress::empty(channel_id)
            }
        }
    }

    /// 保存频道进度（刷新 last_update）
    pub fn save(&self, progress: &mut ChannelProgress) {
        progress.last_update = Some(
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        );
        let path = self.record_path(progress.channel_id);
        if let Err(e) = write_record(&path, progress) {
            error!("保存进度文件失败: {:?}, 错误: {}", path, e);
        }
    }

    /// 持锁执行 读取-修改-保存
    fn update<R>(&self, channel_id: ChannelId, f: impl FnOnce(&mut ChannelProgress) -> R) -> R {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock();
        let mut progress = self.load(channel_id);
        let result = f(&mut progress);
        self.save(&mut progress);
        result
    }

    /// 记录消息进入队列（幂等，保留已有重试次数）
    ///
    /// 返回该消息是否处于进行中
    pub fn record_start(
        &self,
        channel_id: ChannelId,
        channel_name: &str,
        message_id: MessageId,
    ) -> bool {
        self.update(channel_id, |progress| {
            progress.mark_started(channel_name, message_id)
        })
    }

    /// 记录下载结果，返回记录后的状态
    pub fn record_complete(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        outcome: Outcome,
    ) -> FileStatus {
        let max_retries = self.max_retries;
        self.update(channel_id, |progress| match outcome {
            Outcome::Completed => {
                progress.mark_completed(message_id);
                debug!("记录完成: 频道={}, 消息={}", channel_id, message_id);
                progress.status(message_id)
            }
            Outcome::Failed(detail) => {
                let status = progress.mark_failed(message_id, max_retries);
                match status {
                    FileStatus::Failed => warn!(
                        "重试次数耗尽: 频道={}, 消息={}, 原因={}",
                        channel_id, message_id, detail
                    ),
                    _ => debug!(
                        "记录失败: 频道={}, 消息={}, 状态={:?}, 原因={}",
                        channel_id, message_id, status, detail
                    ),
                }
                status
            }
        })
    }

    pub fn get_status(&self, channel_id: ChannelId, message_id: MessageId) -> FileStatus {
        self.load(channel_id).status(message_id)
    }

    /// 所有频道记录
    pub fn list_channels(&self) -> Vec<ChannelProgress> {
        self.channel_ids()
            .into_iter()
            .filter_map(|id| {
                let path = self.record_path(id);
                match read_record(&path) {
                    Ok(progress) => Some(progress),
                    Err(e) => {
                        error!("读取进度文件失败: {:?}, 错误: {}", path, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// 扫描目录得到所有有记录的频道 ID（升序）
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("读取进度目录失败: {:?}, 错误: {}", self.dir, e);
                }
                return Vec::new();
            }
        };

        let mut ids: Vec<ChannelId> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_prefix(FILE_PREFIX)?
                    .strip_suffix(FILE_SUFFIX)?
                    .parse::<ChannelId>()
                    .ok()
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// 汇总统计
    ///
    /// 失败数取 failed_ids 长度，重试成功后会相应减少
    pub fn get_stats(&self) -> LedgerStats {
        let mut stats = LedgerStats::default();
        for progress in self.list_channels() {
            stats.completed += progress.completed_count;
            stats.failed += progress.failed_ids.len() as u64;
            stats.pending += progress.downloading.len() as u64;
        }
        stats.total = stats.completed + stats.failed + stats.pending;
        stats
    }

    /// 重试次数未耗尽的进行中条目，按 (频道, 消息) 排序
    pub fn list_pending(&self, channel_id: Option<ChannelId>) -> Vec<PendingEntry> {
        let mut pending: Vec<PendingEntry> = self
            .list_channels()
            .into_iter()
            .filter(|p| channel_id.map_or(true, |id| p.channel_id == id))
            .flat_map(|p| {
                let channel_id = p.channel_id;
                p.downloading
                    .into_iter()
                    .map(move |(message_id, entry)| PendingEntry {
                        channel_id,
                        message_id,
                        retry_count: entry.retry_count,
                    })
            })
            .filter(|entry| entry.retry_count < self.max_retries)
            .collect();
        pending.sort();
        pending
    }
}

fn read_record(path: &Path) -> io::Result<ChannelProgress> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse progress: {}", e),
        )
    })
}

fn write_record(path: &Path, progress: &ChannelProgress) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("json.tmp");
    let mut writer = BufWriter::new(File::create(&temp_path)?);
    serde_json::to_writer_pretty(&mut writer, progress).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize progress: {}", e),
        )
    })?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InFlightEntry;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ProgressLedger) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ProgressLedger::new(temp_dir.path().join("progress"), 3);
        (temp_dir, ledger)
    }

    #[test]
    fn test_load_missing_returns_empty() {
        let (_tmp, ledger) = setup();
        let progress = ledger.load(-1001);
        assert_eq!(progress, ChannelProgress::empty(-1001));
    }

    #[test]
    fn test_start_and_complete() {
        let (_tmp, ledger) = setup();
        assert!(ledger.record_start(-1001, "Chan", 5));
        assert!(ledger.record_start(-1001, "Chan", 5));
        assert_eq!(
            ledger.get_status(-1001, 5),
            FileStatus::InFlight { retry_count: 0 }
        );

        let status = ledger.record_complete(-1001, 5, Outcome::Completed);
        assert_eq!(status, FileStatus::Completed);

        let progress = ledger.load(-1001);
        assert_eq!(progress.channel_name, "Chan");
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.last_message_id, 5);
        assert!(progress.downloading.is_empty());
        assert!(progress.last_update.is_some());
        assert!(!ledger.record_path(-1001).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_record_start_preserves_retry_count() {
        let (_tmp, ledger) = setup();
        ledger.record_start(1, "c", 9);
        ledger.record_complete(1, 9, Outcome::Failed("timeout".into()));
        ledger.record_start(1, "c", 9);
        assert_eq!(ledger.get_status(1, 9), FileStatus::InFlight { retry_count: 1 });
    }

    #[test]
    fn test_failure_ceiling_and_successful_retry() {
        let (_tmp, ledger) = setup();
        ledger.record_start(1, "c", 30);
        for _ in 0..3 {
            ledger.record_complete(1, 30, Outcome::Failed("boom".into()));
        }
        assert_eq!(ledger.get_status(1, 30), FileStatus::Failed);
        let stats = ledger.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);

        // 失败表中的消息被手动重新入队并成功
        let mut progress = ledger.load(1);
        progress.downloading.insert(30, InFlightEntry::default());
        ledger.save(&mut progress);
        ledger.record_complete(1, 30, Outcome::Completed);

        let progress = ledger.load(1);
        assert!(progress.failed_ids.is_empty());
        assert_eq!(progress.failed_count, 1);
        assert_eq!(ledger.get_stats().failed, 0);
    }

    #[test]
    fn test_corrupt_record_falls_back_to_empty() {
        let (_tmp, ledger) = setup();
        fs::write(ledger.record_path(77), "{not json").unwrap();
        assert_eq!(ledger.load(77), ChannelProgress::empty(77));
        assert!(ledger.list_channels().is_empty());
        assert_eq!(ledger.get_stats(), LedgerStats::default());
    }

    #[test]
    fn test_write_errors_are_swallowed() {
        let temp_dir = TempDir::new().unwrap();
        // 进度目录的位置被普通文件占用，所有写入都会失败
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let ledger = ProgressLedger::new(blocker.clone(), 3);

        assert!(ledger.record_start(5, "blocked", 1));
        ledger.record_complete(5, 1, Outcome::Completed);
        ledger.record_complete(5, 2, Outcome::Failed("x".into()));
        assert_eq!(ledger.load(5), ChannelProgress::empty(5));
        assert_eq!(ledger.get_stats(), LedgerStats::default());
    }

    #[test]
    fn test_record_path_occupied_by_directory() {
        let (_tmp, ledger) = setup();
        fs::create_dir_all(ledger.record_path(6)).unwrap();

        ledger.record_start(6, "dir", 1);
        ledger.record_complete(6, 1, Outcome::Completed);
        assert_eq!(ledger.load(6), ChannelProgress::empty(6));
    }

    #[test]
    fn test_stats_and_pending_across_channels() {
        let (_tmp, ledger) = setup();
        ledger.record_start(2, "b", 4);
        ledger.record_start(2, "b", 1);
        ledger.record_start(1, "a", 8);
        ledger.record_start(1, "a", 9);
        ledger.record_complete(1, 9, Outcome::Completed);
        fs::write(ledger.dir().join("notes.txt"), "x").unwrap();

        assert_eq!(ledger.channel_ids(), vec![1, 2]);

        let stats = ledger.get_stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.total, 4);

        let pending: Vec<(i64, i64)> = ledger
            .list_pending(None)
            .into_iter()
            .map(|p| (p.channel_id, p.message_id))
            .collect();
        assert_eq!(pending, vec![(1, 8), (2, 1), (2, 4)]);
        assert_eq!(ledger.list_pending(Some(2)).len(), 2);
    }

    #[test]
    fn test_concurrent_updates_same_channel() {
        let (_tmp, ledger) = setup();
        let ledger = Arc::new(ledger);
        for id in 1..=20 {
            ledger.record_start(5, "c", id);
        }

        let handles: Vec<_> = (1..=20)
            .map(|id| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger.record_complete(5, id, Outcome::Completed);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let progress = ledger.load(5);
        assert_eq!(progress.completed_count, 20);
        assert_eq!(progress.last_message_id, 20);
        assert!(progress.downloading.is_empty());
    }
}
