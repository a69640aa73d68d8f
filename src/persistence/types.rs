//! 进度账本数据类型

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::platform::{ChannelId, MessageId};

/// 进行中条目
///
/// 磁盘上有两种形态：
/// - 当前格式：`"123": 2`（直接存重试次数）
/// - 旧格式：`"123": {"retry_count": 2, "file_name": "..."}`
///
/// 加载时统一为本结构，保存时始终写出当前格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawInFlight", into = "u32")]
pub struct InFlightEntry {
    pub retry_count: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInFlight {
    Count(u32),
    Legacy {
        #[serde(default)]
        retry_count: u32,
    },
}

impl From<RawInFlight> for InFlightEntry {
    fn from(raw: RawInFlight) -> Self {
        let retry_count = match raw {
            RawInFlight::Count(n) => n,
            RawInFlight::Legacy { retry_count } => retry_count,
        };
        Self { retry_count }
    }
}

impl From<InFlightEntry> for u32 {
    fn from(entry: InFlightEntry) -> Self {
        entry.retry_count
    }
}

/// 单个频道的持久化进度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProgress {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub channel_name: String,
    /// 已确认完成的最大消息 ID（只增不减）
    #[serde(default)]
    pub last_message_id: MessageId,
    /// 进行中的消息 ID → 重试次数
    #[serde(default)]
    pub downloading: BTreeMap<MessageId, InFlightEntry>,
    #[serde(default)]
    pub completed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    /// 重试耗尽的消息 ID
    #[serde(default)]
    pub failed_ids: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// 消息在账本中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// 已完成（ID 不大于 last_message_id）
    Completed,
    /// 已入队或下载中
    InFlight { retry_count: u32 },
    /// 重试耗尽
    Failed,
    /// 从未见过
    Unknown,
}

impl FileStatus {
    /// 是否还需要下载
    pub fn is_actionable(&self, max_retries: u32) -> bool {
        match self {
            FileStatus::Completed | FileStatus::Failed => false,
            FileStatus::InFlight { retry_count } => *retry_count < max_retries,
            FileStatus::Unknown => true,
        }
    }
}

/// 下载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
}

/// 汇总统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
}

impl std::fmt::Display for LedgerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "总计 {}，完成 {}，失败 {}，进行中 {}",
            self.total, self.completed, self.failed, self.pending
        )
    }
}

/// 待重试条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingEntry {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub retry_count: u32,
}

impl ChannelProgress {
    /// 空记录
    pub fn empty(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            channel_name: String::new(),
            last_message_id: 0,
            downloading: BTreeMap::new(),
            completed_count: 0,
            failed_count: 0,
            failed_ids: Vec::new(),
            last_update: None,
        }
    }

    pub fn status(&self, message_id: MessageId) -> FileStatus {
        if let Some(entry) = self.downloading.get(&message_id) {
            return FileStatus::InFlight {
                retry_count: entry.retry_count,
            };
        }
        if self.failed_ids.contains(&message_id) {
            return FileStatus::Failed;
        }
        if message_id <= self.last_message_id {
            return FileStatus::Completed;
        }
        FileStatus::Unknown
    }

    /// 标记为进行中，保留已有重试次数
    ///
    /// 已完成或重试耗尽的消息不会重新进入进行中表，返回 false
    pub fn mark_started(&mut self, channel_name: &str, message_id: MessageId) -> bool {
        if !channel_name.is_empty() {
            self.channel_name = channel_name.to_string();
        }
        match self.status(message_id) {
            FileStatus::Completed | FileStatus::Failed => false,
            FileStatus::InFlight { .. } => true,
            FileStatus::Unknown => {
                self.downloading.insert(message_id, InFlightEntry::default());
                true
            }
        }
    }

    /// 记录成功
    pub fn mark_completed(&mut self, message_id: MessageId) {
        if self.downloading.remove(&message_id).is_some() {
            self.completed_count += 1;
            self.failed_ids.retain(|id| *id != message_id);
        }
        self.last_message_id = self.last_message_id.max(message_id);
    }

    /// 记录失败，返回记录后的状态
    pub fn mark_failed(&mut self, message_id: MessageId, max_retries: u32) -> FileStatus {
        if let Some(entry) = self.downloading.get_mut(&message_id) {
            entry.retry_count += 1;
            if entry.retry_count >= max_retries {
                self.downloading.remove(&message_id);
                self.failed_count += 1;
                if !self.failed_ids.contains(&message_id) {
                    self.failed_ids.push(message_id);
                }
            }
        }
        self.status(message_id)
    }

    pub fn display_name(&self) -> String {
        if self.channel_name.is_empty() {
            format!("ID_{}", self.channel_id)
        } else {
            self.channel_name.clone()
        }
    }

    /// 恢复起点：last_message_id 与进行中 ID 的最小值
    pub fn resume_start(&self) -> MessageId {
        self.downloading
            .keys()
            .next()
            .map(|first| (*first).min(self.last_message_id))
            .unwrap_or(self.last_message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_legacy_in_flight_shapes() {
        let json = r#"{
            "channel_id": -100123,
            "channel_name": "Test",
            "last_message_id": 10,
            "downloading": {
                "11": 1,
                "12": {"retry_count": 2, "file_name": "12 - a.mp4"},
                "13": {"file_name": "13 - b.mp4"}
            },
            "completed_count": 5
        }"#;
        let progress: ChannelProgress = serde_json::from_str(json).unwrap();
        assert_eq!(progress.downloading[&11].retry_count, 1);
        assert_eq!(progress.downloading[&12].retry_count, 2);
        assert_eq!(progress.downloading[&13].retry_count, 0);
        assert!(progress.failed_ids.is_empty());

        let saved = serde_json::to_value(&progress).unwrap();
        assert_eq!(saved["downloading"]["12"], serde_json::json!(2));
    }

    #[test]
    fn test_status_order() {
        let mut progress = ChannelProgress::empty(1);
        progress.last_message_id = 10;
        progress.failed_ids.push(7);
        progress.downloading.insert(5, InFlightEntry { retry_count: 1 });

        assert_eq!(progress.status(5), FileStatus::InFlight { retry_count: 1 });
        assert_eq!(progress.status(7), FileStatus::Failed);
        assert_eq!(progress.status(9), FileStatus::Completed);
        assert_eq!(progress.status(11), FileStatus::Unknown);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut progress = ChannelProgress::empty(1);
        assert!(progress.mark_started("c", 20));

        assert_eq!(progress.mark_failed(20, 3), FileStatus::InFlight { retry_count: 1 });
        assert_eq!(progress.mark_failed(20, 3), FileStatus::InFlight { retry_count: 2 });
        assert_eq!(progress.mark_failed(20, 3), FileStatus::Failed);
        assert_eq!(progress.failed_count, 1);
        assert_eq!(progress.failed_ids, vec![20]);

        // 已不在进行中，再次失败不重复计数
        assert_eq!(progress.mark_failed(20, 3), FileStatus::Failed);
        assert_eq!(progress.failed_count, 1);
        assert_eq!(progress.failed_ids, vec![20]);
        assert_eq!(progress.last_message_id, 0);
    }

    #[test]
    fn test_completed_never_reenters() {
        let mut progress = ChannelProgress::empty(1);
        progress.mark_started("c", 3);
        progress.mark_completed(3);
        assert_eq!(progress.completed_count, 1);
        assert!(!progress.mark_started("c", 3));
        assert!(progress.downloading.is_empty());
        // 未在进行中的完成不计数
        progress.mark_completed(3);
        assert_eq!(progress.completed_count, 1);
    }

    #[test]
    fn test_resume_start() {
        let mut progress = ChannelProgress::empty(1);
        assert_eq!(progress.resume_start(), 0);
        progress.last_message_id = 50;
        assert_eq!(progress.resume_start(), 50);
        progress.downloading.insert(42, InFlightEntry::default());
        progress.downloading.insert(60, InFlightEntry::default());
        assert_eq!(progress.resume_start(), 42);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(i64),
        Complete(i64),
        Fail(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..200).prop_map(Op::Start),
            (1i64..200).prop_map(Op::Complete),
            (1i64..200).prop_map(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn prop_last_message_id_monotonic(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let mut progress = ChannelProgress::empty(1);
            let mut previous = progress.last_message_id;
            let mut completed = progress.completed_count;
            let mut failed = progress.failed_count;
            for op in ops {
                match op {
                    Op::Start(id) => { progress.mark_started("c", id); }
                    Op::Complete(id) => progress.mark_completed(id),
                    Op::Fail(id) => { progress.mark_failed(id, 3); }
                }
                prop_assert!(progress.last_message_id >= previous);
                prop_assert!(progress.completed_count >= completed);
                prop_assert!(progress.failed_count >= failed);
                prop_assert!(progress.downloading.values().all(|e| e.retry_count < 3));
                previous = progress.last_message_id;
                completed = progress.completed_count;
                failed = progress.failed_count;
            }
        }
    }
}
