use std::fmt;
use std::path::{Path, PathBuf};

use crate::naming::channel_dir_name;
use crate::platform::{ChannelId, Entity, Message, MessageId};

/// 任务键（频道 + 消息）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadKey {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

impl DownloadKey {
    pub fn new(channel_id: ChannelId, message_id: MessageId) -> Self {
        Self {
            channel_id,
            message_id,
        }
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.channel_id, self.message_id)
    }
}

/// 下载任务
///
/// 仅存在于内存队列中，进度由账本负责持久化
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// 源消息
    pub message: Message,
    /// 所属频道
    pub channel: Entity,
    /// 频道显示名称
    pub channel_name: String,
    /// 目标文件名
    pub file_name: String,
}

impl DownloadTask {
    pub fn new(
        message: Message,
        channel: Entity,
        channel_name: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            message,
            channel,
            channel_name: channel_name.into(),
            file_name: file_name.into(),
        }
    }

    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(self.channel.id, self.message.id)
    }

    /// 频道目录名
    pub fn dir_name(&self) -> String {
        channel_dir_name(&self.channel_name, self.channel.id)
    }

    /// 按消息日期划分的月份目录（YYYY-MM）
    pub fn month_dir(&self) -> String {
        self.message.date.format("%Y-%m").to_string()
    }

    /// 保存目录：`{save_dir}/{频道目录}/{YYYY-MM}`
    pub fn save_dir(&self, root: &Path) -> PathBuf {
        root.join(self.dir_name()).join(self.month_dir())
    }

    /// 目标文件完整路径
    pub fn target_path(&self, root: &Path) -> PathBuf {
        self.save_dir(root).join(&self.file_name)
    }

    /// 用新获取的消息替换（媒体引用过期后）
    pub fn with_message(&self, message: Message) -> Self {
        Self {
            message,
            ..self.clone()
        }
    }
}
