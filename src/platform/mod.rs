//! 消息平台抽象
//!
//! 流水线只依赖以下能力，具体协议实现由外部提供：
//! - 按 ID / 用户名解析实体
//! - 惰性、可重启的历史消息迭代（按偏移与条数限定窗口）
//! - 带目标路径、进度回调和外部取消的媒体下载
//! - 向管理员发送文本通知

pub mod types;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::PlatformError;

pub use types::{ChannelId, Entity, EntityRef, Media, Message, MessageId, MessageQuery};

/// 下载进度回调：(已下载字节, 总字节)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 历史消息流
pub type MessageStream<'a> = BoxStream<'a, Result<Message, PlatformError>>;

/// 消息平台客户端
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    /// 解析实体
    async fn resolve_entity(&self, reference: &EntityRef) -> Result<Entity, PlatformError>;

    /// 迭代频道历史消息（按 ID 升序）
    fn iter_messages<'a>(&'a self, entity: &'a Entity, query: MessageQuery) -> MessageStream<'a>;

    /// 按 ID 获取单条消息
    async fn get_message(
        &self,
        entity: &Entity,
        message_id: MessageId,
    ) -> Result<Option<Message>, PlatformError>;

    /// 下载消息媒体到指定路径
    async fn download_media(
        &self,
        message: &Message,
        dest: &Path,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<(), PlatformError>;
}

/// 管理员通知通道（由机器人前端实现）
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_admin(&self, text: &str) -> Result<(), PlatformError>;
}
