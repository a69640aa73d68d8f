// 平台数据类型

use chrono::{DateTime, Utc};

/// 频道 ID（平台规范化后的数值 ID）
pub type ChannelId = i64;

/// 消息 ID
pub type MessageId = i64;

/// 实体引用（命令中给出的频道标识）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    /// 数值 ID
    Id(i64),
    /// 用户名或链接
    Handle(String),
}

impl EntityRef {
    /// 解析命令参数
    ///
    /// 纯数字（允许负号）视为 ID，其余原样作为用户名/链接交给平台解析
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<i64>() {
            Ok(id) => EntityRef::Id(id),
            Err(_) => EntityRef::Handle(raw.to_string()),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Id(id) => write!(f, "{}", id),
            EntityRef::Handle(handle) => write!(f, "{}", handle),
        }
    }
}

/// 已解析的实体（频道/群组）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// 规范 ID
    pub id: ChannelId,
    /// 显示名称
    pub title: String,
}

impl Entity {
    pub fn new(id: ChannelId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
        }
    }
}

/// 消息携带的媒体
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    /// 文档（视频、压缩包、贴纸等）
    Document {
        /// 文件名属性
        file_name: Option<String>,
        /// MIME 类型
        mime_type: String,
        /// 文件大小（字节）
        size: u64,
    },
    /// 图片
    Photo {
        /// 图片 ID
        id: i64,
        /// 最大尺寸版本的大小（字节）
        size: u64,
    },
    /// 网页预览
    WebPage,
    /// 其他不支持的类型
    Unsupported(String),
}

impl Media {
    /// 预期字节数，未知时为 0
    pub fn size(&self) -> u64 {
        match self {
            Media::Document { size, .. } => *size,
            Media::Photo { size, .. } => *size,
            Media::WebPage | Media::Unsupported(_) => 0,
        }
    }
}

/// 平台消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// 消息 ID
    pub id: MessageId,
    /// 所属会话 ID
    pub chat_id: ChannelId,
    /// 发送时间
    pub date: DateTime<Utc>,
    /// 文本 / 说明文字
    pub text: String,
    /// 相册分组 ID
    pub grouped_id: Option<i64>,
    /// 媒体
    pub media: Option<Media>,
}

impl Message {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn media_size(&self) -> u64 {
        self.media.as_ref().map(Media::size).unwrap_or(0)
    }
}

/// 历史消息查询窗口
///
/// 按 ID 升序返回 `id > offset_id` 的消息，最多 `limit` 条
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageQuery {
    /// 起始偏移（不含）
    pub offset_id: MessageId,
    /// 最多返回条数，None 表示直到频道最新消息
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn after(offset_id: MessageId) -> Self {
        Self {
            offset_id,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ref_parse() {
        assert_eq!(EntityRef::parse("123"), EntityRef::Id(123));
        assert_eq!(
            EntityRef::parse("-100123456789"),
            EntityRef::Id(-100123456789)
        );
        assert_eq!(
            EntityRef::parse("https://t.me/some_channel"),
            EntityRef::Handle("https://t.me/some_channel".to_string())
        );
    }

    #[test]
    fn test_media_size() {
        let doc = Media::Document {
            file_name: None,
            mime_type: "video/mp4".into(),
            size: 2048,
        };
        assert_eq!(doc.size(), 2048);
        assert_eq!(Media::WebPage.size(), 0);
    }
}
