//! 平台错误类型
//!
//! 拉取过程中遇到的错误分为四类：
//! - 可重试的瞬时错误（超时、媒体引用过期），消耗重试次数并重新入队
//! - 限流，按平台给出的时长等待后无条件重新入队，不消耗重试次数
//! - 永久错误（不支持的媒体），记一次失败，不再重新入队
//! - 运行错误（实体解析失败、文件系统等其他错误），记一次失败，留给恢复流程重试

use std::time::Duration;
use thiserror::Error;

/// 消息平台返回的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// 触发限流，需等待指定秒数
    #[error("触发限流，需等待 {seconds} 秒")]
    RateLimited { seconds: u64 },

    /// 媒体引用已过期，需要重新获取消息
    #[error("媒体引用已过期")]
    StaleMediaReference,

    /// 请求超时
    #[error("请求超时")]
    Timeout,

    /// 实体不存在或无法解析
    #[error("无法解析实体: {0}")]
    EntityNotFound(String),

    /// 不支持的媒体类型
    #[error("不支持的媒体类型: {0}")]
    UnsupportedMedia(String),

    /// 其他错误
    #[error("{0}")]
    Other(String),
}

/// 错误处理分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 瞬时错误，有限次重试
    Transient,
    /// 限流，等待后无条件重试
    RateLimited,
    /// 永久错误，不再重新入队
    Permanent,
    /// 运行错误，记录后由恢复流程重试
    Operational,
}

impl PlatformError {
    /// 获取错误分类
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::RateLimited { .. } => ErrorClass::RateLimited,
            PlatformError::StaleMediaReference | PlatformError::Timeout => ErrorClass::Transient,
            PlatformError::UnsupportedMedia(_) => ErrorClass::Permanent,
            PlatformError::EntityNotFound(_) | PlatformError::Other(_) => ErrorClass::Operational,
        }
    }

    /// 限流时平台要求的等待时长
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimited { seconds } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }
}
