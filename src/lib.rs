// Media Harvester Library
// 频道媒体批量拉取流水线核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 错误分类
pub mod error;

// 消息平台抽象（外部协作方）
pub mod platform;

// 文件命名
pub mod naming;

// 进度账本（持久化）
pub mod persistence;

// 下载队列与工作池
pub mod downloader;

// 频道扫描
pub mod scanner;

// 断点恢复
pub mod resume;

// 周期性重扫
pub mod rescan;

// 白名单
pub mod whitelist;

// 新消息自动下载入口
pub mod listener;

// 健康检查与进度报告
pub mod monitor;

// 管理员命令
pub mod commands;

// 流水线上下文
pub mod context;

// 导出常用类型
pub use config::AppConfig;
pub use context::{Pipeline, PipelineContext};
pub use downloader::{ActiveDownloadRegistry, DownloadTask, WorkQueue, WorkerPool};
pub use error::{ErrorClass, PlatformError};
pub use persistence::{ChannelProgress, FileStatus, LedgerStats, ProgressLedger};
pub use platform::{Entity, EntityRef, Media, Message, MessagingPlatform, Notifier};
pub use whitelist::WhitelistController;
