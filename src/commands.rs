//! 管理员命令
//!
//! 由机器人前端把收到的文本交给 [`CommandHandler::handle`]，返回需要回复的文本。
//! 非管理员发送的消息和未知命令不回复。

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::platform::{ChannelId, EntityRef, MessageId};
use crate::resume::resume;
use crate::scanner::{ScanRequest, Scanner};

const HELP: &str = "机器人命令说明:\n\n\
/download <链接> [<起始ID>] [<结束ID>] 或 /dl - 开始下载\n\
/stats 或 /s - 查看统计\n\
/resume [<频道ID>] 或 /r - 恢复下载\n\n\
/whitelist_add <ID...> 或 /wa - 添加白名单\n\
/whitelist_list 或 /wl - 查看白名单\n\
/whitelist_remove <ID...> 或 /wr - 移除白名单\n\
/whitelist_clear 或 /wc - 清空白名单\n";

const DOWNLOAD_USAGE: &str = "/download <链接> [<起始ID>] [<结束ID>]";

/// 解析后的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Download {
        reference: EntityRef,
        start: MessageId,
        end: Option<MessageId>,
    },
    Stats,
    Resume(Option<ChannelId>),
    WhitelistAdd(Vec<i64>),
    WhitelistRemove(Vec<i64>),
    WhitelistClear,
    WhitelistList,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("未知命令: {0}")]
    Unknown(String),
    #[error("用法: {0}")]
    Usage(&'static str),
}

impl Command {
    /// 解析命令文本，接受可选的 `/` 前缀和 `@机器人名` 后缀
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let mut parts = text.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let name = head
            .strip_prefix('/')
            .unwrap_or(head)
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let args: Vec<&str> = parts.collect();

        let command = match name.as_str() {
            "start" | "help" => Command::Start,
            "download" | "dl" => {
                let reference = args
                    .first()
                    .map(|raw| EntityRef::parse(raw))
                    .ok_or(CommandError::Usage(DOWNLOAD_USAGE))?;
                let start = match args.get(1) {
                    Some(raw) => raw
                        .parse()
                        .map_err(|_| CommandError::Usage(DOWNLOAD_USAGE))?,
                    None => 0,
                };
                let end = match args.get(2) {
                    Some(raw) => Some(
                        raw.parse()
                            .map_err(|_| CommandError::Usage(DOWNLOAD_USAGE))?,
                    ),
                    None => None,
                };
                Command::Download {
                    reference,
                    start,
                    end,
                }
            }
            "stats" | "s" => Command::Stats,
            "resume" | "r" => Command::Resume(args.first().and_then(|raw| raw.parse().ok())),
            "whitelist_add" | "wa" => Command::WhitelistAdd(parse_ids(&args)),
            "whitelist_remove" | "wr" => Command::WhitelistRemove(parse_ids(&args)),
            "whitelist_clear" | "wc" => Command::WhitelistClear,
            "whitelist_list" | "wl" => Command::WhitelistList,
            _ => return Err(CommandError::Unknown(name)),
        };
        Ok(command)
    }
}

/// 从每个参数中提取第一个整数（允许负号）
fn parse_ids(args: &[&str]) -> Vec<i64> {
    args.iter().filter_map(|arg| first_integer(arg)).collect()
}

fn first_integer(text: &str) -> Option<i64> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(u8::is_ascii_digit)?;
    let end = bytes[start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(bytes.len(), |n| start + n);
    let negative = start > 0 && bytes[start - 1] == b'-';
    let from = if negative { start - 1 } else { start };
    text[from..end].parse().ok()
}

pub struct CommandHandler {
    ctx: Arc<PipelineContext>,
}

impl CommandHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    fn is_admin(&self, sender: i64) -> bool {
        self.ctx.config.platform.admin_ids.contains(&sender)
    }

    /// 处理一条文本消息，返回回复内容
    pub async fn handle(&self, sender: i64, text: &str) -> Option<String> {
        if !self.is_admin(sender) {
            return None;
        }
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(CommandError::Unknown(name)) => {
                info!("忽略未知命令: {}", name);
                return None;
            }
            Err(e) => return Some(e.to_string()),
        };
        info!("执行命令: {:?}", command);
        Some(self.execute(command).await)
    }

    async fn execute(&self, command: Command) -> String {
        let ctx = &self.ctx;
        match command {
            Command::Start => HELP.to_string(),
            Command::Download {
                reference,
                start,
                end,
            } => self.download(reference, start, end).await,
            Command::Stats => {
                let stats = ctx.ledger.get_stats();
                format!(
                    "📊 统计:\n记录: {} 完成，{} 失败，{} 进行中\n队列: {}\n活动: {}",
                    stats.completed,
                    stats.failed,
                    stats.pending,
                    ctx.queue.len(),
                    ctx.registry.len()
                )
            }
            Command::Resume(channel) => resume(ctx, channel).await.message,
            Command::WhitelistAdd(ids) => {
                let added = ctx.whitelist.add(&ids);
                if added.is_empty() {
                    "没有新增 ID".to_string()
                } else {
                    format!("已添加: {:?}", added)
                }
            }
            Command::WhitelistRemove(ids) => {
                let removed = ctx.whitelist.remove(&ids);
                if removed.is_empty() {
                    "没有移除任何 ID".to_string()
                } else {
                    format!("已移除: {:?}", removed)
                }
            }
            Command::WhitelistClear => {
                ctx.whitelist.clear();
                "白名单已清空".to_string()
            }
            Command::WhitelistList => format!("白名单: {:?}", ctx.whitelist.list()),
        }
    }

    async fn download(&self, reference: EntityRef, start: MessageId, end: Option<MessageId>) -> String {
        let ctx = &self.ctx;
        let entity = match ctx.platform.resolve_entity(&reference).await {
            Ok(entity) => entity,
            Err(e) => {
                warn!("解析频道失败: {}, 错误: {}", reference, e);
                return format!("错误: {}", e);
            }
        };

        let request = ScanRequest::from_offset(start).end_bound(end);
        let outcome = Scanner::new(ctx).scan(&entity, &entity.title, request).await;
        format!(
            "正在扫描 {}...\n已加入队列 {} 条消息",
            entity.title, outcome.queued
        )
    }
}
