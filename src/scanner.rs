//! 频道扫描
//!
//! 按 ID 升序遍历频道消息，把需要下载的媒体消息加入队列。扫描本身从不推进
//! 账本的 last_message_id，只返回看到的最大 ID 供调用方决定下一次扫描起点。

use futures::StreamExt;
use std::collections::HashSet;
use tracing::{debug, error, info};

use crate::context::PipelineContext;
use crate::downloader::DownloadTask;
use crate::platform::{Entity, Message, MessageId, MessageQuery};

/// 扫描参数
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// 起始偏移（不含）
    pub start_offset: MessageId,
    /// 超过此 ID 即停止
    pub end_bound: Option<MessageId>,
    /// 最多遍历的消息条数
    pub limit: Option<usize>,
    /// 额外跳过的消息 ID（已由调用方处理）
    pub skip: HashSet<MessageId>,
}

impl ScanRequest {
    pub fn from_offset(start_offset: MessageId) -> Self {
        Self {
            start_offset,
            ..Default::default()
        }
    }

    pub fn end_bound(mut self, end: Option<MessageId>) -> Self {
        self.end_bound = end;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn skip(mut self, skip: HashSet<MessageId>) -> Self {
        self.skip = skip;
        self
    }
}

/// 扫描结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// 新加入队列的任务数
    pub queued: usize,
    /// 看到的最大消息 ID（无论是否有媒体）
    pub highest_seen: MessageId,
    /// 遍历的消息条数
    pub scanned: usize,
}

pub struct Scanner<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> Scanner<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// 扫描频道
    ///
    /// 迭代出错时记录日志并返回已得到的部分结果
    pub async fn scan(&self, entity: &Entity, channel_name: &str, request: ScanRequest) -> ScanOutcome {
        let max_retries = self.ctx.ledger.max_retries();
        let mut outcome = ScanOutcome {
            highest_seen: request.start_offset,
            ..Default::default()
        };

        let query = MessageQuery::after(request.start_offset).with_limit(request.limit);
        let mut stream = self.ctx.platform.iter_messages(entity, query);
        while let Some(item) = stream.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    error!("扫描频道消息出错: {} ({}), 错误: {}", channel_name, entity.id, e);
                    break;
                }
            };

            outcome.scanned += 1;
            if request.end_bound.is_some_and(|end| message.id > end) {
                break;
            }
            outcome.highest_seen = outcome.highest_seen.max(message.id);

            if !message.has_media() || request.skip.contains(&message.id) {
                continue;
            }
            let status = self.ctx.ledger.get_status(entity.id, message.id);
            if !status.is_actionable(max_retries) {
                continue;
            }

            if self.enqueue_message(entity, channel_name, message).await {
                outcome.queued += 1;
            }
            if self.ctx.shutdown.is_cancelled() {
                break;
            }
        }

        info!(
            "扫描完成: {} ({}), 遍历 {} 条, 入队 {} 个, 最大 ID {}",
            channel_name, entity.id, outcome.scanned, outcome.queued, outcome.highest_seen
        );
        outcome
    }

    /// 生成文件名、记录进行中并入队
    pub async fn enqueue_message(&self, entity: &Entity, channel_name: &str, message: Message) -> bool {
        let Some(file_name) = self
            .ctx
            .namer
            .build(self.ctx.platform.as_ref(), entity, &message)
            .await
        else {
            debug!("跳过不支持的媒体: {} / {}", entity.id, message.id);
            return false;
        };

        if !self.ctx.ledger.record_start(entity.id, channel_name, message.id) {
            return false;
        }
        let task = DownloadTask::new(message, entity.clone(), channel_name, file_name);
        self.ctx.queue.push(task)
    }
}
