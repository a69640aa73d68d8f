//! 断点恢复
//!
//! 对每个有进度记录的频道：
//! 1. 按 ID 重新获取所有进行中的消息并入队
//! 2. 从 min(last_message_id, 进行中最小 ID) 前一条开始向后扫描一批

use std::collections::HashSet;
use tracing::{error, info, warn};

use crate::context::PipelineContext;
use crate::platform::{ChannelId, EntityRef};
use crate::scanner::{ScanRequest, Scanner};

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeSummary {
    /// 参与恢复的频道数
    pub channels: usize,
    /// 加入队列的任务数
    pub added: usize,
    /// 可读摘要
    pub message: String,
}

/// 恢复下载，可限定单个频道
pub async fn resume(ctx: &PipelineContext, channel: Option<ChannelId>) -> ResumeSummary {
    let records = ctx.ledger.list_channels();
    if records.is_empty() {
        return ResumeSummary {
            channels: 0,
            added: 0,
            message: "没有找到进度记录".to_string(),
        };
    }

    let candidates: Vec<(ChannelId, String)> = records
        .iter()
        .filter(|p| channel.map_or(true, |id| p.channel_id == id))
        .filter(|p| p.resume_start() > 0 || !p.downloading.is_empty())
        .map(|p| (p.channel_id, p.display_name()))
        .collect();
    if candidates.is_empty() {
        return ResumeSummary {
            channels: 0,
            added: 0,
            message: "没有可恢复的频道".to_string(),
        };
    }

    let scanner = Scanner::new(ctx);
    let mut added = 0;
    for (channel_id, name) in &candidates {
        let entity = match ctx.platform.resolve_entity(&EntityRef::Id(*channel_id)).await {
            Ok(entity) => entity,
            Err(e) => {
                error!("恢复频道失败: {} ({}), 错误: {}", name, channel_id, e);
                continue;
            }
        };

        let progress = ctx.ledger.load(*channel_id);
        let start = progress.resume_start();
        let in_flight: Vec<i64> = progress.downloading.keys().copied().collect();

        for message_id in &in_flight {
            match ctx.platform.get_message(&entity, *message_id).await {
                Ok(Some(message)) if message.has_media() => {
                    if scanner.enqueue_message(&entity, &entity.title, message).await {
                        added += 1;
                    }
                }
                Ok(_) => warn!("进行中的消息已不存在或无媒体: {} / {}", channel_id, message_id),
                Err(e) => warn!("获取消息失败: {} / {}, 错误: {}", channel_id, message_id, e),
            }
        }

        let request = ScanRequest::from_offset((start - 1).max(0))
            .limit(Some(ctx.config.scan.scan_batch_size))
            .skip(in_flight.into_iter().collect::<HashSet<_>>());
        let outcome = scanner.scan(&entity, &entity.title, request).await;
        added += outcome.queued;
    }

    let message = format!(
        "已恢复 {} 个频道，{} 个文件加入队列",
        candidates.len(),
        added
    );
    info!("{}", message);
    ResumeSummary {
        channels: candidates.len(),
        added,
        message,
    }
}
