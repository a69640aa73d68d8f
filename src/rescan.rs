//! 周期性重扫
//!
//! 不在实时监听范围内的频道靠重扫发现新消息：某频道自上次重扫以来新完成的数量
//! 达到阈值后，从 last_message_id 向后再扫描一批。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::PipelineContext;
use crate::platform::{ChannelId, EntityRef, MessageId};
use crate::scanner::{ScanRequest, Scanner};

/// 单个频道的重扫记录（仅内存，重启后重置）
#[derive(Debug, Clone)]
pub struct ScanState {
    pub last_scanned_id: MessageId,
    /// 上次重扫时的完成数
    pub last_completed_count: u64,
    pub last_scan_at: Instant,
}

#[derive(Default)]
pub struct RescanTrigger {
    states: HashMap<ChannelId, ScanState>,
}

impl RescanTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, channel_id: ChannelId) -> Option<&ScanState> {
        self.states.get(&channel_id)
    }

    /// 执行一轮检查，返回触发重扫的频道数
    pub async fn tick(&mut self, ctx: &PipelineContext) -> usize {
        let threshold = ctx.config.scan.rescan_batch_size;
        let scanner = Scanner::new(ctx);
        let mut triggered = 0;

        for progress in ctx.ledger.list_channels() {
            let state = self
                .states
                .entry(progress.channel_id)
                .or_insert_with(|| ScanState {
                    last_scanned_id: progress.last_message_id,
                    last_completed_count: 0,
                    last_scan_at: Instant::now(),
                });

            let completed_since = progress
                .completed_count
                .saturating_sub(state.last_completed_count);
            if completed_since < threshold {
                continue;
            }

            let entity = match ctx
                .platform
                .resolve_entity(&EntityRef::Id(progress.channel_id))
                .await
            {
                Ok(entity) => entity,
                Err(e) => {
                    warn!("重扫解析频道失败: {}, 错误: {}", progress.display_name(), e);
                    continue;
                }
            };

            info!(
                "[RESCAN] 触发重扫: {} (新完成 {})",
                progress.display_name(),
                completed_since
            );
            let request = ScanRequest::from_offset(progress.last_message_id)
                .limit(Some(ctx.config.scan.scan_batch_size));
            let outcome = scanner
                .scan(&entity, &progress.display_name(), request)
                .await;

            state.last_scanned_id = outcome.highest_seen;
            state.last_completed_count = progress.completed_count;
            state.last_scan_at = Instant::now();
            triggered += 1;
        }
        triggered
    }

    /// 启动后台重扫循环
    pub fn spawn(ctx: Arc<PipelineContext>) -> JoinHandle<()> {
        let period = Duration::from_secs(ctx.config.scan.rescan_interval_secs.max(1));
        tokio::spawn(async move {
            info!(
                "[RESCAN] 重扫任务已启动: 阈值 {}, 间隔 {:?}",
                ctx.config.scan.rescan_batch_size, period
            );
            let mut trigger = RescanTrigger::new();
            let mut interval = tokio::time::interval(period);
            // 跳过立即触发的第一次
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let triggered = trigger.tick(&ctx).await;
                        debug!("[RESCAN] 本轮触发 {} 个频道", triggered);
                    }
                }
            }
            debug!("[RESCAN] 重扫任务已退出");
        })
    }
}
