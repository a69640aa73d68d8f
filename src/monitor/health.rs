//! 健康检查
//!
//! 定时检查：
//! - 超过下载超时仍未结束的活动下载（只记录日志，不强制取消）
//! - 空闲时间超过阈值而队列非空时视为疑似死锁，每个空闲周期只告警一次
//!
//! 进度报告在另一个更长的间隔上触发

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::PipelineContext;

/// 单次检查结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub stuck: usize,
    pub active: usize,
    pub idle: Duration,
    pub deadlock_suspected: bool,
    /// 本次是否发出了告警
    pub alerted: bool,
}

/// 是否疑似死锁
pub fn deadlock_suspected(idle: Duration, max_idle: Duration, queue_len: usize) -> bool {
    idle > max_idle && queue_len > 0
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    /// 当前空闲周期是否已告警
    alerted: bool,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tick(&mut self, ctx: &PipelineContext) -> HealthReport {
        let idle = ctx.registry.idle_for();
        let stuck = ctx.registry.stuck(ctx.config.download.download_timeout());
        for (key, info) in &stuck {
            warn!(
                "检测到卡住的下载: {} ({}), 已持续 {}s",
                info.file_name,
                key,
                info.started_at.elapsed().as_secs()
            );
        }

        let active = ctx.registry.len();
        if active > 0 {
            info!("健康检查: {} 个活动下载, 空闲 {}s", active, idle.as_secs());
        }

        let max_idle = Duration::from_secs(ctx.config.health.max_idle_secs);
        let suspected = deadlock_suspected(idle, max_idle, ctx.queue.len());
        let mut alerted = false;
        if suspected && !self.alerted {
            let stats = ctx.ledger.get_stats();
            warn!("疑似死锁: 空闲 {}s, 队列 {} 个", idle.as_secs(), ctx.queue.len());
            let text = format!("⚠️ 健康警告: 疑似死锁！统计: {}", stats);
            match ctx.notifier.notify_admin(&text).await {
                Ok(()) => alerted = true,
                Err(e) => error!("发送健康告警失败: {}", e),
            }
            self.alerted = true;
        } else if !suspected {
            self.alerted = false;
        }

        HealthReport {
            stuck: stuck.len(),
            active,
            idle,
            deadlock_suspected: suspected,
            alerted,
        }
    }

    /// 启动健康检查与定期进度报告循环
    pub fn spawn(ctx: Arc<PipelineContext>) -> JoinHandle<()> {
        let check_period = Duration::from_secs(ctx.config.health.check_interval_secs.max(1));
        let report_period =
            Duration::from_secs(ctx.config.report.progress_report_interval_secs.max(1));
        tokio::spawn(async move {
            let mut monitor = HealthMonitor::new();
            let start = tokio::time::Instant::now();
            let mut check = tokio::time::interval_at(start + check_period, check_period);
            let mut report = tokio::time::interval_at(start + report_period, report_period);
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = check.tick() => {
                        monitor.tick(&ctx).await;
                    }
                    _ = report.tick() => {
                        ctx.reporter.check(&ctx, false).await;
                    }
                }
            }
            debug!("健康检查已退出");
        })
    }
}
