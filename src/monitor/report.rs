//! 进度报告节流器
//!
//! 控制发给管理员的进度报告频率：
//! 1. 批次刚结束（活动 → 空闲）时立即发送
//! 2. 活动期间只有在距上次发送超过最小间隔时才考虑发送，并且满足以下之一：
//!    小批次（总数低于阈值）、百分比前进了至少一个步长、调用方强制
//!
//! 决策逻辑是纯函数 [`ReportState::decide`]，与 I/O 无关，便于单独测试

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::ReportConfig;
use crate::context::PipelineContext;
use crate::downloader::ActiveDownloadInfo;
use crate::persistence::{ChannelProgress, LedgerStats};

/// 加权完成百分比
///
/// `(completed + failed + Σ活动下载完成比例) / total * 100`，向下取整。
/// total 为 0 时返回 -1（未知）；仍有活动时不超过 99
pub fn weighted_percent(stats: &LedgerStats, partial_progress: f64, is_active: bool) -> i64 {
    if stats.total == 0 {
        return -1;
    }
    let done = (stats.completed + stats.failed) as f64 + partial_progress;
    let percent = (done * 100.0 / stats.total as f64).floor() as i64;
    if is_active {
        percent.min(99)
    } else {
        percent
    }
}

/// 单次检查时观察到的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub is_active: bool,
    pub total: u64,
    pub percent: i64,
    pub force: bool,
}

/// 检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 发送；`finished` 表示批次刚结束
    Send { finished: bool },
    Suppress,
}

/// 节流状态
#[derive(Debug, Clone, Default)]
pub struct ReportState {
    pub was_active: bool,
    pub batch_started_at: Option<Instant>,
    /// 上次发送时间，None 视为已超过最小间隔
    pub last_sent: Option<Instant>,
    pub last_percent: i64,
    pub last_completed: u64,
    pub last_failed: u64,
}

impl ReportState {
    /// 根据观察到的状态决定是否发送
    ///
    /// # 参数
    /// * `config` - 报告配置（最小间隔、百分比步长、小批次阈值）
    /// * `obs` - 本次观察
    /// * `now` - 当前时间
    pub fn decide(&self, config: &ReportConfig, obs: &Observation, now: Instant) -> Decision {
        if !obs.is_active && self.was_active {
            return Decision::Send { finished: true };
        }
        if !obs.is_active {
            return Decision::Suppress;
        }

        let min_interval = Duration::from_secs(config.min_interval_secs);
        let interval_reached = self
            .last_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= min_interval);
        if !interval_reached {
            return Decision::Suppress;
        }

        let small_batch = obs.total < config.small_batch_threshold;
        let percent_jump = obs.percent >= self.last_percent + config.percent_step;
        if small_batch || percent_jump || obs.force {
            Decision::Send { finished: false }
        } else {
            Decision::Suppress
        }
    }
}

/// 报告渲染所需的数据
#[derive(Debug, Clone)]
pub struct ReportView {
    pub is_active: bool,
    pub percent: i64,
    pub stats: LedgerStats,
    pub queue_len: usize,
    pub active: Vec<ActiveDownloadInfo>,
    /// 批次刚结束时附带：(批次耗时, 各频道进度)
    pub summary: Option<(Duration, Vec<ChannelProgress>)>,
}

/// 生成报告文本
pub fn render_report(view: &ReportView) -> String {
    let icon = if view.is_active { "⏳" } else { "✅" };
    let percent = if view.percent >= 0 {
        format!(" ({}%)", view.percent)
    } else {
        String::new()
    };

    let mut report = format!("{} 进度报告{}\n", icon, percent);
    report.push_str(&format!(
        "总体: 完成 {}，失败 {}，总计 {}\n",
        view.stats.completed, view.stats.failed, view.stats.total
    ));
    report.push_str(&format!("队列: {} 个待处理\n", view.queue_len));
    report.push_str(&format!("活动: {} 个下载\n", view.active.len()));

    if !view.active.is_empty() {
        report.push_str("\n下载中:\n");
        for info in &view.active {
            let name: String = info.file_name.chars().take(30).collect();
            report.push_str(&format!("  • {}... {}%\n", name, info.percent()));
        }
    }

    if let Some((elapsed, channels)) = &view.summary {
        let mut channels: Vec<&ChannelProgress> = channels.iter().collect();
        channels.sort_by_key(|p| p.display_name());
        report.push_str(&format!("\n批次汇总 (耗时 {}s):\n", elapsed.as_secs()));
        for progress in channels.into_iter().filter(|p| p.completed_count > 0) {
            let name: String = progress.display_name().chars().take(20).collect();
            report.push_str(&format!("  • {}: {} 个完成\n", name, progress.completed_count));
        }
    }
    report
}

/// 进度报告节流器
///
/// 状态放在异步锁中，发送通知期间保持持有，避免并发检查重复发送
pub struct ReportThrottler {
    config: ReportConfig,
    state: Mutex<ReportState>,
}

impl ReportThrottler {
    pub fn new(config: ReportConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ReportState::default()),
        }
    }

    /// 用启动时的账本统计初始化，避免第一次检查误报
    pub async fn seed(&self, stats: &LedgerStats) {
        let mut state = self.state.lock().await;
        state.last_completed = stats.completed;
        state.last_failed = stats.failed;
        state.last_percent = weighted_percent(stats, 0.0, false);
    }

    pub async fn state(&self) -> ReportState {
        self.state.lock().await.clone()
    }

    /// 检查并按需发送报告，返回是否已发送
    pub async fn check(&self, ctx: &PipelineContext, force: bool) -> bool {
        let stats = ctx.ledger.get_stats();
        let is_active = !ctx.queue.is_empty() || !ctx.registry.is_empty();
        let percent = weighted_percent(&stats, ctx.registry.partial_progress(), is_active);
        let obs = Observation {
            is_active,
            total: stats.total,
            percent,
            force,
        };

        let mut state = self.state.lock().await;
        let now = Instant::now();
        if is_active && !state.was_active {
            state.batch_started_at = Some(now);
        }

        let finished = match state.decide(&self.config, &obs, now) {
            Decision::Send { finished } => finished,
            Decision::Suppress => {
                state.was_active = is_active;
                return false;
            }
        };

        let summary = if finished {
            let elapsed = state
                .batch_started_at
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default();
            Some((elapsed, ctx.ledger.list_channels()))
        } else {
            None
        };
        let view = ReportView {
            is_active,
            percent,
            stats,
            queue_len: ctx.queue.len(),
            active: ctx
                .registry
                .snapshot()
                .into_iter()
                .map(|(_, info)| info)
                .collect(),
            summary,
        };

        if let Err(e) = ctx.notifier.notify_admin(&render_report(&view)).await {
            error!("发送进度报告失败: {}", e);
            return false;
        }
        debug!("进度报告已发送: {}%", percent);

        state.last_completed = stats.completed;
        state.last_failed = stats.failed;
        state.last_percent = percent;
        state.was_active = is_active;
        state.last_sent = Some(now);
        true
    }
}
