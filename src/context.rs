//! 流水线上下文
//!
//! 所有组件共享的状态都集中在 [`PipelineContext`] 中，通过 `Arc` 显式传递。
//! 构造顺序：配置 → 账本 → 队列/登记表 → 白名单 → 报告节流器 → 后台任务。

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::commands::CommandHandler;
use crate::config::AppConfig;
use crate::downloader::{
    ActiveDownloadRegistry, Archiver, RcloneArchiver, WorkQueue, WorkerPool,
};
use crate::monitor::{HealthMonitor, ReportThrottler};
use crate::naming::FileNamer;
use crate::persistence::ProgressLedger;
use crate::platform::{MessagingPlatform, Notifier};
use crate::rescan::RescanTrigger;
use crate::resume::resume;
use crate::whitelist::{ListenerRegistrar, WhitelistController};

/// 共享状态
pub struct PipelineContext {
    pub config: AppConfig,
    pub platform: Arc<dyn MessagingPlatform>,
    pub notifier: Arc<dyn Notifier>,
    /// 下载完成后的归档（未启用时为 None）
    pub archiver: Option<Arc<dyn Archiver>>,
    pub ledger: ProgressLedger,
    pub queue: WorkQueue,
    pub registry: ActiveDownloadRegistry,
    pub whitelist: WhitelistController,
    pub reporter: ReportThrottler,
    pub namer: FileNamer,
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    pub fn new(
        config: AppConfig,
        platform: Arc<dyn MessagingPlatform>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let archiver: Option<Arc<dyn Archiver>> = if config.archive.is_active() {
            Some(Arc::new(RcloneArchiver::new(
                &config.archive,
                config.download.download_timeout(),
            )))
        } else {
            None
        };

        Self {
            ledger: ProgressLedger::new(
                &config.persistence.progress_dir,
                config.download.max_retries,
            ),
            queue: WorkQueue::new(),
            registry: ActiveDownloadRegistry::new(),
            whitelist: WhitelistController::from_config(&config.whitelist),
            reporter: ReportThrottler::new(config.report.clone()),
            namer: FileNamer::new(config.download.filter_words.clone()),
            shutdown: CancellationToken::new(),
            archiver,
            platform,
            notifier,
            config,
        }
    }

    pub fn with_archiver(mut self, archiver: Option<Arc<dyn Archiver>>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_listener_registrar(mut self, registrar: Arc<dyn ListenerRegistrar>) -> Self {
        self.whitelist = self.whitelist.with_registrar(registrar);
        self
    }
}

/// 运行中的流水线
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    workers: WorkerPool,
    background: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// 启动流水线
    ///
    /// 1. 初始化白名单（download_all → 初始 ID → 文件）
    /// 2. 用账本统计初始化报告节流器
    /// 3. 启动工作者、重扫、健康检查和白名单监视
    /// 4. 按配置自动恢复
    pub async fn start(ctx: Arc<PipelineContext>) -> Result<Self> {
        let config = &ctx.config;
        tokio::fs::create_dir_all(&config.download.save_dir)
            .await
            .with_context(|| format!("Failed to create save dir: {:?}", config.download.save_dir))?;

        ctx.whitelist.initialize(&config.whitelist.initial_ids);
        let stats = ctx.ledger.get_stats();
        ctx.reporter.seed(&stats).await;
        info!("账本统计: {}", stats);

        let workers = WorkerPool::spawn(ctx.clone(), config.effective_concurrency());
        let background = vec![
            RescanTrigger::spawn(ctx.clone()),
            HealthMonitor::spawn(ctx.clone()),
            spawn_whitelist_watch(&ctx),
        ];

        if config.download.auto_resume {
            let summary = resume(&ctx, None).await;
            info!("自动恢复: {}", summary.message);
        }

        info!("✓ 流水线已启动");
        Ok(Self {
            ctx,
            workers,
            background,
        })
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn command_handler(&self) -> CommandHandler {
        CommandHandler::new(self.ctx.clone())
    }

    /// 停止所有后台任务并等待退出
    pub async fn shutdown(self) {
        info!("正在关闭流水线...");
        self.ctx.shutdown.cancel();
        self.workers.join().await;
        for handle in self.background {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {}", e);
            }
        }
        info!("✓ 流水线已关闭");
    }
}

fn spawn_whitelist_watch(ctx: &Arc<PipelineContext>) -> JoinHandle<()> {
    let ctx = ctx.clone();
    let period = Duration::from_secs(ctx.config.whitelist.poll_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    ctx.whitelist.reload_if_changed();
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::platform::fake::{FakeNotifier, FakePlatform};
    use tempfile::TempDir;

    /// 目录全部放在临时目录中的上下文
    pub fn test_context(
        platform: Arc<FakePlatform>,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> (TempDir, Arc<PipelineContext>, Arc<FakeNotifier>) {
        test_context_with(platform, tweak, None)
    }

    pub fn test_context_with(
        platform: Arc<FakePlatform>,
        tweak: impl FnOnce(&mut AppConfig),
        archiver: Option<Arc<dyn Archiver>>,
    ) -> (TempDir, Arc<PipelineContext>, Arc<FakeNotifier>) {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.download.save_dir = tmp.path().join("downloads");
        config.persistence.progress_dir = tmp.path().join("progress");
        config.whitelist.file = tmp.path().join("whitelist.txt");
        config.log.enabled = false;
        tweak(&mut config);

        let notifier = Arc::new(FakeNotifier::default());
        let ctx = PipelineContext::new(config, platform, notifier.clone()).with_archiver(archiver);
        (tmp, Arc::new(ctx), notifier)
    }
}
