//! 下载工作者
//!
//! N 个工作者共享同一个队列。单个任务的处理流程：
//! 1. 文件后缀过滤
//! 2. 查询账本状态，已完成或重试耗尽则丢弃
//! 3. 创建 `{save_dir}/{频道}/{YYYY-MM}` 目录
//! 4. 目标文件已存在：进行中则视为残留并删除，否则直接记为完成
//! 5. 登记活动下载
//! 6. 带超时下载，进度回调更新登记表
//! 7. 成功后可选归档
//! 8. 按错误类型更新账本 / 重新入队
//! 9. 移除登记、刷新活动时间、触发一次进度报告检查

use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::archive::archive_and_cleanup;
use super::task::DownloadTask;
use crate::context::PipelineContext;
use crate::error::{ErrorClass, PlatformError};
use crate::naming::{bytes_to_string, is_filtered_type};
use crate::persistence::{FileStatus, Outcome};
use crate::platform::{MessageQuery, ProgressCallback};

/// 单个任务的处理结果
#[derive(Debug)]
pub enum TaskEnd {
    /// 未发起下载即丢弃（过滤、已完成、已存在）
    Skipped,
    /// 已尝试下载，可能需要重新入队
    Attempted { requeue: Option<DownloadTask> },
}

/// 工作者池
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// 启动 `size` 个工作者，随上下文的关闭令牌退出
    pub fn spawn(ctx: Arc<PipelineContext>, size: usize) -> Self {
        let handles = (0..size)
            .map(|i| {
                let ctx = ctx.clone();
                let name = format!("Worker-{}", i);
                tokio::spawn(run_worker(name, ctx))
            })
            .collect();
        info!("✓ 下载工作者已启动: {} 个", size);
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 等待所有工作者退出
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("工作者异常退出: {}", e);
            }
        }
    }
}

async fn run_worker(name: String, ctx: Arc<PipelineContext>) {
    debug!("[{}] 已启动", name);
    loop {
        let task = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            task = ctx.queue.pop() => task,
        };

        let key = task.key();
        let end = process_task(&name, &ctx, task).await;
        ctx.queue.release(&key);

        if let TaskEnd::Attempted { requeue } = end {
            if let Some(next) = requeue {
                if !ctx.queue.push(next) {
                    debug!("[{}] 重新入队被去重: {}", name, key);
                }
            }
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.reporter.check(&ctx, true).await;
            });
        }
    }
    debug!("[{}] 已退出", name);
}

/// 处理单个任务
pub async fn process_task(name: &str, ctx: &Arc<PipelineContext>, task: DownloadTask) -> TaskEnd {
    let download = &ctx.config.download;
    let key = task.key();

    if is_filtered_type(&task.file_name, &download.filter_file_types) {
        info!("[{}] 跳过过滤类型文件: {}", name, task.file_name);
        return TaskEnd::Skipped;
    }

    let status = ctx.ledger.get_status(key.channel_id, key.message_id);
    if !status.is_actionable(download.max_retries) {
        debug!("[{}] 跳过 {}: {:?}", name, key, status);
        return TaskEnd::Skipped;
    }

    let save_dir = task.save_dir(&download.save_dir);
    if let Err(e) = tokio::fs::create_dir_all(&save_dir).await {
        error!("[{}] 创建目录失败: {:?}, 错误: {}", name, save_dir, e);
        return TaskEnd::Skipped;
    }

    let path = save_dir.join(&task.file_name);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        if let FileStatus::InFlight { .. } = status {
            debug!("[{}] 删除残留文件: {:?}", name, path);
            remove_partial(&path).await;
        } else {
            info!("[{}] 文件已存在，记为完成: {}", name, task.file_name);
            ctx.ledger
                .record_complete(key.channel_id, key.message_id, Outcome::Completed);
            return TaskEnd::Skipped;
        }
    }

    ctx.ledger
        .record_start(key.channel_id, &task.channel_name, key.message_id);
    let total = task.message.media_size();
    ctx.registry.begin(key, &task.file_name, total);
    ctx.registry.touch_activity();
    info!(
        "[{}] 开始下载: {} - {} ({})",
        name,
        task.channel_name,
        task.file_name,
        bytes_to_string(total)
    );

    let mut result = fetch(ctx, &task, &path, download.download_timeout()).await;
    if result.is_ok() && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        result = Err(PlatformError::Other("下载后文件不存在".to_string()));
    }

    let requeue = match result {
        Ok(()) => {
            info!("[{}] 下载完成: {}", name, task.file_name);
            if let Some(archiver) = ctx.archiver.as_deref() {
                archive_and_cleanup(archiver, &path, &task.dir_name(), &task.month_dir()).await;
            }
            ctx.ledger
                .record_complete(key.channel_id, key.message_id, Outcome::Completed);
            None
        }
        Err(err) => {
            remove_partial(&path).await;
            handle_failure(name, ctx, task, err).await
        }
    };

    // 限流等待期间仍保持登记，避免被判定为批次结束
    ctx.registry.finish(&key);
    ctx.registry.touch_activity();

    TaskEnd::Attempted { requeue }
}

async fn fetch(
    ctx: &Arc<PipelineContext>,
    task: &DownloadTask,
    path: &Path,
    timeout: Duration,
) -> Result<(), PlatformError> {
    let key = task.key();
    let cancel = ctx.shutdown.child_token();
    let progress: ProgressCallback = {
        let ctx = ctx.clone();
        Arc::new(move |downloaded, total| ctx.registry.update_progress(&key, downloaded, total))
    };

    let download = ctx
        .platform
        .download_media(&task.message, path, progress, cancel.clone());
    match tokio::time::timeout(timeout, download).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(PlatformError::Timeout)
        }
    }
}

/// 按错误类型处理失败，返回需要重新入队的任务
async fn handle_failure(
    name: &str,
    ctx: &Arc<PipelineContext>,
    task: DownloadTask,
    err: PlatformError,
) -> Option<DownloadTask> {
    let key = task.key();
    match err.class() {
        ErrorClass::RateLimited => {
            let wait = err
                .retry_after()
                .unwrap_or_default()
                .min(ctx.config.download.rate_limit_cap());
            warn!(
                "[{}] 触发限流，等待 {:?} 后重新入队: {}",
                name, wait, task.file_name
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => Some(task),
                _ = ctx.shutdown.cancelled() => None,
            }
        }
        ErrorClass::Transient => {
            let status = ctx.ledger.record_complete(
                key.channel_id,
                key.message_id,
                Outcome::Failed(err.to_string()),
            );
            warn!("[{}] {}: {} ({:?})", name, err, task.file_name, status);
            if !matches!(status, FileStatus::InFlight { .. }) {
                return None;
            }
            if err == PlatformError::StaleMediaReference {
                refresh_task(ctx, &task).await
            } else {
                Some(task)
            }
        }
        ErrorClass::Permanent | ErrorClass::Operational => {
            error!("[{}] 下载失败: {} - {}", name, task.file_name, err);
            ctx.ledger.record_complete(
                key.channel_id,
                key.message_id,
                Outcome::Failed(err.to_string()),
            );
            None
        }
    }
}

/// 重新获取该位置的消息以刷新媒体引用
async fn refresh_task(ctx: &PipelineContext, task: &DownloadTask) -> Option<DownloadTask> {
    let query = MessageQuery::after(task.message.id - 1).with_limit(Some(1));
    let mut stream = ctx.platform.iter_messages(&task.channel, query);
    match stream.next().await {
        Some(Ok(message)) if message.id == task.message.id => Some(task.with_message(message)),
        Some(Ok(message)) => {
            info!(
                "原消息已不存在，放弃: {} (下一条为 {})",
                task.key(),
                message.id
            );
            None
        }
        Some(Err(e)) => {
            warn!("刷新消息失败: {}, 错误: {}", task.key(), e);
            None
        }
        None => None,
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除文件失败: {:?}, 错误: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{test_context, test_context_with};
    use crate::downloader::archive::tests::RecordingArchiver;
    use crate::downloader::Archiver;
    use crate::platform::fake::{media_message, FakeFetch, FakePlatform};
    use crate::platform::Entity;

    const CHANNEL: i64 = -100555;

    fn setup_platform(ids: &[i64]) -> Arc<FakePlatform> {
        let platform = Arc::new(FakePlatform::new());
        platform.add_channel(CHANNEL, "Media Chan", None);
        for id in ids {
            platform.add_message(media_message(CHANNEL, *id, 1000));
        }
        platform
    }

    fn task_for(id: i64) -> DownloadTask {
        DownloadTask::new(
            media_message(CHANNEL, id, 1000),
            Entity::new(CHANNEL, "Media Chan"),
            "Media Chan",
            format!("{} - file_{}.bin", id, id),
        )
    }

    #[tokio::test]
    async fn test_success_records_completion() {
        let platform = setup_platform(&[1]);
        let (_tmp, ctx, _) = test_context(platform.clone(), |_| {});
        let task = task_for(1);
        let path = task.target_path(&ctx.config.download.save_dir);
        ctx.ledger.record_start(CHANNEL, "Media Chan", 1);

        let end = process_task("W", &ctx, task).await;
        assert!(matches!(end, TaskEnd::Attempted { requeue: None }));
        assert!(path.exists());
        assert!(ctx.registry.is_empty());

        let progress = ctx.ledger.load(CHANNEL);
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.last_message_id, 1);
        assert!(progress.downloading.is_empty());
    }

    #[tokio::test]
    async fn test_filtered_and_completed_are_skipped() {
        let platform = setup_platform(&[1, 2]);
        let (_tmp, ctx, _) = test_context(platform.clone(), |c| {
            c.download.filter_file_types = vec![".bin".to_string()];
        });
        let end = process_task("W", &ctx, task_for(1)).await;
        assert!(matches!(end, TaskEnd::Skipped));
        assert!(platform.download_calls().is_empty());

        let platform = setup_platform(&[5]);
        let (_tmp2, ctx, _) = test_context(platform.clone(), |_| {});
        ctx.ledger.record_start(CHANNEL, "Media Chan", 5);
        ctx.ledger.record_complete(CHANNEL, 5, Outcome::Completed);
        let end = process_task("W", &ctx, task_for(5)).await;
        assert!(matches!(end, TaskEnd::Skipped));
        assert!(platform.download_calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_file_handling() {
        let platform = setup_platform(&[3, 4]);
        let (_tmp, ctx, _) = test_context(platform.clone(), |_| {});

        // 账本不认识但文件已存在：直接记为完成
        let done = task_for(3);
        let path = done.target_path(&ctx.config.download.save_dir);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"old").unwrap();
        assert!(matches!(process_task("W", &ctx, done).await, TaskEnd::Skipped));
        assert_eq!(ctx.ledger.get_status(CHANNEL, 3), FileStatus::Completed);

        // 进行中的残留文件被删除后重新下载
        let partial = task_for(4);
        let path = partial.target_path(&ctx.config.download.save_dir);
        std::fs::write(&path, b"partial").unwrap();
        ctx.ledger.record_start(CHANNEL, "Media Chan", 4);
        process_task("W", &ctx, partial).await;
        assert_eq!(std::fs::read(&path).unwrap(), b"media-bytes");
        assert_eq!(platform.download_calls(), vec![(CHANNEL, 4)]);
    }

    #[tokio::test]
    async fn test_rate_limit_requeues_without_consuming_retry() {
        let platform = setup_platform(&[7]);
        platform.script(
            CHANNEL,
            7,
            vec![FakeFetch::Fail(PlatformError::RateLimited { seconds: 0 })],
        );
        let (_tmp, ctx, _) = test_context(platform.clone(), |_| {});
        ctx.ledger.record_start(CHANNEL, "Media Chan", 7);
        let task = task_for(7);
        let path = task.target_path(&ctx.config.download.save_dir);

        let end = process_task("W", &ctx, task).await;
        match end {
            TaskEnd::Attempted { requeue: Some(t) } => assert_eq!(t.message.id, 7),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            ctx.ledger.get_status(CHANNEL, 7),
            FileStatus::InFlight { retry_count: 0 }
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rate_limit_wait_stays_registered() {
        let platform = setup_platform(&[6]);
        platform.script(
            CHANNEL,
            6,
            vec![FakeFetch::Fail(PlatformError::RateLimited { seconds: 1 })],
        );
        let (_tmp, ctx, notifier) = test_context(platform.clone(), |_| {});
        ctx.ledger.record_start(CHANNEL, "Media Chan", 6);

        let handle = tokio::spawn({
            let ctx = ctx.clone();
            async move { process_task("W", &ctx, task_for(6)).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ctx.registry.len(), 1);
        ctx.reporter.check(&ctx, true).await;
        assert!(notifier.sent().iter().all(|text| !text.contains("批次汇总")));

        let end = handle.await.unwrap();
        assert!(matches!(end, TaskEnd::Attempted { requeue: Some(_) }));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_requeues_until_ceiling() {
        let platform = setup_platform(&[8]);
        platform.script(CHANNEL, 8, vec![FakeFetch::Hang, FakeFetch::Hang]);
        let (_tmp, ctx, _) = test_context(platform.clone(), |c| {
            c.download.download_timeout_secs = 1;
            c.download.max_retries = 2;
        });
        ctx.ledger.record_start(CHANNEL, "Media Chan", 8);

        let end = process_task("W", &ctx, task_for(8)).await;
        let requeued = match end {
            TaskEnd::Attempted { requeue: Some(t) } => t,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(
            ctx.ledger.get_status(CHANNEL, 8),
            FileStatus::InFlight { retry_count: 1 }
        );

        let end = process_task("W", &ctx, requeued).await;
        assert!(matches!(end, TaskEnd::Attempted { requeue: None }));
        assert_eq!(ctx.ledger.get_status(CHANNEL, 8), FileStatus::Failed);
        assert_eq!(ctx.ledger.load(CHANNEL).failed_count, 1);
    }

    #[tokio::test]
    async fn test_stale_reference_refreshes_message() {
        let platform = setup_platform(&[9, 10]);
        platform.script(
            CHANNEL,
            9,
            vec![FakeFetch::Fail(PlatformError::StaleMediaReference)],
        );
        let (_tmp, ctx, _) = test_context(platform.clone(), |_| {});
        ctx.ledger.record_start(CHANNEL, "Media Chan", 9);

        let end = process_task("W", &ctx, task_for(9)).await;
        match end {
            TaskEnd::Attempted { requeue: Some(t) } => {
                assert_eq!(t.message.id, 9);
                assert_eq!(t.file_name, "9 - file_9.bin");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            ctx.ledger.get_status(CHANNEL, 9),
            FileStatus::InFlight { retry_count: 1 }
        );
    }

    #[tokio::test]
    async fn test_stale_reference_dropped_when_message_gone() {
        // 9 已被删除，下一条是 10
        let platform = setup_platform(&[10]);
        platform.script(
            CHANNEL,
            9,
            vec![FakeFetch::Fail(PlatformError::StaleMediaReference)],
        );
        let (_tmp, ctx, _) = test_context(platform.clone(), |_| {});
        ctx.ledger.record_start(CHANNEL, "Media Chan", 9);

        let end = process_task("W", &ctx, task_for(9)).await;
        assert!(matches!(end, TaskEnd::Attempted { requeue: None }));
        assert!(ctx.queue.is_empty());
        assert_eq!(
            ctx.ledger.get_status(CHANNEL, 9),
            FileStatus::InFlight { retry_count: 1 }
        );
    }

    #[tokio::test]
    async fn test_stale_reference_dropped_when_refresh_fails() {
        let platform = setup_platform(&[9, 10]);
        platform.script(
            CHANNEL,
            9,
            vec![FakeFetch::Fail(PlatformError::StaleMediaReference)],
        );
        platform.fail_listing(CHANNEL, PlatformError::Other("network".into()));
        let (_tmp, ctx, _) = test_context(platform.clone(), |_| {});
        ctx.ledger.record_start(CHANNEL, "Media Chan", 9);

        let end = process_task("W", &ctx, task_for(9)).await;
        assert!(matches!(end, TaskEnd::Attempted { requeue: None }));
        assert!(ctx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_removes_partial() {
        let platform = setup_platform(&[11]);
        platform.script(
            CHANNEL,
            11,
            vec![FakeFetch::Fail(PlatformError::UnsupportedMedia(
                "poll".into(),
            ))],
        );
        let (_tmp, ctx, _) = test_context(platform.clone(), |c| c.download.max_retries = 1);
        ctx.ledger.record_start(CHANNEL, "Media Chan", 11);
        let task = task_for(11);
        let path = task.target_path(&ctx.config.download.save_dir);

        let end = process_task("W", &ctx, task).await;
        assert!(matches!(end, TaskEnd::Attempted { requeue: None }));
        assert!(!path.exists());
        assert_eq!(ctx.ledger.get_status(CHANNEL, 11), FileStatus::Failed);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_archive_after_success() {
        let platform = setup_platform(&[12]);
        let archiver = Arc::new(RecordingArchiver::default());
        let (_tmp, ctx, _) = test_context_with(
            platform.clone(),
            |_| {},
            Some(archiver.clone() as Arc<dyn Archiver>),
        );
        ctx.ledger.record_start(CHANNEL, "Media Chan", 12);
        let task = task_for(12);
        let path = task.target_path(&ctx.config.download.save_dir);

        process_task("W", &ctx, task).await;
        assert!(!path.exists());
        let calls = archiver.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "Media Chan(-100555)");
        assert_eq!(calls[0].2, "2024-03");
        assert_eq!(ctx.ledger.get_status(CHANNEL, 12), FileStatus::Completed);
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let platform = setup_platform(&[21, 22, 23]);
        let (_tmp, ctx, _) = test_context(platform.clone(), |_| {});
        for id in [21, 22, 23] {
            ctx.ledger.record_start(CHANNEL, "Media Chan", id);
            assert!(ctx.queue.push(task_for(id)));
        }

        let pool = WorkerPool::spawn(ctx.clone(), 2);
        assert_eq!(pool.len(), 2);
        for _ in 0..200 {
            if ctx.ledger.load(CHANNEL).completed_count == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.shutdown.cancel();
        pool.join().await;

        let progress = ctx.ledger.load(CHANNEL);
        assert_eq!(progress.completed_count, 3);
        assert_eq!(progress.last_message_id, 23);
        assert!(!ctx.queue.is_claimed(&task_for(21).key()));
    }
}
