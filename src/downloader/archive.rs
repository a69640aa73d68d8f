//! 下载完成后的归档（转存到远端）
//!
//! 归档成功后才删除本地文件，失败时保留本地副本。

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ArchiveConfig;

/// 归档步骤
#[async_trait]
pub trait Archiver: Send + Sync {
    /// 将文件转存到 `{dir_name}/{month}` 下
    async fn archive(&self, file: &Path, dir_name: &str, month: &str) -> Result<()>;
}

/// 使用 rclone 的归档实现
pub struct RcloneArchiver {
    drive_name: String,
    drive_path: String,
    operate: String,
    timeout: Duration,
}

impl RcloneArchiver {
    pub fn new(config: &ArchiveConfig, timeout: Duration) -> Self {
        Self {
            drive_name: config.drive_name.clone(),
            drive_path: config.drive_path.clone(),
            operate: config.operate.clone(),
            timeout,
        }
    }

    /// 远端目标：`{drive}:{path}/{dir}/{month}`
    pub fn destination(&self, dir_name: &str, month: &str) -> String {
        format!(
            "{}:{}/{}/{}",
            self.drive_name, self.drive_path, dir_name, month
        )
    }
}

#[async_trait]
impl Archiver for RcloneArchiver {
    async fn archive(&self, file: &Path, dir_name: &str, month: &str) -> Result<()> {
        let destination = self.destination(dir_name, month);
        let mut command = Command::new("rclone");
        command
            .arg(&self.operate)
            .arg(file)
            .arg(&destination)
            .arg("--ignore-existing")
            .kill_on_drop(true);

        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .context("rclone 执行超时")?
            .context("启动 rclone 失败")?;

        if !status.success() {
            anyhow::bail!("rclone 退出码异常: {:?}", status.code());
        }
        info!("归档完成: {:?} -> {}", file, destination);
        Ok(())
    }
}

/// 归档并在成功后删除本地文件，返回是否归档成功
pub async fn archive_and_cleanup(
    archiver: &dyn Archiver,
    file: &Path,
    dir_name: &str,
    month: &str,
) -> bool {
    match archiver.archive(file, dir_name, month).await {
        Ok(()) => {
            // move 操作后本地文件通常已不存在
            if tokio::fs::try_exists(file).await.unwrap_or(false) {
                if let Err(e) = tokio::fs::remove_file(file).await {
                    warn!("删除已归档的本地文件失败: {:?}, 错误: {}", file, e);
                }
            }
            true
        }
        Err(e) => {
            warn!("归档失败，保留本地文件: {:?}, 错误: {:#}", file, e);
            false
        }
    }
}
