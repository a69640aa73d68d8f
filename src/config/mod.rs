// 配置管理模块

pub mod env;
pub mod proxy;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub use env::{EnvSource, ProcessEnv};
pub use proxy::{ProxyConfig, ProxyScheme};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 平台凭证与管理员
    #[serde(default)]
    pub platform: PlatformConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 扫描配置
    #[serde(default)]
    pub scan: ScanConfig,
    /// 健康检查配置
    #[serde(default)]
    pub health: HealthConfig,
    /// 进度报告配置
    #[serde(default)]
    pub report: ReportConfig,
    /// 归档（下载完成后转存）配置
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// 白名单配置
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 平台凭证
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// API ID
    #[serde(default)]
    pub api_id: i64,
    /// API Hash
    #[serde(default)]
    pub api_hash: String,
    /// 机器人 Token
    #[serde(default)]
    pub bot_token: String,
    /// 管理员 ID 列表（第一个接收通知）
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    /// 代理
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 本地保存目录
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// 并发工作者数量
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 单个文件下载超时（秒）
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 限流等待上限（秒）
    #[serde(default = "default_rate_limit_cap_secs")]
    pub rate_limit_cap_secs: u64,
    /// 从说明文字和文件名中剔除的关键词
    #[serde(default)]
    pub filter_words: Vec<String>,
    /// 跳过的文件后缀
    #[serde(default)]
    pub filter_file_types: Vec<String>,
    /// 启动时是否自动恢复
    #[serde(default)]
    pub auto_resume: bool,
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_concurrent() -> usize {
    10
}

fn default_download_timeout_secs() -> u64 {
    1800
}

fn default_max_retries() -> u32 {
    3
}

fn default_rate_limit_cap_secs() -> u64 {
    300
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            max_concurrent: default_max_concurrent(),
            download_timeout_secs: default_download_timeout_secs(),
            max_retries: default_max_retries(),
            rate_limit_cap_secs: default_rate_limit_cap_secs(),
            filter_words: Vec::new(),
            filter_file_types: Vec::new(),
            auto_resume: false,
        }
    }
}

impl DownloadConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn rate_limit_cap(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cap_secs)
    }
}

/// 扫描配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// 单次扫描的消息条数上限
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// 触发重扫所需的新完成数
    #[serde(default = "default_rescan_batch_size")]
    pub rescan_batch_size: u64,
    /// 重扫检查间隔（秒）
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
}

fn default_scan_batch_size() -> usize {
    100
}

fn default_rescan_batch_size() -> u64 {
    50
}

fn default_rescan_interval_secs() -> u64 {
    30
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: default_scan_batch_size(),
            rescan_batch_size: default_rescan_batch_size(),
            rescan_interval_secs: default_rescan_interval_secs(),
        }
    }
}

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// 检查间隔（秒）
    #[serde(default = "default_health_check_interval_secs")]
    pub check_interval_secs: u64,
    /// 空闲多久（且队列非空）视为死锁（秒）
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

fn default_health_check_interval_secs() -> u64 {
    300
}

fn default_max_idle_secs() -> u64 {
    600
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_health_check_interval_secs(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

/// 进度报告配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// 健康检查中定期报告的间隔（秒）
    #[serde(default = "default_progress_report_interval_secs")]
    pub progress_report_interval_secs: u64,
    /// 两次通知的最小间隔（秒）
    #[serde(default = "default_report_min_interval_secs")]
    pub min_interval_secs: u64,
    /// 大批量时百分比需前进的步长
    #[serde(default = "default_report_percent_step")]
    pub percent_step: i64,
    /// 小批量阈值，低于此数量只受最小间隔约束
    #[serde(default = "default_small_batch_threshold")]
    pub small_batch_threshold: u64,
}

fn default_progress_report_interval_secs() -> u64 {
    600
}

fn default_report_min_interval_secs() -> u64 {
    180
}

fn default_report_percent_step() -> i64 {
    1
}

fn default_small_batch_threshold() -> u64 {
    100
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            progress_report_interval_secs: default_progress_report_interval_secs(),
            min_interval_secs: default_report_min_interval_secs(),
            percent_step: default_report_percent_step(),
            small_batch_threshold: default_small_batch_threshold(),
        }
    }
}

/// 归档配置（rclone）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// 是否启用
    #[serde(default)]
    pub enabled: bool,
    /// rclone 远端名称
    #[serde(default)]
    pub drive_name: String,
    /// 远端根路径
    #[serde(default)]
    pub drive_path: String,
    /// rclone 子命令（move / copy）
    #[serde(default = "default_archive_operate")]
    pub operate: String,
}

fn default_archive_operate() -> String {
    "move".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drive_name: String::new(),
            drive_path: String::new(),
            operate: default_archive_operate(),
        }
    }
}

impl ArchiveConfig {
    /// 归档实际生效（开关打开且配置了远端）
    pub fn is_active(&self) -> bool {
        self.enabled && !self.drive_name.is_empty()
    }
}

/// 白名单配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// 白名单文件
    #[serde(default = "default_whitelist_file")]
    pub file: PathBuf,
    /// 启动时指定的白名单（优先于文件，并会写回文件）
    #[serde(default)]
    pub initial_ids: Vec<i64>,
    /// 下载所有会话（忽略白名单）
    #[serde(default)]
    pub download_all: bool,
    /// 文件轮询间隔（秒）
    #[serde(default = "default_whitelist_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_whitelist_file() -> PathBuf {
    PathBuf::from("whitelist.txt")
}

fn default_whitelist_poll_secs() -> u64 {
    5
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            file: default_whitelist_file(),
            initial_ids: Vec::new(),
            download_all: false,
            poll_interval_secs: default_whitelist_poll_secs(),
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 频道进度目录
    #[serde(default = "default_progress_dir")]
    pub progress_dir: PathBuf,
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from("progress")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            progress_dir: default_progress_dir(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大字节数
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .context("Failed to read config file")?;
        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;
        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置，文件不存在或无效时使用默认值
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 完整加载流程：配置文件 → 环境变量覆盖 → 校验
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::load_or_default(path).await;
        config.apply_env(&ProcessEnv);
        config.validate()?;
        Ok(config)
    }

    /// 校验必需配置
    ///
    /// 缺少凭证或管理员是唯一的致命错误
    pub fn validate(&self) -> Result<()> {
        let p = &self.platform;
        if p.api_id == 0 || p.api_hash.is_empty() || p.bot_token.is_empty() || p.admin_ids.is_empty()
        {
            anyhow::bail!("缺少必需配置 (API_ID, API_HASH, BOT_TOKEN, ADMIN_ID)");
        }
        if self.download.max_concurrent == 0 {
            anyhow::bail!("并发数 MAX_NUM 必须大于 0");
        }
        if self.download.max_retries == 0 {
            anyhow::bail!("最大重试次数 MAX_RETRIES 必须大于 0");
        }
        Ok(())
    }

    /// 实际工作者数量（启用归档时强制为 1）
    pub fn effective_concurrency(&self) -> usize {
        if self.archive.is_active() {
            1
        } else {
            self.download.max_concurrent.max(1)
        }
    }

    /// 接收通知的管理员
    pub fn primary_admin(&self) -> Option<i64> {
        self.platform.admin_ids.first().copied()
    }
}
