//! 日志系统
//!
//! 控制台 + 文件双输出。文件按启动时间命名、超过大小上限后滚动，启动时清理过期文件。

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "media-harvester.";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件
struct RollingFile {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 滚动序号，0 为首个文件
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut rolling = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            file: None,
            index: 0,
            max_file_size,
            written: 0,
        };
        rolling.open_current()?;
        Ok(rolling)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}.log", LOG_FILE_PREFIX, self.start_timestamp)
        } else {
            format!("{}{}_{}.log", LOG_FILE_PREFIX, self.start_timestamp, index)
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        match self.file.as_mut() {
            Some(file) => {
                let n = file.write(buf)?;
                self.written += n as u64;
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 可克隆的日志写入器
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_bytes(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// 日志守卫，需保持存活直到进程退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先，其次使用配置中的级别（可由 `LOG_LEVEL` 覆盖）
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| LogFileWriter::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| eprintln!("日志文件初始化失败: {:?}, 回退到仅控制台输出: {}", config.log_dir, e))
            .ok()
    } else {
        None
    };

    let Some(writer) = writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 优先按文件名中的日期判断，无法解析时退回到修改时间
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(".log") {
            continue;
        }

        let expired = match date_from_file_name(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_mtime(&entry, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}

/// `media-harvester.YYYY-MM-DD-HHMMSS[_N].log` -> YYYY-MM-DD
fn date_from_file_name(name: &str) -> Option<chrono::NaiveDate> {
    let stem = name.strip_prefix(LOG_FILE_PREFIX)?.strip_suffix(".log")?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_mtime(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_date_from_file_name() {
        let date = date_from_file_name("media-harvester.2024-03-15-120000_2.log").unwrap();
        assert_eq!(date.to_string(), "2024-03-15");
        assert!(date_from_file_name("other.2024-03-15.log").is_none());
        assert!(date_from_file_name("media-harvester.log").is_none());
    }

    #[test]
    fn test_rolling_file_rotates_by_size() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = LogFileWriter::new(temp_dir.path().to_path_buf(), 16).unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.flush().unwrap();

        let count = fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_cleanup_old_logs() {
        let temp_dir = TempDir::new().unwrap();
        let old = temp_dir.path().join("media-harvester.2000-01-01-000000.log");
        let fresh_name = format!(
            "media-harvester.{}.log",
            Local::now().format("%Y-%m-%d-%H%M%S")
        );
        let fresh = temp_dir.path().join(fresh_name);
        let unrelated = temp_dir.path().join("notes.2000-01-01.log");
        for path in [&old, &fresh, &unrelated] {
            fs::write(path, "x").unwrap();
        }

        assert_eq!(cleanup_old_logs(temp_dir.path(), 7), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}
