//! 环境变量覆盖
//!
//! 部署时通常只提供环境变量（或 .env），这里把它们叠加到 TOML 配置之上。
//! 解析失败的值记录警告并保留原配置。

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{info, warn};

use super::{AppConfig, ProxyConfig};

/// 代理环境变量，按优先级排列
const PROXY_ENV_VARS: &[&str] = &[
    "SOCKS5_PROXY",
    "socks5_proxy",
    "SOCKS_PROXY",
    "socks_proxy",
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// 环境变量来源
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// 进程环境变量
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned().filter(|v| !v.is_empty())
    }
}

/// 解析布尔值（true/1/yes/on）
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// 解析空白、逗号或分号分隔的 ID 列表，忽略无法解析的片段
pub fn parse_id_list(value: &str) -> Vec<i64> {
    value
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn parse_number<T: FromStr>(env: &dyn EnvSource, key: &str, target: &mut T) {
    if let Some(raw) = env.get(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("环境变量 {} 格式错误，保留原值: {:?}", key, raw),
        }
    }
}

fn parse_string(env: &dyn EnvSource, key: &str, target: &mut String) {
    if let Some(raw) = env.get(key) {
        *target = raw;
    }
}

fn parse_flag(env: &dyn EnvSource, key: &str, target: &mut bool) {
    if let Some(raw) = env.get(key) {
        *target = parse_bool(&raw);
    }
}

fn parse_words(env: &dyn EnvSource, key: &str, target: &mut Vec<String>) {
    if let Some(raw) = env.get(key) {
        *target = raw
            .split(' ')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}

impl AppConfig {
    /// 叠加环境变量
    pub fn apply_env(&mut self, env: &dyn EnvSource) {
        // 平台凭证
        parse_number(env, "API_ID", &mut self.platform.api_id);
        parse_string(env, "API_HASH", &mut self.platform.api_hash);
        parse_string(env, "BOT_TOKEN", &mut self.platform.bot_token);
        if let Some(raw) = env.get("ADMIN_ID") {
            let ids: Result<Vec<i64>, _> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse::<i64>)
                .collect();
            match ids {
                Ok(ids) => self.platform.admin_ids = ids,
                Err(_) => warn!("ADMIN_ID 格式错误，应为整数或逗号分隔的整数: {:?}", raw),
            }
        }
        if let Some(proxy) = PROXY_ENV_VARS.iter().find_map(|key| env.get(key)) {
            match ProxyConfig::parse(&proxy) {
                Ok(parsed) => {
                    info!("使用代理: {}://{}:{}", parsed.scheme, parsed.host, parsed.port);
                    self.platform.proxy = Some(parsed);
                }
                Err(e) => warn!("代理地址解析失败，忽略: {}", e),
            }
        }

        // 下载
        parse_number(env, "MAX_NUM", &mut self.download.max_concurrent);
        parse_number(env, "DOWNLOAD_TIMEOUT", &mut self.download.download_timeout_secs);
        parse_number(env, "MAX_RETRIES", &mut self.download.max_retries);
        parse_words(env, "FILTER_LIST", &mut self.download.filter_words);
        parse_words(env, "FILTER_FILE_TYPE", &mut self.download.filter_file_types);
        parse_flag(env, "AUTO_RESUME", &mut self.download.auto_resume);
        if let Some(dir) = env.get("SAVE_PATH") {
            self.download.save_dir = PathBuf::from(dir);
        }

        // 扫描
        parse_number(env, "SCAN_BATCH_SIZE", &mut self.scan.scan_batch_size);
        parse_number(env, "DOWNLOAD_BATCH_SIZE", &mut self.scan.rescan_batch_size);

        // 健康检查与报告
        parse_number(env, "HEALTH_CHECK_INTERVAL", &mut self.health.check_interval_secs);
        parse_number(env, "MAX_IDLE_TIME", &mut self.health.max_idle_secs);
        parse_number(
            env,
            "PROGRESS_REPORT_INTERVAL",
            &mut self.report.progress_report_interval_secs,
        );
        parse_number(env, "REPORT_MIN_INTERVAL", &mut self.report.min_interval_secs);
        parse_number(env, "REPORT_PERCENT_STEP", &mut self.report.percent_step);

        // 归档
        parse_flag(env, "UPLOAD_FLAG", &mut self.archive.enabled);
        parse_string(env, "DRIVE_NAME", &mut self.archive.drive_name);
        parse_string(env, "DRIVE_PATH", &mut self.archive.drive_path);
        parse_string(env, "OPERATE", &mut self.archive.operate);

        // 白名单
        if let Some(file) = env.get("WHITELIST_FILE") {
            self.whitelist.file = PathBuf::from(file);
        }
        if let Some(raw) = env.get("WHITE_LIST") {
            self.whitelist.initial_ids = parse_id_list(&raw);
        }
        parse_flag(env, "DOWNLOAD_ALL", &mut self.whitelist.download_all);

        // 持久化与日志
        if let Some(dir) = env.get("PROGRESS_DIR") {
            self.persistence.progress_dir = PathBuf::from(dir);
        }
        if let Some(level) = env.get("LOG_LEVEL") {
            self.log.level = level.to_ascii_lowercase();
        }
    }
}
