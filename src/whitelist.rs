//! 白名单
//!
//! 白名单决定新消息是否自动下载。平台对同一个频道有多种数值编码
//! （原始 ID、取反、`-100` 前缀的超级群编码），匹配时对实体 ID 的所有变体逐一检查。
//!
//! 自动下载监听器的注册是一个两态状态机：一旦注册就不会自动注销，
//! 名单清空时只关闭 `auto_capture` 开关。

use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::WhitelistConfig;
use crate::platform::ChannelId;

/// 监听器注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    NotRegistered,
    Registered,
}

/// 自动下载监听器的注册钩子（由机器人前端实现）
pub trait ListenerRegistrar: Send + Sync {
    fn register(&self);
}

/// 计算实体 ID 的所有等价编码
pub fn id_variants(entity_id: ChannelId) -> Vec<i64> {
    let mut variants = vec![entity_id];
    if let Some(negated) = entity_id.checked_neg() {
        variants.push(negated);
    }
    if entity_id > 0 {
        if let Ok(prefixed) = format!("-100{}", entity_id).parse::<i64>() {
            variants.push(prefixed);
        }
    }
    let text = entity_id.to_string();
    if let Some(suffix) = text.strip_prefix("-100") {
        if let Ok(actual) = suffix.parse::<i64>() {
            variants.push(actual);
            variants.push(-actual);
        }
    }
    variants.sort_unstable();
    variants.dedup();
    variants
}

/// 解析白名单文件内容，容忍逗号、分号和空白分隔，忽略无法解析的片段
pub fn parse_whitelist(content: &str) -> Vec<i64> {
    let mut ids = Vec::new();
    for part in content
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|s| !s.is_empty())
    {
        match part.parse::<i64>() {
            Ok(id) if !ids.contains(&id) => ids.push(id),
            Ok(_) => {}
            Err(_) => debug!("忽略无效白名单条目: {}", part),
        }
    }
    ids
}

pub struct WhitelistController {
    file: PathBuf,
    download_all: bool,
    ids: RwLock<Vec<i64>>,
    file_mtime: Mutex<Option<SystemTime>>,
    auto_capture: AtomicBool,
    listener: Mutex<ListenerState>,
    registrar: Option<Arc<dyn ListenerRegistrar>>,
}

impl WhitelistController {
    pub fn new(file: impl Into<PathBuf>, download_all: bool) -> Self {
        Self {
            file: file.into(),
            download_all,
            ids: RwLock::new(Vec::new()),
            file_mtime: Mutex::new(None),
            auto_capture: AtomicBool::new(false),
            listener: Mutex::new(ListenerState::NotRegistered),
            registrar: None,
        }
    }

    pub fn from_config(config: &WhitelistConfig) -> Self {
        Self::new(&config.file, config.download_all)
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn ListenerRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn download_all(&self) -> bool {
        self.download_all
    }

    /// 启动时初始化
    ///
    /// 优先级：download_all（清空名单，全局捕获）> 初始 ID 列表（写回文件）> 文件
    pub fn initialize(&self, initial_ids: &[i64]) {
        if self.download_all {
            self.ids.write().clear();
            info!("DOWNLOAD_ALL 已开启，监听所有会话");
        } else if !initial_ids.is_empty() {
            *self.ids.write() = parse_whitelist(
                &initial_ids
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            self.save();
            info!("使用环境变量白名单: {:?}", self.list());
        } else {
            self.load_from_file();
            info!("从文件加载白名单: {:?}", self.list());
        }
        self.sync_capture();
    }

    /// 实体是否允许自动下载（名单为空时全部允许）
    pub fn is_allowed(&self, entity_id: ChannelId) -> bool {
        let ids = self.ids.read();
        if ids.is_empty() {
            return true;
        }
        id_variants(entity_id).iter().any(|v| ids.contains(v))
    }

    pub fn list(&self) -> Vec<i64> {
        self.ids.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// 添加 ID，返回实际新增的部分
    pub fn add(&self, ids: &[i64]) -> Vec<i64> {
        let added: Vec<i64> = {
            let mut current = self.ids.write();
            let mut added = Vec::new();
            for id in ids {
                if !current.contains(id) {
                    current.push(*id);
                    added.push(*id);
                }
            }
            added
        };
        if !added.is_empty() {
            self.save();
            self.sync_capture();
            info!("白名单新增: {:?}", added);
        }
        added
    }

    /// 移除 ID，返回实际移除的部分
    pub fn remove(&self, ids: &[i64]) -> Vec<i64> {
        let removed: Vec<i64> = {
            let mut current = self.ids.write();
            let removed: Vec<i64> = ids
                .iter()
                .copied()
                .filter(|id| current.contains(id))
                .collect();
            current.retain(|id| !removed.contains(id));
            removed
        };
        if !removed.is_empty() {
            self.save();
            self.sync_capture();
            info!("白名单移除: {:?}", removed);
        }
        removed
    }

    pub fn clear(&self) {
        self.ids.write().clear();
        self.save();
        self.sync_capture();
        info!("白名单已清空");
    }

    pub fn auto_capture(&self) -> bool {
        self.auto_capture.load(Ordering::SeqCst)
    }

    pub fn listener_state(&self) -> ListenerState {
        *self.listener.lock()
    }

    /// NotRegistered → Registered，返回是否发生了转换
    pub fn ensure_registered(&self) -> bool {
        {
            let mut state = self.listener.lock();
            if *state == ListenerState::Registered {
                return false;
            }
            *state = ListenerState::Registered;
        }
        if let Some(registrar) = &self.registrar {
            registrar.register();
        }
        info!("自动下载监听器已注册");
        true
    }

    /// 按当前名单更新捕获开关与监听器状态
    fn sync_capture(&self) {
        if self.download_all {
            self.auto_capture.store(true, Ordering::SeqCst);
            self.ensure_registered();
        } else if self.is_empty() {
            self.auto_capture.store(false, Ordering::SeqCst);
        } else {
            self.auto_capture.store(true, Ordering::SeqCst);
            self.ensure_registered();
        }
    }

    /// 从文件加载，文件不存在或读取失败时名单为空
    pub fn load_from_file(&self) {
        let (ids, mtime) = match std::fs::read_to_string(&self.file) {
            Ok(content) => (parse_whitelist(&content), modified_time(&self.file)),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("读取白名单文件失败: {:?}, 错误: {}", self.file, e);
                }
                (Vec::new(), None)
            }
        };

        if self.download_all {
            self.ids.write().clear();
            *self.file_mtime.lock() = None;
            return;
        }
        *self.ids.write() = ids;
        *self.file_mtime.lock() = mtime;
    }

    /// 写回文件（排序去重，每行一个 ID）
    ///
    /// 优先直接写入并 fsync，失败时改用临时文件 + rename。错误只记录日志。
    pub fn save(&self) {
        let mut ids = self.list();
        ids.sort_unstable();
        ids.dedup();
        let content: String = ids.iter().map(|id| format!("{}\n", id)).collect();

        if let Some(parent) = self.file.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("创建白名单目录失败: {:?}, 错误: {}", parent, e);
            }
        }

        let saved = match write_synced(&self.file, &content) {
            Ok(()) => true,
            Err(e) => {
                debug!("直接写入白名单失败: {}，改用临时文件", e);
                let tmp = self
                    .file
                    .with_extension(format!("tmp.{}", std::process::id()));
                match write_synced(&tmp, &content).and_then(|_| std::fs::rename(&tmp, &self.file)) {
                    Ok(()) => true,
                    Err(e) => {
                        let _ = std::fs::remove_file(&tmp);
                        warn!("保存白名单文件失败: {:?}, 错误: {}", self.file, e);
                        false
                    }
                }
            }
        };

        if saved {
            *self.file_mtime.lock() = modified_time(&self.file);
        }
    }

    /// 文件修改时间变化时重新加载，返回名单是否被刷新
    pub fn reload_if_changed(&self) -> bool {
        if !self.file.exists() {
            if self.is_empty() {
                return false;
            }
            self.ids.write().clear();
            *self.file_mtime.lock() = None;
            self.sync_capture();
            info!("白名单文件已删除，清空白名单");
            return true;
        }

        let current = modified_time(&self.file);
        let known = *self.file_mtime.lock();
        if current.is_some() && current == known {
            return false;
        }

        self.load_from_file();
        self.sync_capture();
        info!("白名单已重新加载: {:?}", self.list());
        true
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn write_synced(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    file.sync_all()
}
