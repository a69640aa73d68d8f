//! 文件命名
//!
//! 由消息说明文字、文件名属性和 MIME 类型拼出本地文件名：
//! - `{消息ID} - {说明}{原文件名}`
//! - 无文件名的文档使用 MIME 子类型作为扩展名
//! - 图片使用 `{图片ID}.jpg`
//!
//! 相册中只有一条消息带说明文字，其余消息通过附近消息查找并缓存。

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error};

use crate::platform::{Entity, Media, Message, MessageQuery, MessagingPlatform};

/// 说明文字前缀的最大字符数
const CAPTION_MAX_CHARS: usize = 50;

/// 说明与原文件名相似度超过此值时不再重复拼接说明
const CAPTION_SIMILARITY_LIMIT: f64 = 0.6;

/// 相册说明缓存容量
const GROUP_CACHE_CAPACITY: usize = 500;

/// 缓存超限时一次淘汰的条目数
const GROUP_CACHE_EVICT: usize = 50;

/// 不下载的文档类型（贴纸等）
const SKIPPED_MIME_TYPES: &[&str] = &["image/webp", "application/x-tgsticker"];

/// 将文件系统不允许的字符替换为下划线
pub fn validate_title(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\n' => '_',
            other => other,
        })
        .collect()
}

/// 频道目录名：`{标题}({ID})`
pub fn channel_dir_name(title: &str, channel_id: i64) -> String {
    validate_title(&format!("{}({})", title, channel_id))
}

/// 字节数格式化（1024 进制）
pub fn bytes_to_string(bytes: u64) -> String {
    const UNITS: [&str; 5] = [" bytes", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// 字符多重集重合度：2 * 公共字符数 / 总字符数
///
/// 不考虑顺序，只作为相似度的上界估计
pub fn equal_rate(a: &str, b: &str) -> f64 {
    let total = a.chars().count() + b.chars().count();
    if total == 0 {
        return 1.0;
    }

    let mut available: HashMap<char, usize> = HashMap::new();
    for c in b.chars() {
        *available.entry(c).or_insert(0) += 1;
    }
    let mut matches = 0usize;
    for c in a.chars() {
        if let Some(n) = available.get_mut(&c) {
            if *n > 0 {
                *n -= 1;
                matches += 1;
            }
        }
    }
    2.0 * matches as f64 / total as f64
}

/// 相册说明缓存（先进先出淘汰）
#[derive(Default)]
struct GroupCaptionCache {
    captions: HashMap<i64, String>,
    order: VecDeque<i64>,
}

impl GroupCaptionCache {
    fn get(&self, grouped_id: i64) -> Option<String> {
        self.captions.get(&grouped_id).cloned()
    }

    fn insert(&mut self, grouped_id: i64, caption: String) {
        if self.captions.insert(grouped_id, caption).is_none() {
            self.order.push_back(grouped_id);
        }
        if self.captions.len() > GROUP_CACHE_CAPACITY {
            for _ in 0..GROUP_CACHE_EVICT {
                match self.order.pop_front() {
                    Some(id) => {
                        self.captions.remove(&id);
                    }
                    None => break,
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.captions.len()
    }
}

/// 文件名生成器
pub struct FileNamer {
    filter_words: Vec<String>,
    group_captions: Mutex<GroupCaptionCache>,
}

impl FileNamer {
    pub fn new(filter_words: Vec<String>) -> Self {
        Self {
            filter_words: filter_words.into_iter().filter(|w| !w.is_empty()).collect(),
            group_captions: Mutex::new(GroupCaptionCache::default()),
        }
    }

    /// 为消息生成文件名，返回 None 表示该消息不需要下载
    pub async fn build(
        &self,
        platform: &dyn MessagingPlatform,
        entity: &Entity,
        message: &Message,
    ) -> Option<String> {
        let caption = match message.grouped_id {
            Some(grouped_id) if message.text.is_empty() => {
                self.group_caption(platform, entity, message.id, grouped_id)
                    .await
            }
            _ => message.text.clone(),
        };
        self.compose(message, &caption)
    }

    /// 根据说明文字组合文件名
    pub fn compose(&self, message: &Message, caption: &str) -> Option<String> {
        let caption = self.strip_filter_words(caption);
        let mut caption = if caption.is_empty() {
            String::new()
        } else {
            format!("{} - ", validate_title(&caption))
                .chars()
                .take(CAPTION_MAX_CHARS)
                .collect()
        };

        let file_name = match message.media.as_ref()? {
            Media::Document {
                file_name,
                mime_type,
                ..
            } => {
                if SKIPPED_MIME_TYPES.contains(&mime_type.as_str()) {
                    return None;
                }
                match file_name.as_deref().filter(|n| !n.is_empty()) {
                    Some(name) => {
                        if equal_rate(&caption, name) > CAPTION_SIMILARITY_LIMIT {
                            caption.clear();
                        }
                        format!("{} - {}{}", message.id, caption, name)
                    }
                    None => {
                        let ext = mime_type.rsplit('/').next().unwrap_or(mime_type);
                        format!("{} - {}.{}", message.id, caption, ext)
                    }
                }
            }
            Media::Photo { id, .. } => format!("{} - {}{}.jpg", message.id, caption, id),
            Media::WebPage | Media::Unsupported(_) => return None,
        };

        Some(self.strip_filter_words(&file_name))
    }

    fn strip_filter_words(&self, text: &str) -> String {
        self.filter_words
            .iter()
            .fold(text.to_string(), |acc, word| acc.replace(word.as_str(), ""))
    }

    /// 查找相册说明：在消息前后 10 条内寻找同组且带文字的消息
    async fn group_caption(
        &self,
        platform: &dyn MessagingPlatform,
        entity: &Entity,
        message_id: i64,
        grouped_id: i64,
    ) -> String {
        let cached = self.group_captions.lock().get(grouped_id);
        if let Some(cached) = cached {
            return cached;
        }

        let query = MessageQuery::after(message_id - 9).with_limit(Some(10));
        let mut stream = platform.iter_messages(entity, query);
        let mut caption = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(msg) if msg.grouped_id == Some(grouped_id) && !msg.text.is_empty() => {
                    caption = msg.text;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("获取相册说明失败: 频道={}, 消息={}, 错误={}", entity.id, message_id, e);
                    return caption;
                }
            }
        }
        debug!("缓存相册说明: grouped_id={}, 长度={}", grouped_id, caption.len());
        self.group_captions.lock().insert(grouped_id, caption.clone());
        caption
    }

    /// 当前缓存的相册数
    pub fn cached_groups(&self) -> usize {
        self.group_captions.lock().len()
    }
}

/// 文件名是否命中跳过的后缀
pub fn is_filtered_type(file_name: &str, filter_file_types: &[String]) -> bool {
    filter_file_types
        .iter()
        .filter(|t| !t.is_empty())
        .any(|t| file_name.ends_with(t.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{media_message, FakePlatform};

    #[test]
    fn test_validate_title() {
        assert_eq!(validate_title("a/b\\c:d*e?f\"g<h>i|j\nk"), "a_b_c_d_e_f_g_h_i_j_k");
        assert_eq!(channel_dir_name("My: Chan", -100), "My_ Chan(-100)");
    }

    #[test]
    fn test_bytes_to_string() {
        assert_eq!(bytes_to_string(512), "512.00 bytes");
        assert_eq!(bytes_to_string(1536), "1.50KB");
        assert_eq!(bytes_to_string(5 * 1024 * 1024), "5.00MB");
    }

    #[test]
    fn test_equal_rate() {
        assert_eq!(equal_rate("", ""), 1.0);
        assert_eq!(equal_rate("abc", "cba"), 1.0);
        assert_eq!(equal_rate("abc", "xyz"), 0.0);
        assert!((equal_rate("ab", "abcd") - 2.0 * 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_compose_document_with_name() {
        let namer = FileNamer::new(vec![]);
        let msg = media_message(-100, 7, 10);
        assert_eq!(
            namer.compose(&msg, "Holiday").as_deref(),
            Some("7 - Holiday - file_7.bin")
        );
        // 说明与文件名几乎相同，不再重复
        assert_eq!(namer.compose(&msg, "file_7.bin").as_deref(), Some("7 - file_7.bin"));
    }

    #[test]
    fn test_compose_document_without_name_and_photo() {
        let namer = FileNamer::new(vec!["#ad".to_string()]);
        let mut msg = media_message(-100, 8, 10);
        msg.media = Some(Media::Document {
            file_name: None,
            mime_type: "video/mp4".into(),
            size: 10,
        });
        assert_eq!(namer.compose(&msg, "clip #ad").as_deref(), Some("8 - clip  - .mp4"));

        msg.media = Some(Media::Photo { id: 555, size: 10 });
        assert_eq!(namer.compose(&msg, "").as_deref(), Some("8 - 555.jpg"));
    }

    #[test]
    fn test_compose_skips_stickers_and_webpages() {
        let namer = FileNamer::new(vec![]);
        let mut msg = media_message(-100, 9, 10);
        msg.media = Some(Media::Document {
            file_name: Some("s.webp".into()),
            mime_type: "image/webp".into(),
            size: 10,
        });
        assert!(namer.compose(&msg, "").is_none());
        msg.media = Some(Media::WebPage);
        assert!(namer.compose(&msg, "").is_none());
        msg.media = None;
        assert!(namer.compose(&msg, "").is_none());
    }

    #[test]
    fn test_caption_truncated() {
        let namer = FileNamer::new(vec![]);
        let msg = media_message(-100, 1, 10);
        let long = "x".repeat(80);
        let name = namer.compose(&msg, &long).unwrap();
        assert_eq!(name, format!("1 - {}file_1.bin", "x".repeat(50)));
    }

    #[test]
    fn test_group_cache_eviction() {
        let mut cache = GroupCaptionCache::default();
        for i in 0..=GROUP_CACHE_CAPACITY as i64 {
            cache.insert(i, format!("c{}", i));
        }
        assert_eq!(cache.len(), GROUP_CACHE_CAPACITY + 1 - GROUP_CACHE_EVICT);
        assert!(cache.get(0).is_none());
        assert_eq!(cache.get(GROUP_CACHE_CAPACITY as i64).as_deref(), Some("c500"));
    }

    #[tokio::test]
    async fn test_group_caption_lookup() {
        let platform = FakePlatform::new();
        platform.add_channel(-100, "Album", None);
        let mut first = media_message(-100, 20, 10);
        first.grouped_id = Some(77);
        first.text = "Trip".into();
        let mut second = media_message(-100, 21, 10);
        second.grouped_id = Some(77);
        platform.add_message(first);
        platform.add_message(second.clone());

        let namer = FileNamer::new(vec![]);
        let entity = platform.entity(-100);
        let name = namer.build(&platform, &entity, &second).await.unwrap();
        assert_eq!(name, "21 - Trip - file_21.bin");
        assert_eq!(namer.cached_groups(), 1);
    }

    #[test]
    fn test_is_filtered_type() {
        let types = vec![".gif".to_string(), String::new()];
        assert!(is_filtered_type("1 - a.gif", &types));
        assert!(!is_filtered_type("1 - a.mp4", &types));
        assert!(!is_filtered_type("1 - a.mp4", &[]));
    }
}
