//! 测试用内存平台

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{
    Entity, EntityRef, Media, Message, MessageId, MessageQuery, MessageStream, MessagingPlatform,
    Notifier, ProgressCallback,
};
use crate::error::PlatformError;

/// 单次下载的预设结果
#[derive(Debug, Clone)]
pub enum FakeFetch {
    Succeed,
    Fail(PlatformError),
    Hang,
}

#[derive(Default)]
pub struct FakePlatform {
    entities: Mutex<HashMap<i64, Entity>>,
    handles: Mutex<HashMap<String, i64>>,
    messages: Mutex<HashMap<i64, Vec<Message>>>,
    scripts: Mutex<HashMap<(i64, MessageId), VecDeque<FakeFetch>>>,
    downloads: Mutex<Vec<(i64, MessageId)>>,
    listing_errors: Mutex<HashMap<i64, PlatformError>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, id: i64, title: &str, handle: Option<&str>) {
        self.entities.lock().insert(id, Entity::new(id, title));
        if let Some(handle) = handle {
            self.handles.lock().insert(handle.to_string(), id);
        }
        self.messages.lock().entry(id).or_default();
    }

    pub fn add_message(&self, message: Message) {
        let mut messages = self.messages.lock();
        let list = messages.entry(message.chat_id).or_default();
        list.push(message);
        list.sort_by_key(|m| m.id);
    }

    pub fn script(&self, channel_id: i64, message_id: MessageId, outcomes: Vec<FakeFetch>) {
        self.scripts
            .lock()
            .insert((channel_id, message_id), outcomes.into());
    }

    /// 之后对该频道的消息遍历都返回错误
    pub fn fail_listing(&self, channel_id: i64, err: PlatformError) {
        self.listing_errors.lock().insert(channel_id, err);
    }

    pub fn download_calls(&self) -> Vec<(i64, MessageId)> {
        self.downloads.lock().clone()
    }

    pub fn entity(&self, id: i64) -> Entity {
        self.entities.lock().get(&id).cloned().expect("unknown channel")
    }
}

pub fn media_message(chat_id: i64, id: MessageId, size: u64) -> Message {
    Message {
        id,
        chat_id,
        date: Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap(),
        text: String::new(),
        grouped_id: None,
        media: Some(Media::Document {
            file_name: Some(format!("file_{}.bin", id)),
            mime_type: "application/octet-stream".to_string(),
            size,
        }),
    }
}

pub fn text_message(chat_id: i64, id: MessageId) -> Message {
    Message {
        id,
        chat_id,
        date: Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap(),
        text: format!("text {}", id),
        grouped_id: None,
        media: None,
    }
}

#[async_trait]
impl MessagingPlatform for FakePlatform {
    async fn resolve_entity(&self, reference: &EntityRef) -> Result<Entity, PlatformError> {
        let id = match reference {
            EntityRef::Id(id) => Some(*id),
            EntityRef::Handle(handle) => self.handles.lock().get(handle).copied(),
        };
        id.and_then(|id| self.entities.lock().get(&id).cloned())
            .ok_or_else(|| PlatformError::EntityNotFound(reference.to_string()))
    }

    fn iter_messages<'a>(&'a self, entity: &'a Entity, query: MessageQuery) -> MessageStream<'a> {
        if let Some(err) = self.listing_errors.lock().get(&entity.id).cloned() {
            return futures::stream::iter(vec![Err(err)]).boxed();
        }
        let mut window: Vec<Message> = self
            .messages
            .lock()
            .get(&entity.id)
            .map(|list| {
                list.iter()
                    .filter(|m| m.id > query.offset_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(limit) = query.limit {
            window.truncate(limit);
        }
        futures::stream::iter(window.into_iter().map(Ok)).boxed()
    }

    async fn get_message(
        &self,
        entity: &Entity,
        message_id: MessageId,
    ) -> Result<Option<Message>, PlatformError> {
        Ok(self
            .messages
            .lock()
            .get(&entity.id)
            .and_then(|list| list.iter().find(|m| m.id == message_id).cloned()))
    }

    async fn download_media(
        &self,
        message: &Message,
        dest: &Path,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<(), PlatformError> {
        self.downloads.lock().push((message.chat_id, message.id));
        let next = self
            .scripts
            .lock()
            .get_mut(&(message.chat_id, message.id))
            .and_then(|q| q.pop_front())
            .unwrap_or(FakeFetch::Succeed);

        match next {
            FakeFetch::Succeed => {
                let size = message.media_size();
                progress(size / 2, size);
                tokio::fs::write(dest, b"media-bytes")
                    .await
                    .map_err(|e| PlatformError::Other(e.to_string()))?;
                progress(size, size);
                Ok(())
            }
            FakeFetch::Fail(err) => {
                // 模拟写了一半的文件
                let _ = tokio::fs::write(dest, b"partial").await;
                Err(err)
            }
            FakeFetch::Hang => {
                cancel.cancelled().await;
                Err(PlatformError::Other("cancelled".to_string()))
            }
        }
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<String>>,
}

impl FakeNotifier {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify_admin(&self, text: &str) -> Result<(), PlatformError> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}
