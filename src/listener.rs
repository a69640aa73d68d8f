//! 新消息自动下载
//!
//! 机器人前端在收到任意会话的新消息时调用 [`on_new_message`]。只有监听器已注册、
//! 自动捕获开关打开且会话通过白名单时才会入队。

use tracing::{debug, error, info};

use crate::context::PipelineContext;
use crate::platform::{EntityRef, Message};
use crate::scanner::Scanner;
use crate::whitelist::ListenerState;

/// 处理一条新消息，返回是否加入了下载队列
pub async fn on_new_message(ctx: &PipelineContext, message: Message) -> bool {
    let whitelist = &ctx.whitelist;
    if whitelist.listener_state() != ListenerState::Registered || !whitelist.auto_capture() {
        return false;
    }

    let entity = match ctx
        .platform
        .resolve_entity(&EntityRef::Id(message.chat_id))
        .await
    {
        Ok(entity) => entity,
        Err(e) => {
            error!("获取会话实体失败: {}, 错误: {}", message.chat_id, e);
            return false;
        }
    };

    if !whitelist.is_allowed(entity.id) {
        debug!("会话不在白名单中: {} ({})", entity.title, entity.id);
        return false;
    }
    if !message.has_media() {
        return false;
    }

    info!("🔥 自动下载: {}", entity.title);
    Scanner::new(ctx)
        .enqueue_message(&entity, &entity.title, message)
        .await
}
