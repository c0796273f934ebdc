//! Demo channel served by the `stream-cable` binary.
//!
//! Subscribe with `{"channel":"ChatChannel","room":"lobby"}` and perform
//! `speak` with `{"action":"speak","message":"hi"}`; everyone in the room
//! receives `{"nickname":..,"message":"hi"}`.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::channel::{ChannelContext, ChannelHandler, ChannelRegistry};

pub const CHANNEL_NAME: &str = "ChatChannel";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub nickname: String,
    pub message: String,
}

#[derive(Default)]
pub struct ChatChannel {
    room: Option<String>,
}

pub fn stream_for(room: &str) -> String {
    format!("chat_{room}")
}

/// Registry with [`ChatChannel`] under [`CHANNEL_NAME`].
pub fn registry() -> ChannelRegistry {
    ChannelRegistry::new().register(CHANNEL_NAME, ChatChannel::default)
}

#[async_trait]
impl ChannelHandler for ChatChannel {
    async fn subscribed(&mut self, ctx: &ChannelContext<'_>) -> anyhow::Result<()> {
        let Some(room) = ctx.params().get("room").and_then(Value::as_str) else {
            ctx.reject();
            return Ok(());
        };

        ctx.stream_from(&stream_for(room));
        self.room = Some(room.to_string());
        Ok(())
    }

    async fn unsubscribed(&mut self, _ctx: &ChannelContext<'_>) -> anyhow::Result<()> {
        if let Some(room) = self.room.take() {
            debug!(room, "left chat room");
        }
        Ok(())
    }

    fn has_action(&self, action: &str) -> bool {
        action == "speak"
    }

    async fn perform(
        &mut self,
        ctx: &ChannelContext<'_>,
        _action: &str,
        data: Value,
    ) -> anyhow::Result<()> {
        let Some(room) = self.room.as_deref() else {
            anyhow::bail!("speak before joining a room");
        };
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if message.is_empty() {
            return Ok(());
        }

        let nickname = ctx
            .identity()
            .get("nickname")
            .and_then(Value::as_str)
            .or_else(|| ctx.params().get("nickname").and_then(Value::as_str))
            .unwrap_or("anonymous")
            .to_string();
        let chat = ChatMessage {
            nickname,
            message: message.to_string(),
        };
        ctx.broadcast(&stream_for(room), &chat).await
    }
}
