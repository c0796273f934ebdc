use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{info, warn};

use super::{PubSubTransport, TransportMessage};
use crate::error::Result;

/// Redis PUBLISH / PSUBSCRIBE transport.
///
/// Publishing goes through a reconnecting [`ConnectionManager`]; each
/// subscription opens its own pub/sub connection.
pub struct RedisTransport {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        info!(url, "connected to redis");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, prefix: &str) -> Result<BoxStream<'static, TransportMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{prefix}*")).await?;

        let messages = pubsub.into_on_message().filter_map(|msg| {
            let topic = msg.get_channel_name().to_string();
            let message = match msg.get_payload::<String>() {
                Ok(payload) => Some(TransportMessage { topic, payload }),
                Err(err) => {
                    warn!(topic, error = %err, "dropping non-utf8 redis message");
                    None
                }
            };
            future::ready(message)
        });

        Ok(messages.boxed())
    }
}
