use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{PubSubTransport, TransportMessage};
use crate::error::Result;

/// Messages a slow subscriber may fall behind before it starts skipping.
const HUB_CAPACITY: usize = 1024;

/// Pub/sub hub living in this process.
///
/// Clones share the same hub, so several cables built from clones of one
/// transport behave like separate processes behind one message bus.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: broadcast::Sender<TransportMessage>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (hub, _) = broadcast::channel(HUB_CAPACITY);
        Self { hub }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let message = TransportMessage {
            topic: topic.to_string(),
            payload,
        };
        if self.hub.send(message).is_err() {
            debug!(topic, "memory transport has no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, prefix: &str) -> Result<BoxStream<'static, TransportMessage>> {
        let receiver = self.hub.subscribe();
        let prefix = prefix.to_string();

        let messages = stream::unfold((receiver, prefix), |(mut receiver, prefix)| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) if message.topic.starts_with(&prefix) => {
                        return Some((message, (receiver, prefix)));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory transport subscriber lagged; messages dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(messages.boxed())
    }
}
