//! Broadcast fan-out strategies.
//!
//! - [`InProcessAdapter`]: delivers straight to this process's router.
//! - [`DistributedAdapter`]: publishes through a [`PubSubTransport`]; every
//!   process, the publisher included, receives the message back from the
//!   transport and fans it out to its own router.
//!
//! Which one runs is decided once at startup from [`AdapterConfig`].

mod distributed;
mod memory;
#[cfg(feature = "redis")]
mod redis_pubsub;

pub use distributed::{DistributedAdapter, PubSubTransport, TransportMessage};
pub use memory::MemoryTransport;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisTransport;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use crate::{
    config::AdapterConfig,
    error::{CableError, Result},
    router::Router,
    scheduler::Scheduler,
};

#[async_trait]
pub trait BroadcastAdapter: Send + Sync + 'static {
    /// Wires the adapter to the local router. Called once, from the
    /// protocol's `init`; any receive loop runs on `scheduler`.
    async fn start(&self, fanout: Fanout, scheduler: &Scheduler) -> Result<()>;

    /// Delivers an encoded payload to every subscriber of `stream`.
    async fn publish(&self, stream: &str, payload: String) -> Result<()>;
}

/// Local delivery: resolves a stream's subscribers and writes to each.
#[derive(Clone)]
pub struct Fanout {
    router: Arc<Router>,
}

impl Fanout {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Returns how many channels the payload was written to.
    pub fn deliver(&self, stream: &str, payload: &str) -> usize {
        let subscribers = self.router.subscribers(stream);
        if subscribers.is_empty() {
            trace!(stream, "broadcast to stream without subscribers");
            return 0;
        }

        let delivered = subscribers
            .iter()
            .filter(|channel| channel.deliver(payload))
            .count();
        trace!(stream, subscribers = subscribers.len(), delivered, "broadcast delivered");
        delivered
    }
}

/// JSON-encodes broadcast data and hands it to the adapter.
#[derive(Clone)]
pub struct Broadcaster {
    adapter: Arc<dyn BroadcastAdapter>,
}

impl Broadcaster {
    pub fn new(adapter: Arc<dyn BroadcastAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn BroadcastAdapter> {
        &self.adapter
    }

    pub async fn broadcast<T: Serialize + Sync + ?Sized>(&self, stream: &str, data: &T) -> Result<()> {
        let payload = serde_json::to_string(data)?;
        self.adapter.publish(stream, payload).await
    }
}

#[derive(Default)]
pub struct InProcessAdapter {
    fanout: OnceLock<Fanout>,
}

impl InProcessAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BroadcastAdapter for InProcessAdapter {
    async fn start(&self, fanout: Fanout, _scheduler: &Scheduler) -> Result<()> {
        self.fanout
            .set(fanout)
            .map_err(|_| CableError::AlreadyInitialized)
    }

    async fn publish(&self, stream: &str, payload: String) -> Result<()> {
        match self.fanout.get() {
            Some(fanout) => {
                fanout.deliver(stream, &payload);
            }
            None => debug!(stream, "in-process adapter not started; dropping broadcast"),
        }
        Ok(())
    }
}

/// Builds the adapter selected by the deployment configuration.
pub async fn from_config(config: &AdapterConfig) -> Result<Arc<dyn BroadcastAdapter>> {
    match config {
        AdapterConfig::InProcess => Ok(Arc::new(InProcessAdapter::new())),
        AdapterConfig::Memory { topic_prefix } => Ok(Arc::new(DistributedAdapter::new(
            MemoryTransport::new(),
            topic_prefix.clone(),
        ))),
        #[cfg(feature = "redis")]
        AdapterConfig::Redis { url, topic_prefix } => {
            let transport = RedisTransport::connect(url).await?;
            Ok(Arc::new(DistributedAdapter::new(transport, topic_prefix.clone())))
        }
        #[cfg(not(feature = "redis"))]
        AdapterConfig::Redis { .. } => Err(CableError::Transport(
            "redis adapter requires the `redis` feature".to_string(),
        )),
    }
}
