use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tracing::{debug, info, warn};

use super::{BroadcastAdapter, Fanout};
use crate::{
    error::{CableError, Result},
    scheduler::Scheduler,
};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// One message received from an external pub/sub system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: String,
}

/// External pub/sub system shared by every process of a deployment.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Every message published on a topic starting with `prefix`, including
    /// the ones this process published itself. The stream ends when the
    /// subscription is lost.
    async fn subscribe(&self, prefix: &str) -> Result<BoxStream<'static, TransportMessage>>;
}

/// Fans broadcasts out through a [`PubSubTransport`].
///
/// A broadcast on stream `s` is published to topic `<prefix>s`. The adapter
/// subscribes to `<prefix>*` when started and delivers whatever arrives to
/// the local router, so a broadcast reaches every process exactly through
/// the transport. Ordering across processes is whatever the transport gives.
///
/// A lost subscription is re-established with exponential backoff for as
/// long as the scheduler runs. Broadcasts published in the gap are missed.
pub struct DistributedAdapter<T> {
    transport: Arc<T>,
    topic_prefix: String,
    started: AtomicBool,
}

impl<T: PubSubTransport> DistributedAdapter<T> {
    pub fn new(transport: T, topic_prefix: impl Into<String>) -> Self {
        Self::shared(Arc::new(transport), topic_prefix)
    }

    pub fn shared(transport: Arc<T>, topic_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            topic_prefix: topic_prefix.into(),
            started: AtomicBool::new(false),
        }
    }

    pub fn topic_for(&self, stream: &str) -> String {
        format!("{}{}", self.topic_prefix, stream)
    }
}

#[async_trait]
impl<T: PubSubTransport> BroadcastAdapter for DistributedAdapter<T> {
    async fn start(&self, fanout: Fanout, scheduler: &Scheduler) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CableError::AlreadyInitialized);
        }

        let messages = self.transport.subscribe(&self.topic_prefix).await?;
        let relay = Relay {
            transport: Arc::clone(&self.transport),
            prefix: self.topic_prefix.clone(),
            fanout,
            scheduler: scheduler.clone(),
        };
        scheduler
            .spawn(relay.run(messages))
            .ok_or(CableError::SchedulerStopped)?;

        info!(prefix = %self.topic_prefix, "distributed broadcast adapter subscribed");
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: String) -> Result<()> {
        self.transport.publish(&self.topic_for(stream), payload).await
    }
}

/// Receive loop feeding transport messages to the local router.
struct Relay<T> {
    transport: Arc<T>,
    prefix: String,
    fanout: Fanout,
    scheduler: Scheduler,
}

impl<T: PubSubTransport> Relay<T> {
    async fn run(self, mut messages: BoxStream<'static, TransportMessage>) {
        loop {
            while let Some(message) = messages.next().await {
                if !self.scheduler.is_running() {
                    debug!(prefix = %self.prefix, "scheduler stopped; relay exiting");
                    return;
                }
                self.deliver(message);
            }

            warn!(prefix = %self.prefix, "broadcast transport subscription ended");
            match self.resubscribe().await {
                Some(stream) => messages = stream,
                None => return,
            }
        }
    }

    fn deliver(&self, message: TransportMessage) {
        match message.topic.strip_prefix(self.prefix.as_str()) {
            Some(stream) => {
                self.fanout.deliver(stream, &message.payload);
            }
            None => debug!(topic = %message.topic, "ignoring message outside the cable prefix"),
        }
    }

    /// Returns `None` once the scheduler stops.
    async fn resubscribe(&self) -> Option<BoxStream<'static, TransportMessage>> {
        let mut backoff = RESUBSCRIBE_BACKOFF;
        loop {
            tokio::time::sleep(backoff).await;
            if !self.scheduler.is_running() {
                debug!(prefix = %self.prefix, "scheduler stopped; not resubscribing");
                return None;
            }

            match self.transport.subscribe(&self.prefix).await {
                Ok(stream) => {
                    info!(prefix = %self.prefix, "broadcast transport resubscribed");
                    return Some(stream);
                }
                Err(err) => {
                    warn!(prefix = %self.prefix, error = %err, ?backoff, "resubscribe failed");
                    backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::stream;

    use super::*;
    use crate::{
        adapter::MemoryTransport,
        connection::{Connection, Outbound, RequestInfo},
        router::Router,
    };

    #[test]
    fn topics_are_prefixed_stream_names() {
        let adapter = DistributedAdapter::new(MemoryTransport::new(), "cable:");
        assert_eq!(adapter.topic_for("chat_1"), "cable:chat_1");
    }

    #[tokio::test]
    async fn publisher_receives_its_own_broadcast_through_the_transport() {
        let router = Arc::new(Router::new());
        let (connection, mut outbound) = Connection::open(Arc::clone(&router), RequestInfo::default());
        connection.subscribe("chat");

        let adapter = DistributedAdapter::new(MemoryTransport::new(), "cable:");
        adapter
            .start(Fanout::new(router), &Scheduler::current())
            .await
            .expect("start");
        adapter.publish("chat", "hello".to_string()).await.expect("publish");

        let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .expect("frame in time");
        assert_eq!(frame, Some(Outbound::Frame("hello".into())));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let adapter = DistributedAdapter::new(MemoryTransport::new(), "cable:");
        let router = Arc::new(Router::new());

        adapter
            .start(Fanout::new(Arc::clone(&router)), &Scheduler::current())
            .await
            .expect("start");
        let second = adapter
            .start(Fanout::new(router), &Scheduler::current())
            .await;
        assert!(matches!(second, Err(CableError::AlreadyInitialized)));
    }

    /// Hands out a stream that ends at once on the first subscription, then
    /// behaves like the memory hub.
    struct DroppingTransport {
        hub: MemoryTransport,
        subscriptions: AtomicUsize,
    }

    #[async_trait]
    impl PubSubTransport for DroppingTransport {
        async fn publish(&self, topic: &str, payload: String) -> Result<()> {
            self.hub.publish(topic, payload).await
        }

        async fn subscribe(&self, prefix: &str) -> Result<BoxStream<'static, TransportMessage>> {
            if self.subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(stream::empty().boxed());
            }
            self.hub.subscribe(prefix).await
        }
    }

    #[tokio::test]
    async fn relay_resubscribes_after_the_transport_stream_ends() {
        let router = Arc::new(Router::new());
        let (connection, mut outbound) = Connection::open(Arc::clone(&router), RequestInfo::default());
        connection.subscribe("chat");

        let transport = Arc::new(DroppingTransport {
            hub: MemoryTransport::new(),
            subscriptions: AtomicUsize::new(0),
        });
        let adapter = DistributedAdapter::shared(Arc::clone(&transport), "cable:");
        adapter
            .start(Fanout::new(router), &Scheduler::current())
            .await
            .expect("start");

        let resubscribed = async {
            while transport.subscriptions.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), resubscribed)
            .await
            .expect("relay resubscribed");

        adapter.publish("chat", "back".to_string()).await.expect("publish");
        let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .expect("frame in time");
        assert_eq!(frame, Some(Outbound::Frame("back".into())));
    }

    #[tokio::test]
    async fn stopped_scheduler_refuses_to_start_the_relay() {
        let scheduler = Scheduler::current();
        scheduler.stop();
        let adapter = DistributedAdapter::new(MemoryTransport::new(), "cable:");

        let started = adapter.start(Fanout::new(Arc::new(Router::new())), &scheduler).await;
        assert!(matches!(started, Err(CableError::SchedulerStopped)));
    }
}
