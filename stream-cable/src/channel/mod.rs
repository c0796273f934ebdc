//! Per-connection subscriptions.
//!
//! A [`Channel`] is what a connection gets back when it subscribes to an
//! identifier. It owns the subscription state machine
//! (`Pending -> Subscribed -> Unsubscribed`), the set of streams it is
//! registered under, and the application's [`ChannelHandler`].

mod registry;

pub use registry::ChannelRegistry;

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::{
    adapter::Broadcaster,
    connection::{Connection, ConnectionId, Identity},
    error::CableError,
    router::Router,
};

pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Subscribed,
    Unsubscribed,
}

/// Result of dispatching an action to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Performed {
    Processed,
    UnknownAction,
}

/// Turns a channel payload into the frame written to the socket.
pub trait Framing: Send + Sync + 'static {
    fn frame(&self, identifier: &str, payload: &str) -> String;
}

/// Writes payloads unchanged.
pub struct Passthrough;

impl Framing for Passthrough {
    fn frame(&self, _identifier: &str, payload: &str) -> String {
        payload.to_string()
    }
}

/// Application logic behind a channel class.
///
/// Every callback runs on the owning connection's task, one at a time.
#[async_trait]
pub trait ChannelHandler: Send + 'static {
    async fn subscribed(&mut self, _ctx: &ChannelContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unsubscribed(&mut self, _ctx: &ChannelContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn has_action(&self, _action: &str) -> bool {
        false
    }

    async fn perform(
        &mut self,
        _ctx: &ChannelContext<'_>,
        _action: &str,
        _data: Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a [`ChannelHandler`] can do to its channel.
pub struct ChannelContext<'a> {
    channel: &'a Arc<Channel>,
    broadcaster: &'a Broadcaster,
    rejected: AtomicBool,
}

impl<'a> ChannelContext<'a> {
    fn new(channel: &'a Arc<Channel>, broadcaster: &'a Broadcaster) -> Self {
        Self {
            channel,
            broadcaster,
            rejected: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &str {
        self.channel.identifier()
    }

    pub fn params(&self) -> &Map<String, Value> {
        self.channel.params()
    }

    /// Identity the authenticator attached to the owning connection.
    pub fn identity(&self) -> Identity {
        self.channel
            .connection()
            .map(|connection| connection.identity())
            .unwrap_or_default()
    }

    pub fn stream_from(&self, stream: &str) {
        self.channel.stream_from(stream);
    }

    pub fn stop_stream_from(&self, stream: &str) {
        self.channel.stop_stream_from(stream);
    }

    /// Sends `data` to this channel's client only.
    pub fn transmit<T: Serialize + ?Sized>(&self, data: &T) -> anyhow::Result<()> {
        self.channel.transmit(data)?;
        Ok(())
    }

    /// Refuses the subscription. Only meaningful inside `subscribed`.
    pub fn reject(&self) {
        self.rejected.store(true, Ordering::Relaxed);
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected.load(Ordering::Relaxed)
    }

    pub async fn broadcast<T: Serialize + Sync + ?Sized>(
        &self,
        stream: &str,
        data: &T,
    ) -> anyhow::Result<()> {
        self.broadcaster.broadcast(stream, data).await?;
        Ok(())
    }
}

struct ChannelInner {
    state: ChannelState,
    streams: BTreeSet<String>,
}

pub struct Channel {
    id: ChannelId,
    identifier: String,
    params: Map<String, Value>,
    connection: Weak<Connection>,
    connection_id: ConnectionId,
    router: Arc<Router>,
    framing: Arc<dyn Framing>,
    inner: Mutex<ChannelInner>,
    handler: tokio::sync::Mutex<Option<Box<dyn ChannelHandler>>>,
}

impl Channel {
    pub(crate) fn new(
        connection: &Arc<Connection>,
        identifier: &str,
        params: Map<String, Value>,
        framing: Arc<dyn Framing>,
        handler: Option<Box<dyn ChannelHandler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            identifier: identifier.to_string(),
            params,
            connection: Arc::downgrade(connection),
            connection_id: connection.id(),
            router: Arc::clone(connection.router()),
            framing,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Pending,
                streams: BTreeSet::new(),
            }),
            handler: tokio::sync::Mutex::new(handler),
        })
    }

    /// A handler-less channel that writes broadcasts unchanged.
    pub(crate) fn raw(connection: &Arc<Connection>, name: &str) -> Arc<Self> {
        Self::new(connection, name, Map::new(), Arc::new(Passthrough), None)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn streams(&self) -> Vec<String> {
        self.lock().streams.iter().cloned().collect()
    }

    /// Adds `stream` to the channel. A subscribed channel is registered
    /// right away; a pending one is registered when it is confirmed.
    pub fn stream_from(self: &Arc<Self>, stream: &str) {
        let mut inner = self.lock();
        if inner.state == ChannelState::Unsubscribed {
            debug!(
                channel = %self.identifier,
                stream,
                "ignoring stream_from on unsubscribed channel"
            );
            return;
        }

        inner.streams.insert(stream.to_string());
        if inner.state == ChannelState::Subscribed {
            self.router.subscribe(stream, self);
        }
    }

    pub fn stop_stream_from(&self, stream: &str) {
        let mut inner = self.lock();
        if inner.streams.remove(stream) {
            self.router.unsubscribe(stream, self);
        }
    }

    /// `Pending -> Subscribed`, registering every stream with the router.
    /// Returns `false` if the channel was not pending.
    pub fn confirm(self: &Arc<Self>) -> bool {
        let mut inner = self.lock();
        if inner.state != ChannelState::Pending {
            return false;
        }

        inner.state = ChannelState::Subscribed;
        for stream in &inner.streams {
            self.router.subscribe(stream, self);
        }
        trace!(channel = %self.identifier, connection = self.connection_id, "channel subscribed");
        true
    }

    /// Moves to `Unsubscribed` and removes every router registration.
    /// Returns `false` if it was already unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ChannelState::Unsubscribed {
            return false;
        }

        let was_subscribed = inner.state == ChannelState::Subscribed;
        inner.state = ChannelState::Unsubscribed;
        for stream in std::mem::take(&mut inner.streams) {
            if was_subscribed {
                self.router.unsubscribe(&stream, self);
            }
        }
        trace!(channel = %self.identifier, connection = self.connection_id, "channel unsubscribed");
        true
    }

    /// Writes a broadcast payload to the owning connection.
    pub fn deliver(&self, payload: &str) -> bool {
        if self.state() != ChannelState::Subscribed {
            return false;
        }
        match self.connection() {
            Some(connection) => connection.write(self.framing.frame(&self.identifier, payload)),
            None => false,
        }
    }

    /// Serializes `data` and writes it to the owning connection only.
    pub fn transmit<T: Serialize + ?Sized>(&self, data: &T) -> Result<bool, CableError> {
        if self.state() == ChannelState::Unsubscribed {
            return Ok(false);
        }
        let payload = serde_json::to_string(data)?;
        Ok(match self.connection() {
            Some(connection) => connection.write(self.framing.frame(&self.identifier, &payload)),
            None => false,
        })
    }

    /// Runs the handler's `subscribed` callback. Returns `true` when the
    /// handler rejected the subscription.
    pub async fn run_subscribed(self: &Arc<Self>, broadcaster: &Broadcaster) -> anyhow::Result<bool> {
        let mut handler = self.handler.lock().await;
        let Some(handler) = handler.as_mut() else {
            return Ok(false);
        };

        let ctx = ChannelContext::new(self, broadcaster);
        handler.subscribed(&ctx).await?;
        Ok(ctx.is_rejected())
    }

    /// Dispatches `action` to the handler. Only valid while subscribed.
    pub async fn perform(
        self: &Arc<Self>,
        action: &str,
        data: Value,
        broadcaster: &Broadcaster,
    ) -> anyhow::Result<Performed> {
        if self.state() != ChannelState::Subscribed {
            return Err(CableError::NotSubscribed(self.identifier.clone()).into());
        }

        let mut handler = self.handler.lock().await;
        let Some(handler) = handler.as_mut() else {
            return Ok(Performed::UnknownAction);
        };
        if !handler.has_action(action) {
            return Ok(Performed::UnknownAction);
        }

        let ctx = ChannelContext::new(self, broadcaster);
        handler.perform(&ctx, action, data).await?;
        Ok(Performed::Processed)
    }

    /// Runs the handler's `unsubscribed` callback, then unsubscribes. The
    /// channel is deregistered even when the callback fails.
    pub async fn run_unsubscribed(self: &Arc<Self>, broadcaster: &Broadcaster) -> anyhow::Result<()> {
        let result = {
            let mut handler = self.handler.lock().await;
            match handler.as_mut() {
                Some(handler) => {
                    let ctx = ChannelContext::new(self, broadcaster);
                    handler.unsubscribed(&ctx).await
                }
                None => Ok(()),
            }
        };

        self.unsubscribe();
        result
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::InProcessAdapter,
        connection::{Outbound, RequestInfo},
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Prefixed;

    impl Framing for Prefixed {
        fn frame(&self, identifier: &str, payload: &str) -> String {
            format!("{identifier}:{payload}")
        }
    }

    #[derive(Default)]
    struct Counter {
        count: i64,
    }

    #[async_trait]
    impl ChannelHandler for Counter {
        async fn subscribed(&mut self, ctx: &ChannelContext<'_>) -> anyhow::Result<()> {
            ctx.stream_from("counter");
            Ok(())
        }

        fn has_action(&self, action: &str) -> bool {
            action == "add"
        }

        async fn perform(
            &mut self,
            ctx: &ChannelContext<'_>,
            _action: &str,
            data: Value,
        ) -> anyhow::Result<()> {
            self.count += data["by"].as_i64().unwrap_or(1);
            ctx.transmit(&json!({ "count": self.count }))
        }
    }

    fn setup() -> (
        Arc<Router>,
        Arc<Connection>,
        mpsc::Receiver<Outbound>,
        Broadcaster,
    ) {
        let router = Arc::new(Router::new());
        let (connection, outbound) = Connection::open(Arc::clone(&router), RequestInfo::default());
        let broadcaster = Broadcaster::new(Arc::new(InProcessAdapter::new()));
        (router, connection, outbound, broadcaster)
    }

    fn attach_counter(connection: &Arc<Connection>) -> Arc<Channel> {
        connection
            .attach("counter-1", Map::new(), Arc::new(Prefixed), Box::new(Counter::default()))
            .expect("attach channel")
    }

    #[tokio::test]
    async fn streams_register_only_once_confirmed() {
        let (router, connection, _outbound, broadcaster) = setup();
        let channel = attach_counter(&connection);

        let rejected = channel.run_subscribed(&broadcaster).await.expect("subscribed");
        assert!(!rejected);
        assert_eq!(channel.state(), ChannelState::Pending);
        assert_eq!(router.subscriber_count("counter"), 0);

        assert!(channel.confirm());
        assert!(!channel.confirm());
        assert!(router.is_subscribed("counter", &channel));
    }

    #[tokio::test]
    async fn double_unsubscribe_is_a_no_op() {
        let (router, connection, _outbound, _broadcaster) = setup();
        let channel = attach_counter(&connection);
        channel.stream_from("counter");
        channel.confirm();

        assert!(channel.unsubscribe());
        assert!(!channel.unsubscribe());
        assert_eq!(channel.state(), ChannelState::Unsubscribed);
        assert_eq!(router.subscriber_count("counter"), 0);

        // terminal: cannot come back
        assert!(!channel.confirm());
        channel.stream_from("counter");
        assert_eq!(router.subscriber_count("counter"), 0);
    }

    #[tokio::test]
    async fn perform_requires_subscription() {
        let (_router, connection, _outbound, broadcaster) = setup();
        let channel = attach_counter(&connection);

        let err = channel
            .perform("add", json!({}), &broadcaster)
            .await
            .expect_err("pending channel must refuse actions");
        assert!(matches!(
            err.downcast_ref::<CableError>(),
            Some(CableError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn perform_dispatches_known_actions_and_frames_transmits() {
        let (_router, connection, mut outbound, broadcaster) = setup();
        let channel = attach_counter(&connection);
        channel.confirm();

        let outcome = channel
            .perform("add", json!({ "by": 2 }), &broadcaster)
            .await
            .expect("perform");
        assert_eq!(outcome, Performed::Processed);
        assert_eq!(
            outbound.try_recv().ok(),
            Some(Outbound::Frame(r#"counter-1:{"count":2}"#.into()))
        );

        let outcome = channel
            .perform("explode", json!({}), &broadcaster)
            .await
            .expect("perform");
        assert_eq!(outcome, Performed::UnknownAction);
    }

    #[tokio::test]
    async fn deliver_only_reaches_subscribed_channels() {
        let (_router, connection, mut outbound, _broadcaster) = setup();
        let channel = attach_counter(&connection);

        assert!(!channel.deliver("early"));
        channel.confirm();
        assert!(channel.deliver("on time"));
        channel.unsubscribe();
        assert!(!channel.deliver("late"));

        assert_eq!(
            outbound.try_recv().ok(),
            Some(Outbound::Frame("counter-1:on time".into()))
        );
        assert!(outbound.try_recv().is_err());
    }
}
