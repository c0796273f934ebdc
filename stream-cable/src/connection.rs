//! Server-side representative of one upgraded socket.
//!
//! A [`Connection`] never touches the socket directly. Writes are queued on
//! a bounded channel whose receiving half belongs to whoever pumps the
//! socket (the websocket host, or a test standing in for it). A client that
//! stops reading fills its queue; further frames are dropped with a warning
//! until it catches up.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{
    channel::{Channel, ChannelHandler, Framing},
    router::Router,
};

pub type ConnectionId = u64;

/// Frames buffered for a client before writes start being dropped.
pub const DEFAULT_SEND_QUEUE: usize = 256;

/// Values an [`Authenticator`] attaches to a connection, e.g. `current_user`.
pub type Identity = Map<String, Value>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Items queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An already protocol-encoded text frame.
    Frame(String),
    /// Close the socket. Nothing is queued after this.
    Close,
}

/// The parts of the upgrade request that outlive the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
}

impl RequestInfo {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Decides whether an upgraded request may keep its connection.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Returns the identity to attach to the connection, or `None` to
    /// reject it.
    async fn connect(&self, request: &RequestInfo) -> anyhow::Result<Option<Identity>>;
}

/// Accepts every connection with an empty identity.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn connect(&self, _request: &RequestInfo) -> anyhow::Result<Option<Identity>> {
        Ok(Some(Identity::new()))
    }
}

pub struct Connection {
    id: ConnectionId,
    request: RequestInfo,
    router: Arc<Router>,
    open: AtomicBool,
    // Taken on close, so the writer sees the end of the queue even when
    // `Outbound::Close` did not fit.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    lagging: AtomicBool,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    streams: Mutex<HashMap<String, Arc<Channel>>>,
    identity: Mutex<Identity>,
}

impl Connection {
    /// Creates an open connection and the receiver its frames are written to,
    /// buffering up to [`DEFAULT_SEND_QUEUE`] frames.
    pub fn open(router: Arc<Router>, request: RequestInfo) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        Self::with_send_queue(router, request, DEFAULT_SEND_QUEUE)
    }

    pub fn with_send_queue(
        router: Arc<Router>,
        request: RequestInfo,
        send_queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, receiver) = mpsc::channel(send_queue.max(1));
        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            request,
            router,
            open: AtomicBool::new(true),
            outbound: Mutex::new(Some(outbound)),
            lagging: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            identity: Mutex::new(Identity::new()),
        });
        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn identity(&self) -> Identity {
        lock(&self.identity).clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        *lock(&self.identity) = identity;
    }

    /// Queues an encoded frame for the client.
    ///
    /// Writing to a closed connection is a silent no-op, and a frame that
    /// does not fit in a full queue is dropped. The return value only says
    /// whether the frame was queued.
    pub fn write(&self, data: impl Into<String>) -> bool {
        if !self.is_open() {
            debug!(connection = self.id, "dropping write to closed connection");
            return false;
        }

        let outbound = lock(&self.outbound);
        let Some(sender) = outbound.as_ref() else {
            debug!(connection = self.id, "dropping write to closed connection");
            return false;
        };
        match sender.try_send(Outbound::Frame(data.into())) {
            Ok(()) => {
                self.lagging.store(false, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                if !self.lagging.swap(true, Ordering::Relaxed) {
                    warn!(
                        connection = self.id,
                        capacity = sender.max_capacity(),
                        "client is not reading; dropping frames"
                    );
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = self.id, "socket writer is gone; dropping write");
                false
            }
        }
    }

    /// Subscribes the connection itself to `name`, without any channel
    /// logic: broadcasts on `name` are written to the socket unchanged.
    ///
    /// Returns the existing channel when `name` is already subscribed. On a
    /// closed connection the returned channel is already unsubscribed and is
    /// never registered.
    ///
    /// Raw subscriptions are kept apart from identifier channels: they never
    /// show up in [`channel`](Self::channel) or [`detach`](Self::detach).
    pub fn subscribe(self: &Arc<Self>, name: &str) -> Arc<Channel> {
        let mut streams = lock(&self.streams);
        if !self.is_open() {
            let channel = Channel::raw(self, name);
            channel.unsubscribe();
            return channel;
        }

        let channel = Arc::clone(
            streams
                .entry(name.to_string())
                .or_insert_with(|| Channel::raw(self, name)),
        );
        channel.stream_from(name);
        channel.confirm();
        channel
    }

    /// Adds a pending channel for `identifier`.
    ///
    /// Returns `None` when the connection is closed or already has a channel
    /// under that identifier.
    pub fn attach(
        self: &Arc<Self>,
        identifier: &str,
        params: Map<String, Value>,
        framing: Arc<dyn Framing>,
        handler: Box<dyn ChannelHandler>,
    ) -> Option<Arc<Channel>> {
        let mut channels = lock(&self.channels);
        if !self.is_open() || channels.contains_key(identifier) {
            return None;
        }

        let channel = Channel::new(self, identifier, params, framing, Some(handler));
        channels.insert(identifier.to_string(), Arc::clone(&channel));
        Some(channel)
    }

    pub fn channel(&self, identifier: &str) -> Option<Arc<Channel>> {
        lock(&self.channels).get(identifier).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        lock(&self.channels).values().cloned().collect()
    }

    /// Removes the channel from the connection without unsubscribing it.
    pub fn detach(&self, identifier: &str) -> Option<Arc<Channel>> {
        lock(&self.channels).remove(identifier)
    }

    /// Removes every channel from the connection without unsubscribing them.
    pub fn detach_all(&self) -> Vec<Arc<Channel>> {
        lock(&self.channels).drain().map(|(_, channel)| channel).collect()
    }

    /// Raw subscriptions made with [`subscribe`](Self::subscribe).
    pub fn streams(&self) -> Vec<Arc<Channel>> {
        lock(&self.streams).values().cloned().collect()
    }

    /// Marks the connection closed, unsubscribes every channel it still owns
    /// and asks the socket writer to close. Returns `false` if it was
    /// already closed.
    pub fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }

        let raw: Vec<_> = lock(&self.streams).drain().map(|(_, channel)| channel).collect();
        let channels = self.detach_all();
        for channel in channels.iter().chain(&raw) {
            channel.unsubscribe();
        }

        // Dropping the sender ends the queue once the writer has drained it.
        if let Some(sender) = lock(&self.outbound).take() {
            if let Err(err) = sender.try_send(Outbound::Close) {
                debug!(connection = self.id, error = %err, "close frame not queued");
            }
        }

        debug!(
            connection = self.id,
            channels = channels.len() + raw.len(),
            "connection closed"
        );
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
