//! Websocket publish/subscribe engine.
//!
//! Clients open one websocket each, subscribe to channels over it, and
//! receive every broadcast made on the streams those channels follow. See
//! `README.md` for usage. Each module focuses on a concrete responsibility:
//!
//! - [`protocol`] turns raw frames into commands and frames the replies;
//!   [`protocol::ActionCableV1Json`] is the bundled implementation.
//! - [`connection`] represents one upgraded socket and owns its channels.
//! - [`channel`] is one subscription: its state machine, its streams, and
//!   the application's [`channel::ChannelHandler`].
//! - [`router`] maps stream names to the channels subscribed to them.
//! - [`adapter`] fans broadcasts out, in process or through a pub/sub
//!   transport shared by several processes.
//! - [`handler`] and [`scheduler`] run protocol hooks as isolated,
//!   per-connection ordered tasks.
//! - [`server`] hosts a [`Cable`] on an axum websocket route.
//! - [`cli`], [`config`] and [`chat`] back the `stream-cable` binary.

pub mod adapter;
pub mod channel;
pub mod chat;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod upgrade;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    channel::ChannelRegistry,
    config::CableConfig,
    connection::{Connection, Outbound, RequestInfo},
    error::Result,
    handler::ConnectionHandler,
    protocol::{ActionCableV1Json, Protocol},
    router::Router,
    scheduler::Scheduler,
    upgrade::UpgradeDecision,
};

/// One cable endpoint: a protocol, its router and the handler running its
/// connections.
pub struct Cable {
    config: CableConfig,
    router: Arc<Router>,
    protocol: Arc<dyn Protocol>,
    handler: ConnectionHandler,
}

impl Cable {
    /// Initializes `protocol` against a fresh router.
    pub async fn new(
        config: CableConfig,
        protocol: Arc<dyn Protocol>,
        scheduler: Scheduler,
    ) -> Result<Self> {
        let router = Arc::new(Router::new());
        protocol.init(Arc::clone(&router), &scheduler).await?;
        let handler = ConnectionHandler::new(Arc::clone(&protocol), scheduler);

        Ok(Self {
            config,
            router,
            protocol,
            handler,
        })
    }

    /// ActionCable v1 JSON over the adapter selected in `config`.
    pub async fn action_cable(
        config: CableConfig,
        channels: ChannelRegistry,
        scheduler: Scheduler,
    ) -> Result<Self> {
        let adapter = adapter::from_config(&config.adapter).await?;
        let protocol =
            ActionCableV1Json::new(adapter, channels).with_ping_interval(config.ping_interval());
        Self::new(config, Arc::new(protocol), scheduler).await
    }

    pub fn config(&self) -> &CableConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn handler(&self) -> &ConnectionHandler {
        &self.handler
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.handler.scheduler()
    }

    /// Sends `data` to every subscriber of `stream`, on every process
    /// sharing the adapter.
    pub async fn broadcast<T: Serialize + Sync + ?Sized>(
        &self,
        stream: &str,
        data: &T,
    ) -> Result<()> {
        let data = serde_json::to_value(data)?;
        self.protocol.broadcast(stream, &data).await
    }

    pub fn negotiate(&self, is_websocket: bool) -> UpgradeDecision {
        upgrade::negotiate(is_websocket, self.protocol.protocol_definition())
    }

    /// Registers a freshly upgraded socket and schedules its `on_open`.
    ///
    /// The receiver yields every frame the connection writes; whoever holds
    /// it is responsible for putting them on the wire. It buffers up to
    /// `config.send_queue` frames.
    pub fn open_connection(&self, request: RequestInfo) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (connection, outbound) =
            Connection::with_send_queue(Arc::clone(&self.router), request, self.config.send_queue);
        self.handler.on_open(Arc::clone(&connection));
        (connection, outbound)
    }
}
