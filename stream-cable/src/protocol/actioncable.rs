use std::{
    sync::{Arc, OnceLock, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Capabilities, Command, Protocol};
use crate::{
    adapter::{BroadcastAdapter, Broadcaster, Fanout},
    channel::{ChannelRegistry, Framing, Performed},
    connection::{AllowAll, Authenticator, Connection},
    error::{CableError, Result},
    router::Router,
    scheduler::Scheduler,
};

const PROTOCOL_DEFINITION: &str = "actioncable-v1-json";

/// Stream every connection is raw-subscribed to for keepalive pings.
pub const PING_STREAM: &str = "__cable_ping__";

#[derive(Deserialize)]
struct RawFrame {
    command: String,
    identifier: Option<String>,
    data: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Welcome,
    Ping { message: u64 },
    ConfirmSubscription { identifier: &'a str },
    RejectSubscription { identifier: &'a str },
    Disconnect { reason: &'a str, reconnect: bool },
}

impl ServerFrame<'_> {
    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn write_to(&self, connection: &Connection) -> Result<bool> {
        Ok(connection.write(self.encode()?))
    }
}

/// Wraps a channel payload as `{"identifier": .., "message": ..}`.
struct IdentifierFraming;

impl Framing for IdentifierFraming {
    fn frame(&self, identifier: &str, payload: &str) -> String {
        format!(
            r#"{{"identifier":{},"message":{}}}"#,
            Value::String(identifier.to_string()),
            payload
        )
    }
}

/// Decodes one client frame.
///
/// `data` of a `message` command is kept whole, `action` key included, and
/// handed to the channel as the action payload.
pub fn decode(raw: &str) -> Result<Command> {
    let frame: RawFrame =
        serde_json::from_str(raw).map_err(|err| CableError::InvalidFrame(err.to_string()))?;
    let identifier = frame
        .identifier
        .ok_or_else(|| CableError::InvalidFrame("missing identifier".to_string()))?;

    match frame.command.as_str() {
        "subscribe" => Ok(Command::Subscribe { identifier }),
        "unsubscribe" => Ok(Command::Unsubscribe { identifier }),
        "message" => {
            let data = frame
                .data
                .ok_or_else(|| CableError::MissingAction(identifier.clone()))?;
            let payload: Value = serde_json::from_str(&data)
                .map_err(|err| CableError::InvalidFrame(format!("data is not json: {err}")))?;
            let action = payload
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| CableError::MissingAction(identifier.clone()))?
                .to_string();
            Ok(Command::Perform {
                identifier,
                action,
                payload,
            })
        }
        other => Err(CableError::UnknownCommand(other.to_string())),
    }
}

/// Splits an identifier into its channel class and the remaining params.
fn parse_identifier(identifier: &str) -> Result<(String, Map<String, Value>)> {
    let mut params: Map<String, Value> = serde_json::from_str(identifier)
        .map_err(|err| CableError::InvalidFrame(format!("identifier is not a json object: {err}")))?;
    match params.remove("channel") {
        Some(Value::String(class)) => Ok((class, params)),
        _ => Err(CableError::InvalidFrame(
            "identifier has no channel name".to_string(),
        )),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// The ActionCable v1 JSON protocol spoken by `@rails/actioncable` clients.
pub struct ActionCableV1Json {
    broadcaster: Broadcaster,
    channels: ChannelRegistry,
    authenticator: Arc<dyn Authenticator>,
    ping_interval: Option<Duration>,
    router: OnceLock<Arc<Router>>,
}

impl ActionCableV1Json {
    pub fn new(adapter: Arc<dyn BroadcastAdapter>, channels: ChannelRegistry) -> Self {
        Self {
            broadcaster: Broadcaster::new(adapter),
            channels,
            authenticator: Arc::new(AllowAll),
            ping_interval: Some(Duration::from_secs(3)),
            router: OnceLock::new(),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// `None` disables pings.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    fn reject(&self, connection: &Connection, identifier: &str) -> Result<()> {
        ServerFrame::RejectSubscription { identifier }.write_to(connection)?;
        Ok(())
    }

    async fn subscribe(&self, connection: &Arc<Connection>, identifier: String) -> anyhow::Result<()> {
        if connection.channel(&identifier).is_some() {
            debug!(connection = connection.id(), identifier, "already subscribed");
            return Ok(());
        }

        let (class, params) = match parse_identifier(&identifier) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(connection = connection.id(), identifier, error = %err, "rejecting subscription");
                self.reject(connection, &identifier)?;
                return Ok(());
            }
        };

        let Some(handler) = self.channels.build(&class) else {
            let err = CableError::UnknownChannel(class);
            warn!(connection = connection.id(), identifier, error = %err, "rejecting subscription");
            self.reject(connection, &identifier)?;
            return Ok(());
        };

        let Some(channel) = connection.attach(&identifier, params, Arc::new(IdentifierFraming), handler)
        else {
            debug!(connection = connection.id(), identifier, "connection closed or already subscribed");
            return Ok(());
        };

        let rejected = match channel.run_subscribed(&self.broadcaster).await {
            Ok(rejected) => rejected,
            Err(err) => {
                connection.detach(&identifier);
                channel.unsubscribe();
                return Err(err.context(format!("{class}#subscribed")));
            }
        };

        if rejected {
            connection.detach(&identifier);
            channel.unsubscribe();
            debug!(connection = connection.id(), identifier, "subscription rejected by channel");
            self.reject(connection, &identifier)?;
            return Ok(());
        }

        // Confirm frame goes out before any broadcast on the new streams.
        ServerFrame::ConfirmSubscription {
            identifier: &identifier,
        }
        .write_to(connection)?;
        channel.confirm();
        Ok(())
    }

    async fn unsubscribe(&self, connection: &Arc<Connection>, identifier: &str) -> anyhow::Result<()> {
        match connection.detach(identifier) {
            Some(channel) => channel
                .run_unsubscribed(&self.broadcaster)
                .await
                .with_context(|| format!("unsubscribing from {identifier}")),
            None => {
                debug!(connection = connection.id(), identifier, "unsubscribe for unknown identifier");
                Ok(())
            }
        }
    }

    async fn perform(
        &self,
        connection: &Arc<Connection>,
        identifier: &str,
        action: &str,
        payload: Value,
    ) -> anyhow::Result<()> {
        let Some(channel) = connection.channel(identifier) else {
            warn!(connection = connection.id(), identifier, action, "action for a channel that is not subscribed");
            return Ok(());
        };

        let performed = channel
            .perform(action, payload, &self.broadcaster)
            .await
            .with_context(|| format!("performing {action} on {identifier}"))?;
        if performed == Performed::UnknownAction {
            warn!(connection = connection.id(), identifier, action, "unknown action");
        }
        Ok(())
    }
}

#[async_trait]
impl Protocol for ActionCableV1Json {
    async fn init(&self, router: Arc<Router>, scheduler: &Scheduler) -> Result<()> {
        self.router
            .set(Arc::clone(&router))
            .map_err(|_| CableError::AlreadyInitialized)?;
        self.broadcaster
            .adapter()
            .start(Fanout::new(Arc::clone(&router)), scheduler)
            .await?;

        if let Some(period) = self.ping_interval {
            scheduler
                .spawn(ping(Arc::downgrade(&router), scheduler.clone(), period))
                .ok_or(CableError::SchedulerStopped)?;
        }
        info!(protocol = PROTOCOL_DEFINITION, "cable protocol initialized");
        Ok(())
    }

    fn protocol_definition(&self) -> &'static str {
        PROTOCOL_DEFINITION
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            on_close: true,
            on_shutdown: true,
        }
    }

    async fn on_open(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
        let identity = match self.authenticator.connect(connection.request()).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                info!(connection = connection.id(), "connection rejected: unauthorized");
                refuse(connection)?;
                return Ok(());
            }
            Err(err) => {
                refuse(connection)?;
                return Err(err.context("authenticating connection"));
            }
        };

        connection.set_identity(identity);
        ServerFrame::Welcome.write_to(connection)?;
        connection.subscribe(PING_STREAM);
        Ok(())
    }

    async fn on_message(&self, connection: &Arc<Connection>, raw: &str) -> anyhow::Result<()> {
        let command = match decode(raw) {
            Ok(command) => command,
            Err(err) => {
                warn!(connection = connection.id(), error = %err, "dropping malformed frame");
                return Ok(());
            }
        };

        match command {
            Command::Subscribe { identifier } => self.subscribe(connection, identifier).await,
            Command::Unsubscribe { identifier } => self.unsubscribe(connection, &identifier).await,
            Command::Perform {
                identifier,
                action,
                payload,
            } => self.perform(connection, &identifier, &action, payload).await,
        }
    }

    async fn on_close(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
        for channel in connection.detach_all() {
            if let Err(err) = channel.run_unsubscribed(&self.broadcaster).await {
                warn!(
                    connection = connection.id(),
                    identifier = channel.identifier(),
                    error = ?err,
                    "unsubscribed callback failed during close"
                );
            }
        }
        Ok(())
    }

    async fn on_shutdown(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
        ServerFrame::Disconnect {
            reason: "server_restart",
            reconnect: true,
        }
        .write_to(connection)?;
        Ok(())
    }

    async fn broadcast(&self, stream: &str, data: &Value) -> Result<()> {
        self.broadcaster.broadcast(stream, data).await
    }
}

fn refuse(connection: &Connection) -> Result<()> {
    ServerFrame::Disconnect {
        reason: "unauthorized",
        reconnect: false,
    }
    .write_to(connection)?;
    connection.close();
    Ok(())
}

/// Pings every local connection until the router is gone or the scheduler
/// stops. Pings are never sent through the adapter; each process pings its
/// own clients.
async fn ping(router: Weak<Router>, scheduler: Scheduler, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !scheduler.is_running() {
            debug!("scheduler stopped; ping ticker stopped");
            return;
        }
        let Some(router) = router.upgrade() else {
            break;
        };

        match (ServerFrame::Ping { message: unix_now() }).encode() {
            Ok(frame) => {
                Fanout::new(router).deliver(PING_STREAM, &frame);
            }
            Err(err) => warn!(error = %err, "failed to encode ping"),
        }
    }
    debug!("router dropped; ping ticker stopped");
}
