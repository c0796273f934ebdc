//! Wire protocols.
//!
//! A [`Protocol`] owns everything version-specific: how raw frames become
//! [`Command`]s, what the client sees on open, shutdown and subscription,
//! and how broadcast data is encoded. The engine only ever talks to the
//! trait, so a new protocol version plugs in without touching the
//! connection, channel or router code.

mod actioncable;

pub use actioncable::{decode, ActionCableV1Json, PING_STREAM};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{connection::Connection, error::Result, router::Router, scheduler::Scheduler};

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Subscribe {
        identifier: String,
    },
    Unsubscribe {
        identifier: String,
    },
    Perform {
        identifier: String,
        action: String,
        payload: Value,
    },
}

/// Optional hooks a protocol implements. Read once when the connection
/// handler is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub on_close: bool,
    pub on_shutdown: bool,
}

#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// One-time wiring to the process's stream registry. Background tasks
    /// the protocol needs are spawned on `scheduler` and stop with it.
    async fn init(&self, router: Arc<Router>, scheduler: &Scheduler) -> Result<()>;

    /// Sub-protocol advertised in the upgrade response.
    fn protocol_definition(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn on_open(&self, connection: &Arc<Connection>) -> anyhow::Result<()>;

    /// Decodes and applies one inbound frame. Malformed frames must not
    /// fail the call.
    async fn on_message(&self, connection: &Arc<Connection>, raw: &str) -> anyhow::Result<()>;

    /// Only called when [`Capabilities::on_close`] is set.
    async fn on_close(&self, _connection: &Arc<Connection>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Only called when [`Capabilities::on_shutdown`] is set. Runs before
    /// the socket is closed.
    async fn on_shutdown(&self, _connection: &Arc<Connection>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Encodes `data` and fans it out to every subscriber of `stream`.
    async fn broadcast(&self, stream: &str, data: &Value) -> Result<()>;
}
