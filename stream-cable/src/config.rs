//! Deployment configuration for a cable.
//!
//! Every field has a default so an empty document deserializes into a
//! working single-process setup. The binary builds this from CLI flags; an
//! embedding application can deserialize it from whatever source it uses.

use std::time::Duration;

use serde::Deserialize;

use crate::connection::DEFAULT_SEND_QUEUE;

const DEFAULT_PATH: &str = "/cable";
pub const DEFAULT_TOPIC_PREFIX: &str = "cable:";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CableConfig {
    /// Route the cable is mounted on.
    pub path: String,
    /// Seconds between protocol pings. Zero disables them.
    pub ping_interval_secs: u64,
    /// Upper bound on how long shutdown waits for sessions to drain.
    pub shutdown_timeout_secs: u64,
    /// Frames buffered per client. Once full, further frames to that client
    /// are dropped until it reads again.
    pub send_queue: usize,
    pub adapter: AdapterConfig,
}

impl Default for CableConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            ping_interval_secs: 3,
            shutdown_timeout_secs: 5,
            send_queue: DEFAULT_SEND_QUEUE,
            adapter: AdapterConfig::default(),
        }
    }
}

impl CableConfig {
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Broadcast fan-out strategy, chosen once at startup.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterConfig {
    /// Deliver broadcasts only to subscribers of this process.
    #[default]
    InProcess,
    /// Distributed delivery over a hub private to this cable. Runs the
    /// distributed path without an external broker.
    Memory {
        #[serde(default = "default_topic_prefix")]
        topic_prefix: String,
    },
    /// Distributed delivery over Redis pub/sub.
    Redis {
        url: String,
        #[serde(default = "default_topic_prefix")]
        topic_prefix: String,
    },
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}
