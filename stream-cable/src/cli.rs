use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    config::{AdapterConfig, CableConfig, DEFAULT_TOPIC_PREFIX},
    connection::DEFAULT_SEND_QUEUE,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the cable endpoint with the demo chat channel.
    Serve(ServeArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Deliver broadcasts inside this process only.
    InProcess,
    /// Route broadcasts through an in-process pub/sub hub.
    Memory,
    /// Route broadcasts through Redis pub/sub (needs the `redis` feature).
    Redis,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3334")]
    pub listen: SocketAddr,

    /// Path the websocket endpoint is mounted at.
    #[arg(long, default_value = "/cable")]
    pub path: String,

    /// Broadcast fan-out strategy.
    #[arg(long, value_enum, default_value_t = AdapterKind::InProcess)]
    pub adapter: AdapterKind,

    /// Redis URL for `--adapter redis`.
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix for pub/sub topics.
    #[arg(long, default_value = DEFAULT_TOPIC_PREFIX)]
    pub topic_prefix: String,

    /// Seconds between keepalive pings; 0 disables them.
    #[arg(long, default_value_t = 3)]
    pub ping_interval: u64,

    /// Seconds to wait for sockets to close on shutdown.
    #[arg(long, default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Frames buffered per client before writes to it are dropped.
    #[arg(long, default_value_t = DEFAULT_SEND_QUEUE)]
    pub send_queue: usize,
}

impl From<ServeArgs> for CableConfig {
    fn from(args: ServeArgs) -> Self {
        let adapter = match args.adapter {
            AdapterKind::InProcess => AdapterConfig::InProcess,
            AdapterKind::Memory => AdapterConfig::Memory {
                topic_prefix: args.topic_prefix,
            },
            AdapterKind::Redis => AdapterConfig::Redis {
                url: args.redis_url,
                topic_prefix: args.topic_prefix,
            },
        };

        CableConfig {
            path: args.path,
            ping_interval_secs: args.ping_interval,
            shutdown_timeout_secs: args.shutdown_timeout,
            send_queue: args.send_queue,
            adapter,
        }
    }
}
