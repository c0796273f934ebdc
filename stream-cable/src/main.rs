use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use stream_cable::{
    chat,
    cli::{Cli, Command},
    config::CableConfig,
    scheduler::Scheduler,
    server::CableServer,
    Cable,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let config = CableConfig::from(args);
            let cable = Cable::action_cable(config, chat::registry(), Scheduler::current()).await?;
            let path = cable.config().path.clone();

            let server = CableServer::new(listener, Arc::new(cable));
            let addr = server.local_addr()?;
            info!("cable listening on ws://{}{}", addr, path);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("cable exited with error: {err:?}");
                return Err(err);
            }
        }
    }

    Ok(())
}
