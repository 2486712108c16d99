//! agentscope
//!
//! Local monitor endpoint for autonomous agent sessions. Agents stream
//! session events over a WebSocket; legacy tools POST one-shot
//! notifications to the same port.

mod config;
mod connection;
mod frame;
mod handshake;
mod http;
mod logging;
mod paths;
mod registry;
mod registry_actor;
mod registry_command;
mod router;
mod server;

use clap::Parser;
use tracing::info;

use crate::config::Cli;
use crate::logging::init_logging;
use crate::registry_actor::{spawn_event_log, RegistryHandle};
use crate::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs()?;
    let logging = init_logging()?;

    let config = cli.server_config();
    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        bind = %config.bind,
        "Starting agentscope"
    );

    let registry = RegistryHandle::spawn();
    spawn_event_log(registry.subscribe());

    let server = Server::bind(config, registry).await?;
    println!("agentscope listening on {}", server.local_addr()?);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(
                    component = "server",
                    event = "server.signal_failed",
                    error = %e,
                    "Could not listen for ctrl-c"
                );
                std::future::pending::<()>().await;
            }
        })
        .await?;

    drop(logging);
    Ok(())
}
