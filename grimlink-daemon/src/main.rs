//! grimlink: relays a Blood on the Clocktower grimoire to a Twitch extension.
//!
//! Loads the layered configuration, starts the channel server and runs
//! until Ctrl-C. Verbosity follows `RUST_LOG`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use grimlink_sync::{BroadcasterId, HelixApi, Relay, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Broadcaster to publish for until one signs in over the control channel.
    #[arg(long)]
    broadcaster: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let mut config = RelayConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(broadcaster) = args.broadcaster {
        config.broadcaster_id = Some(BroadcasterId::new(broadcaster));
    }
    info!("Starting grimlink with {config:?}");

    let api = HelixApi::new(config.api_base_url.clone(), config.extension.clone())
        .context("creating extension API client")?;
    let relay = Relay::new(config, Arc::new(api)).spawn().await?;

    tokio::select! {
        result = relay.wait() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("Shutting down");
        }
    }
    Ok(())
}
