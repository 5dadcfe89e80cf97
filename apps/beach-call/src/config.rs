use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub media_server_url: String,
    pub media_rpc_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let media_server_url = cli.media_server_url.trim().to_string();
        if !(media_server_url.starts_with("ws://") || media_server_url.starts_with("wss://")) {
            bail!("media server url must use ws:// or wss://: {}", media_server_url);
        }
        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be at least one second");
        }

        Ok(Config {
            listen_addr,
            media_server_url,
            media_rpc_timeout: Duration::from_secs(cli.media_rpc_timeout_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
