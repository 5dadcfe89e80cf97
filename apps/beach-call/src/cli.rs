use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "beach-call",
    author,
    version,
    about = "Beach call signaling server backed by a Kurento media server"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_CALL_LISTEN_ADDR", default_value = "0.0.0.0:6008")]
    pub listen_addr: String,

    /// JSON-RPC websocket URL of the media server.
    #[arg(
        long,
        env = "BEACH_CALL_MEDIA_SERVER_URL",
        default_value = "ws://localhost:8888/kurento"
    )]
    pub media_server_url: String,

    /// Maximum time to wait for a single media server request.
    #[arg(long, env = "BEACH_CALL_MEDIA_RPC_TIMEOUT_SECS", default_value_t = 10)]
    pub media_rpc_timeout_secs: u64,

    /// Sessions silent for longer than this are disconnected.
    #[arg(long, env = "BEACH_CALL_HEARTBEAT_TIMEOUT_SECS", default_value_t = 600)]
    pub heartbeat_timeout_secs: u64,

    /// How often connections are pinged and scanned for staleness.
    #[arg(long, env = "BEACH_CALL_HEARTBEAT_INTERVAL_SECS", default_value_t = 60)]
    pub heartbeat_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_CALL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}
