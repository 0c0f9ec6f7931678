use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunnelforge_client::{ClientConfig, ReconnectConfig, TunnelClient};
use tunnelforge_common::constants::{
    CONTAINER_HOST_ALIAS, DEFAULT_CONTROL_PORT, DEFAULT_PUBLIC_PORT, PING_INTERVAL_MS,
    RECONNECT_DEFAULT_INTERVAL_MS,
};

/// CLI arguments for the tunnel client
#[derive(Parser, Debug)]
#[command(name = "tfc")]
#[command(about = "Expose a local TCP service through a tunnelforge server", long_about = None)]
#[command(version)]
struct Args {
    /// tunnelforge server host
    #[arg(long, env = "CLIENT_PARAM_SERVER_HOST", default_value = "127.0.0.1")]
    server_host: String,

    /// tunnelforge server control port
    #[arg(long, env = "CLIENT_PARAM_SERVER_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    server_port: u16,

    /// Local service host
    #[arg(long, env = "CLIENT_PARAM_LOCAL_APP_HOST", default_value = "127.0.0.1")]
    local_host: String,

    /// Local service port
    #[arg(short = 'p', long, env = "CLIENT_PARAM_LOCAL_APP_PORT", default_value_t = 8080)]
    local_port: u16,

    /// Public host of the server, used to print the public address
    #[arg(long, env = "PROXY_SERVER_MAIN_HOST", default_value = "127.0.0.1")]
    public_host: String,

    /// Public port of the server
    #[arg(long, env = "INCOMING_SERVER_PORT", default_value_t = DEFAULT_PUBLIC_PORT)]
    public_port: u16,

    /// Base reconnect interval in milliseconds
    #[arg(
        long,
        env = "RECONNECT_INTERVAL",
        default_value_t = RECONNECT_DEFAULT_INTERVAL_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    reconnect_interval: u64,

    /// Keepalive interval in milliseconds
    #[arg(long, default_value_t = PING_INTERVAL_MS, value_parser = clap::value_parser!(u64).range(1..))]
    ping_interval: u64,

    /// JSON config file overriding the values above
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig {
            server_host: self.server_host.clone(),
            server_port: self.server_port,
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            public_host: self.public_host.clone(),
            public_port: self.public_port,
            ping_interval: Duration::from_millis(self.ping_interval),
            reconnect: ReconnectConfig::with_interval(Duration::from_millis(
                self.reconnect_interval,
            )),
            container_alias: Some(CONTAINER_HOST_ALIAS.to_string()),
        };

        if let Some(path) = &self.config {
            config.load_file(path)?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = args.client_config()?;

    info!("tunnelforge client v{}", env!("CARGO_PKG_VERSION"));
    info!("Local service: {}:{}", config.local_host, config.local_port);
    info!("Tunnel server: {}:{}", config.server_host, config.server_port);

    let client = TunnelClient::new(config);

    tokio::select! {
        result = client.run() => {
            error!("Tunnel client exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
            client.local_connections().close_all();
        }
    }

    Ok(())
}
