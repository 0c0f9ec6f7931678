use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunnelforge_common::constants::{DEFAULT_CONTROL_PORT, DEFAULT_PUBLIC_PORT};
use tunnelforge_server::{ServerConfig, ServerOptions, TunnelServer};

/// CLI arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "tfs")]
#[command(about = "Public relay for tunnelforge clients", long_about = None)]
#[command(version)]
struct Args {
    /// Address the control listener binds to
    #[arg(long, env = "SERVER_CLIENT_HOST", default_value = "0.0.0.0")]
    client_host: String,

    /// Port tunnel clients connect to
    #[arg(long, env = "CLIENT_SERVER_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    client_port: u16,

    /// Address the public listener binds to
    #[arg(long, env = "SERVER_INCOMING_HOST", default_value = "127.0.0.1")]
    incoming_host: String,

    /// Port end users connect to
    #[arg(long, env = "INCOMING_SERVER_PORT", default_value_t = DEFAULT_PUBLIC_PORT)]
    incoming_port: u16,

    /// Route every public connection to a single shared session
    #[arg(long)]
    no_subdomains: bool,

    /// Hand out a generated token per client instead of the static one
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    generate_subdomains: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            client_host: self.client_host.clone(),
            client_port: self.client_port,
            incoming_host: self.incoming_host.clone(),
            incoming_port: self.incoming_port,
        }
    }

    fn options(&self) -> ServerOptions {
        ServerOptions {
            use_subdomains: !self.no_subdomains,
            generate_subdomains: self.generate_subdomains,
        }
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

    info!("tunnelforge server v{}", env!("CARGO_PKG_VERSION"));

    let server = TunnelServer::new(args.config());
    let handle = server.start(args.options()).await?;

    info!(
        "Server is running on {} (clients) and {} (public)",
        handle.control_addr(),
        handle.public_addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down gracefully...");
    handle.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["tfs"]);
        let config = args.config();
        assert_eq!(config.client_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.incoming_port, DEFAULT_PUBLIC_PORT);
        assert_eq!(args.options(), ServerOptions::default());
    }

    #[test]
    fn test_routing_flags() {
        let args = Args::parse_from(["tfs", "--no-subdomains", "--generate-subdomains", "false"]);
        let options = args.options();
        assert!(!options.use_subdomains);
        assert!(!options.generate_subdomains);
    }
}
