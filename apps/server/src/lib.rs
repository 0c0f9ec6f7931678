//! tunnelforge relay server
//!
//! Runs two listeners sharing one registry: the control listener, where tunnel
//! clients connect and register their session, and the public listener, where
//! end users connect and get routed to a session by the `Host:` header.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};
use tunnelforge_common::SubdomainGenerator;
use tunnelforge_common::constants::{DEFAULT_CONTROL_PORT, DEFAULT_PUBLIC_PORT, TOKEN_LENGTH};

pub mod handlers;
pub mod registry;

pub use registry::{Registry, RouteError, SessionSummary};

/// Session every client shares when subdomain routing is disabled
pub const DEFAULT_SESSION: &str = "";

/// Routing options, as passed by the management API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Route public connections by the first label of their `Host:` header
    pub use_subdomains: bool,

    /// Derive a token per client instead of handing out the static one
    pub generate_subdomains: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            use_subdomains: true,
            generate_subdomains: true,
        }
    }
}

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control listener binds to
    pub client_host: String,
    pub client_port: u16,

    /// Address the public listener binds to
    pub incoming_host: String,
    pub incoming_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_host: "0.0.0.0".to_string(),
            client_port: DEFAULT_CONTROL_PORT,
            incoming_host: "127.0.0.1".to_string(),
            incoming_port: DEFAULT_PUBLIC_PORT,
        }
    }
}

/// State shared by every connection of a running server
#[derive(Debug)]
pub struct ServerState {
    pub registry: Registry,
    pub options: ServerOptions,
    pub generator: SubdomainGenerator,
}

impl ServerState {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            registry: Registry::new(),
            options,
            generator: SubdomainGenerator::new(options.generate_subdomains, TOKEN_LENGTH),
        }
    }
}

pub struct TunnelServer {
    config: ServerConfig,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind both listeners and start accepting connections
    pub async fn start(&self, options: ServerOptions) -> Result<ServerHandle> {
        let control_listener =
            TcpListener::bind((self.config.client_host.as_str(), self.config.client_port))
                .await
                .with_context(|| {
                    format!(
                        "Failed to bind control listener on {}:{}",
                        self.config.client_host, self.config.client_port
                    )
                })?;
        let public_listener =
            TcpListener::bind((self.config.incoming_host.as_str(), self.config.incoming_port))
                .await
                .with_context(|| {
                    format!(
                        "Failed to bind public listener on {}:{}",
                        self.config.incoming_host, self.config.incoming_port
                    )
                })?;

        let control_addr = control_listener.local_addr()?;
        let public_addr = public_listener.local_addr()?;
        info!("Control server is running on {}", control_addr);
        info!("Public server is running on {}", public_addr);

        let state = Arc::new(ServerState::new(options));

        let tasks = vec![
            tokio::spawn(accept_loop(
                control_listener,
                state.clone(),
                "control",
                handlers::handle_control_connection,
            )),
            tokio::spawn(accept_loop(
                public_listener,
                state.clone(),
                "public",
                handlers::handle_public_connection,
            )),
        ];

        Ok(ServerHandle {
            control_addr,
            public_addr,
            state,
            tasks,
        })
    }
}

/// A running server; dropping it does not stop the listeners, call `shutdown`
pub struct ServerHandle {
    control_addr: SocketAddr,
    public_addr: SocketAddr,
    state: Arc<ServerState>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// Stop both listeners and every connection they accepted
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        self.state.registry.clear();
        info!("Server stopped");
    }

    /// Run until the listeners stop
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    state: Arc<ServerState>,
    kind: &'static str,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr, Arc<ServerState>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    // Connection tasks live in the set so aborting this loop aborts them too
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let _ = socket.set_nodelay(true);
                    connections.spawn(handler(socket, peer, state.clone()));
                }
                Err(e) => warn!("Failed to accept {} connection: {}", kind, e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}
