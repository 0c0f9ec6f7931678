//! Control connection lifecycle
//!
//! The client keeps one control connection to the server, reconnecting with
//! backoff whenever it drops. The session token survives reconnects, so every
//! connection after the first one resumes the session instead of asking for a new
//! token.

use anyhow::Result;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tunnelforge_common::constants::{
    CONTROL_QUEUE_CAPACITY, KEEPALIVE_TIMEOUT_FACTOR, READ_BUFFER_SIZE,
};
use tunnelforge_common::{
    ClientMessage, FrameAccumulator, FrameSender, ServerMessage, TunnelError,
    resolve_container_host, spawn_frame_writer,
};

use crate::config::ClientConfig;
use crate::local::LocalConnections;
use crate::reconnect::ReconnectState;
use crate::writer::OrderedStreamWriter;

/// Connection state tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// `token` is `None` until the server has assigned one
    Connected {
        token: Option<String>,
    },
    Reconnecting {
        attempt: usize,
        next_delay: Duration,
    },
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connected { token: Some(_) })
    }
}

/// Tunnel client: owns the control connection and the local connections behind it
pub struct TunnelClient {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    token: watch::Sender<Option<String>>,
    writer: watch::Sender<Option<OrderedStreamWriter>>,
    locals: LocalConnections,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (token, _) = watch::channel(None);
        let (writer, writer_rx) = watch::channel(None);
        let locals = LocalConnections::new(config.local_target(), writer_rx);

        Self {
            config,
            state,
            token,
            writer,
            locals,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Session token currently held, if the server assigned one
    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    pub fn local_connections(&self) -> &LocalConnections {
        &self.locals
    }

    /// Main run loop with automatic reconnection; never returns on its own
    pub async fn run(&self) -> Result<()> {
        let mut reconnect = ReconnectState::new(self.config.reconnect.clone());
        let mut attempt = 0;

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            match self.establish_connection().await {
                Ok(socket) => {
                    if reconnect.is_reconnecting() {
                        info!("Reconnected after {} attempt(s)", attempt);
                    }
                    reconnect.reset();
                    attempt = 0;

                    if let Err(e) = self.handle_connection(socket).await {
                        error!("Connection error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to connect: {}", e);
                }
            }

            attempt += 1;
            let delay = reconnect.next_delay();
            self.state.send_replace(ConnectionState::Reconnecting {
                attempt,
                next_delay: delay,
            });

            info!(
                "Attempting to reconnect in {:.2} seconds... (attempt {})",
                delay.as_secs_f64(),
                attempt
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn establish_connection(&self) -> Result<TcpStream> {
        let host = resolve_container_host(
            &self.config.server_host,
            self.config.container_alias.as_deref(),
        )
        .await;
        debug!("Connecting to {}:{}", host, self.config.server_port);

        let socket = TcpStream::connect((host.as_str(), self.config.server_port))
            .await
            .map_err(|e| TunnelError::ConnectionError(e.to_string()))?;
        let _ = socket.set_nodelay(true);

        info!(
            "Connected to proxy server at {}:{}",
            self.config.server_host, self.config.server_port
        );
        Ok(socket)
    }

    /// Serve one control connection until it drops or the keepalive expires
    async fn handle_connection(&self, socket: TcpStream) -> Result<()> {
        let (reader, writer) = socket.into_split();
        let (control, writer_task) = spawn_frame_writer(writer, CONTROL_QUEUE_CAPACITY);

        let result = self.serve(reader, &control).await;

        // Local readers wait for the next connection's writer
        self.writer.send_replace(None);
        writer_task.abort();
        self.state.send_replace(ConnectionState::Disconnected);

        result
    }

    async fn serve(&self, mut reader: OwnedReadHalf, control: &FrameSender) -> Result<()> {
        match self.token() {
            Some(token) => {
                info!(token = %token, "Resuming session");
                self.install_writer(control);
                control
                    .send(ClientMessage::Resume { token: token.clone() }.to_record())
                    .await?;
                self.state.send_replace(ConnectionState::Connected { token: Some(token) });
            }
            None => {
                info!("Connecting...");
                let local_address = self.config.local_target().announced_address();
                control
                    .send(ClientMessage::Connected { local_address }.to_record())
                    .await?;
                self.state.send_replace(ConnectionState::Connected { token: None });
            }
        }

        let ping_interval = self.config.ping_interval;
        let deadline = ping_interval.mul_f64(KEEPALIVE_TIMEOUT_FACTOR);
        let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_ping_ok = Instant::now();

        let mut accumulator = FrameAccumulator::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            info!("Disconnected from proxy server");
                            return Ok(());
                        }
                        Ok(n) => n,
                        Err(e) => return Err(TunnelError::from(e).into()),
                    };

                    let Ok(messages) = accumulator.push::<ServerMessage>(&buf[..n]) else {
                        continue;
                    };

                    for message in messages {
                        match message {
                            Ok(message) => {
                                self.handle_server_message(message, control, &mut last_ping_ok)
                                    .await?;
                            }
                            Err(e) => warn!("Rejected server frame: {}", e),
                        }
                    }
                }

                _ = ticker.tick() => {
                    control.send(ClientMessage::Ping.to_record()).await?;
                    debug!("Sent ping");

                    if last_ping_ok.elapsed() > deadline {
                        warn!("No PING_OK for {:?}, dropping connection", last_ping_ok.elapsed());
                        return Err(TunnelError::Timeout.into());
                    }
                }
            }
        }
    }

    fn install_writer(&self, control: &FrameSender) {
        let writer = OrderedStreamWriter::new(control.clone(), self.token.subscribe());
        self.writer.send_replace(Some(writer));
    }

    /// Hold `token` from now on; returns whether it changed
    fn adopt_token(&self, token: &str) -> bool {
        self.token.send_if_modified(|held| {
            if held.as_deref() == Some(token) {
                false
            } else {
                *held = Some(token.to_string());
                true
            }
        })
    }

    async fn handle_server_message(
        &self,
        message: ServerMessage,
        control: &FrameSender,
        last_ping_ok: &mut Instant,
    ) -> Result<()> {
        match message {
            ServerMessage::PingOk => {
                *last_ping_ok = Instant::now();
                debug!("Received PING_OK");
            }

            ServerMessage::RegisterSubdomain { token } => {
                self.adopt_token(&token);
                self.install_writer(control);

                control
                    .send(ClientMessage::SubdomainRegistered { token: token.clone() }.to_record())
                    .await?;

                info!("Your public address is {}", self.config.public_url(&token));
                self.state.send_replace(ConnectionState::Connected { token: Some(token) });
            }

            ServerMessage::DataFromApp1 { name, token, data } => {
                if self.adopt_token(&token) {
                    debug!(token = %token, "Adopted session token from data frame");
                }

                if let Err(e) = self.locals.deliver(&name, data).await {
                    warn!(stream = %name, "Failed to deliver to App2: {}", e);
                }
            }

            ServerMessage::ChunkAcknowledge { name, chunk_number } => {
                debug!(?name, ?chunk_number, "Ignoring CHUNK_AKNOWLEDGE");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_client_is_disconnected() {
        let client = TunnelClient::new(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.token(), None);
        assert!(client.local_connections().is_empty());
    }

    #[test]
    fn test_connection_state_variants() {
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Connected { token: None }.is_active());
        assert!(ConnectionState::Connected {
            token: Some(String::new())
        }
        .is_active());

        let state = ConnectionState::Reconnecting {
            attempt: 1,
            next_delay: Duration::from_secs(1),
        };
        assert!(matches!(state, ConnectionState::Reconnecting { .. }));
    }

    #[test]
    fn test_adopt_token_notifies_once() {
        let client = TunnelClient::new(ClientConfig::default());
        let mut rx = client.token.subscribe();

        assert!(client.adopt_token("abc"));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        assert!(!client.adopt_token("abc"));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(client.token().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TunnelClient::new(ClientConfig {
            server_port: port,
            container_alias: None,
            reconnect: crate::reconnect::ReconnectConfig::with_interval(Duration::from_millis(10)),
            ..ClientConfig::default()
        });

        let mut states = client.subscribe();
        let run = client.run();
        tokio::pin!(run);

        let reconnecting = async {
            states
                .wait_for(|state| {
                    matches!(state, ConnectionState::Reconnecting { attempt, .. } if *attempt >= 2)
                })
                .await
                .map(|_| ())
        };

        tokio::select! {
            result = &mut run => panic!("run exited: {:?}", result),
            seen = tokio::time::timeout(Duration::from_secs(5), reconnecting) => {
                assert!(seen.unwrap().is_ok());
            }
        }
    }
}
