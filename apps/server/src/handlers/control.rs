//! Control listener - tunnel client connections
//!
//! Decodes the client's frames, assigns session tokens, binds the socket to its
//! session on RESUME / SUBDOMAIN_REGISTERED and relays DATA_FROM_APP2 chunks to the
//! public socket of their stream.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tunnelforge_common::constants::{CONTROL_QUEUE_CAPACITY, READ_BUFFER_SIZE};
use tunnelforge_common::{
    ClientMessage, FrameAccumulator, FrameSender, Result, ServerMessage, spawn_frame_writer,
};

use crate::{DEFAULT_SESSION, ServerState};

/// Handle one control connection until it closes
pub async fn handle_control_connection(
    socket: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) {
    info!(%peer, "Client connected");

    let (mut reader, writer) = socket.into_split();
    let (control, writer_task) = spawn_frame_writer(writer, CONTROL_QUEUE_CAPACITY);
    let mut accumulator = FrameAccumulator::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!(%peer, "Client disconnected");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(%peer, "Client error: {}", e);
                break;
            }
        };

        let Ok(messages) = accumulator.push::<ClientMessage>(&buf[..n]) else {
            continue;
        };

        for message in messages {
            match message {
                Ok(message) => {
                    if let Err(e) = handle_client_message(message, peer, &control, &state).await {
                        warn!(%peer, "Failed to handle client message: {}", e);
                    }
                }
                Err(e) => warn!(%peer, "Rejected control frame: {}", e),
            }
        }
    }

    // Mark the control socket as destroyed for every session still pointing at it
    writer_task.abort();
    info!(%peer, "Client connection closed");
}

/// Session key a client-supplied token maps to
fn session_key(token: String, state: &ServerState) -> Option<String> {
    if !state.options.use_subdomains {
        Some(DEFAULT_SESSION.to_string())
    } else if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

async fn handle_client_message(
    message: ClientMessage,
    peer: SocketAddr,
    control: &FrameSender,
    state: &ServerState,
) -> Result<()> {
    match message {
        ClientMessage::Ping => {
            control.send(ServerMessage::PingOk.to_record()).await?;
        }

        ClientMessage::Connected { local_address } => {
            let salt = format!("{}{}{}", peer.ip(), peer.port(), local_address);
            let token = if state.options.use_subdomains {
                state.generator.session_token(&salt)
            } else {
                DEFAULT_SESSION.to_string()
            };

            info!(%peer, local = %local_address, token = %token, "Registering subdomain");
            control
                .send(ServerMessage::RegisterSubdomain { token }.to_record())
                .await?;
        }

        ClientMessage::Resume { token } => {
            let Some(key) = session_key(token, state) else {
                warn!(%peer, "RESUME without a session token ignored");
                return Ok(());
            };
            let resumed = state.registry.bind_control(&key, control.clone());
            info!(%peer, token = %key, resumed, "Session resumed");
        }

        ClientMessage::SubdomainRegistered { token } => {
            let Some(key) = session_key(token, state) else {
                warn!(%peer, "SUBDOMAIN_REGISTERED without a session token ignored");
                return Ok(());
            };
            state.registry.bind_control(&key, control.clone());
            info!(%peer, token = %key, "Session registered");
        }

        ClientMessage::DataFromApp2 { name, token, data } => {
            let key = session_key(token, state).unwrap_or_default();

            let Some(public) = state.registry.lookup_stream(&key, &name) else {
                debug!(stream = %name, "No public connection for stream, dropping chunk");
                return Ok(());
            };

            // Waits while the public socket is behind, which stops reading this control socket
            if public.send(data).await.is_err() {
                debug!(stream = %name, "Public connection closed, dropping chunk");
            }
        }
    }

    Ok(())
}
