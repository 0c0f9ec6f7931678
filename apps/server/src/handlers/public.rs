//! Public listener - end-user connections ("app1" sockets)
//!
//! Each accepted socket becomes a stream with a fresh random name. The first read is
//! inspected for a `Host:` header to pick the session; every read is then forwarded to
//! that session's control socket as DATA_FROM_APP1. Bytes coming back from the client
//! are written by a dedicated task so the control reader never blocks on a socket.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tunnelforge_common::constants::{READ_BUFFER_SIZE, STREAM_QUEUE_CAPACITY, TOKEN_LENGTH};
use tunnelforge_common::{ServerMessage, extract_subdomain, generate_unique_string};

use crate::{DEFAULT_SESSION, ServerOptions, ServerState};

/// Session token a public connection is routed to, decided from its first bytes
pub fn route_token(first_read: &[u8], options: &ServerOptions) -> Option<String> {
    if !options.use_subdomains {
        return Some(DEFAULT_SESSION.to_string());
    }
    extract_subdomain(first_read)
}

/// Handle one public connection until either side closes it
pub async fn handle_public_connection(socket: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
    let name = generate_unique_string(TOKEN_LENGTH);
    debug!(stream = %name, %peer, "Public connection accepted");

    let (mut reader, writer) = socket.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_QUEUE_CAPACITY);
    tokio::spawn(write_public(rx, writer, name.clone()));

    let mut token: Option<String> = None;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!(stream = %name, "App1 disconnected");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                info!(stream = %name, "App1 error: {}", e);
                break;
            }
        };
        let data = Bytes::copy_from_slice(&buf[..n]);

        let session = match token.as_deref() {
            Some(session) => session.to_string(),
            None => match route_token(&data, &state.options) {
                Some(session) => {
                    token = Some(session.clone());
                    session
                }
                None => {
                    info!(stream = %name, %peer, "No Host header, closing public connection");
                    break;
                }
            },
        };

        let control = match state.registry.route_public(&session, &name, &tx) {
            Ok(control) => control,
            Err(e) => {
                info!(stream = %name, token = %session, "Closing public connection: {}", e);
                break;
            }
        };

        let message = ServerMessage::DataFromApp1 {
            name: name.clone(),
            token: session,
            data,
        };

        // Waits while the control socket's queue is full, pausing this reader
        if let Err(e) = control.send(message.to_record()).await {
            info!(stream = %name, "Control connection lost: {}", e);
            break;
        }
    }

    if let Some(session) = token {
        state.registry.remove_stream(&session, &name);
    }
    debug!(stream = %name, "App1 connection closed");
}

async fn write_public(mut rx: mpsc::Receiver<Bytes>, mut writer: OwnedWriteHalf, name: String) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(stream = %name, "Write to public socket failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_token_uses_host_label() {
        let options = ServerOptions {
            use_subdomains: true,
            generate_subdomains: true,
        };
        let token = route_token(b"GET / HTTP/1.1\r\nHost: abc.localhost:4000\r\n\r\n", &options);
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_route_token_requires_host_with_subdomains() {
        let options = ServerOptions {
            use_subdomains: true,
            generate_subdomains: false,
        };
        assert_eq!(route_token(b"\x00\x01raw tcp", &options), None);
    }

    #[test]
    fn test_route_token_ignores_host_without_subdomains() {
        let options = ServerOptions {
            use_subdomains: false,
            generate_subdomains: false,
        };
        let token = route_token(b"GET / HTTP/1.1\r\nHost: abc.localhost\r\n\r\n", &options);
        assert_eq!(token.as_deref(), Some(DEFAULT_SESSION));
        assert_eq!(route_token(b"raw", &options).as_deref(), Some(DEFAULT_SESSION));
    }
}
