//! Single-writer outbound queue for a socket
//!
//! Every socket has exactly one task writing to it. Producers hand it encoded frames
//! through a bounded channel, so a producer is suspended while the socket is not
//! draining. Producers that need to know when their bytes actually reached the socket
//! ask for an acknowledgement.

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::protocol::{WireRecord, encode_frame};

/// Bytes queued for the writer task, with an optional completion signal
#[derive(Debug)]
pub struct OutboundFrame {
    pub bytes: Vec<u8>,
    pub ack: Option<oneshot::Sender<io::Result<()>>>,
}

/// Cloneable handle feeding a control socket's writer task
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<OutboundFrame>,
}

impl FrameSender {
    /// Queue a record; waits only while the queue is full
    pub async fn send(&self, record: WireRecord) -> Result<()> {
        let bytes = encode_frame(&record)?;
        self.tx
            .send(OutboundFrame { bytes, ack: None })
            .await
            .map_err(|_| TunnelError::ConnectionError("control socket closed".to_string()))
    }

    /// Queue a record and wait until it has been written to the socket
    pub async fn send_flushed(&self, record: WireRecord) -> Result<()> {
        let bytes = encode_frame(&record)?;
        let (ack_tx, ack_rx) = oneshot::channel();

        self.tx
            .send(OutboundFrame {
                bytes,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| TunnelError::ConnectionError("control socket closed".to_string()))?;

        match ack_rx.await {
            Ok(result) => result.map_err(TunnelError::from),
            Err(_) => Err(TunnelError::ConnectionError(
                "control socket closed before write completed".to_string(),
            )),
        }
    }

    /// The writer task has stopped, the socket is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn same_channel(&self, other: &FrameSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Spawn the writer task owning `writer`
///
/// The task exits when every sender is dropped or a write fails.
pub fn spawn_frame_writer<W>(mut writer: W, capacity: usize) -> (FrameSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(capacity);

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = writer.write_all(&frame.bytes).await;
            let failed = result.is_err();

            if let Err(ref e) = result {
                debug!("Frame write failed: {}", e);
            }

            if let Some(ack) = frame.ack {
                let _ = ack.send(result);
            }

            if failed {
                break;
            }
        }

        let _ = writer.shutdown().await;
        debug!("Frame writer exiting");
    });

    (FrameSender { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientMessage;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (sender, handle) = spawn_frame_writer(client, 8);

        sender.send(ClientMessage::Ping.to_record()).await.unwrap();
        sender
            .send_flushed(
                ClientMessage::Resume {
                    token: "t".to_string(),
                }
                .to_record(),
            )
            .await
            .unwrap();
        drop(sender);
        handle.await.unwrap();

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"1\":6}\n{\"1\":5,\"3\":\"t\"}\n");
    }

    #[tokio::test]
    async fn test_closed_after_peer_drop() {
        let (client, server) = tokio::io::duplex(16);
        let (sender, handle) = spawn_frame_writer(client, 8);
        drop(server);

        let result = sender.send_flushed(ClientMessage::Ping.to_record()).await;
        assert!(result.is_err());

        handle.await.unwrap();
        assert!(sender.is_closed());
        assert!(sender.send(ClientMessage::Ping.to_record()).await.is_err());
    }
}
