//! Connections to the local service ("app2" sockets)
//!
//! One local connection per stream name, opened lazily on the first
//! DATA_FROM_APP1 for that name. Bytes from the server are written by a per
//! connection task fed by a bounded channel; bytes read from the local service are
//! handed to the control connection's current ordered writer, and the reader waits
//! for each block to reach the control socket before reading again.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use tunnelforge_common::constants::{READ_BUFFER_SIZE, STREAM_QUEUE_CAPACITY};
use tunnelforge_common::{Result, TunnelError, resolve_container_host};

use crate::writer::OrderedStreamWriter;

/// Where local connections are opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
    /// Substituted for a loopback `host` when it resolves
    pub container_alias: Option<String>,
}

impl LocalTarget {
    /// The "host:port" announced to the server in CONNECTED
    pub fn announced_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct LocalStream {
    id: u64,
    tx: mpsc::Sender<Bytes>,
    reader: AbortHandle,
    writer: AbortHandle,
}

struct LocalInner {
    target: LocalTarget,
    streams: DashMap<String, LocalStream>,
    writer: watch::Receiver<Option<OrderedStreamWriter>>,
    ids: AtomicU64,
}

#[derive(Clone)]
pub struct LocalConnections {
    inner: Arc<LocalInner>,
}

impl LocalConnections {
    /// `writer` holds the ordered writer of the live control connection, if any
    pub fn new(target: LocalTarget, writer: watch::Receiver<Option<OrderedStreamWriter>>) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                target,
                streams: DashMap::new(),
                writer,
                ids: AtomicU64::new(0),
            }),
        }
    }

    /// Forward bytes from the server to the local connection of `name`, opening it if needed
    ///
    /// Waits while the local socket is not draining.
    pub async fn deliver(&self, name: &str, data: Bytes) -> Result<()> {
        let tx = match self.sender(name) {
            Some(tx) => tx,
            None => self.open(name).await?,
        };

        tx.send(data)
            .await
            .map_err(|_| TunnelError::StreamClosed(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.streams.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.streams.is_empty()
    }

    /// Close every local connection
    pub fn close_all(&self) {
        let names: Vec<(String, u64)> = self
            .inner
            .streams
            .iter()
            .map(|entry| (entry.key().clone(), entry.id))
            .collect();

        for (name, id) in names {
            self.inner.teardown(&name, id);
        }
    }

    fn sender(&self, name: &str) -> Option<mpsc::Sender<Bytes>> {
        self.inner.streams.get(name).map(|stream| stream.tx.clone())
    }

    async fn open(&self, name: &str) -> Result<mpsc::Sender<Bytes>> {
        let target = &self.inner.target;
        let host = resolve_container_host(&target.host, target.container_alias.as_deref()).await;

        let socket = TcpStream::connect((host.as_str(), target.port))
            .await
            .map_err(|e| {
                TunnelError::LocalServiceUnavailable(format!("{}:{}: {}", host, target.port, e))
            })?;
        let _ = socket.set_nodelay(true);
        info!(stream = %name, "Connected to App2");

        let (reader, writer) = socket.into_split();
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        let id = self.inner.ids.fetch_add(1, Ordering::Relaxed);

        // Registered under the entry guard so a task ending right away finds its own entry
        match self.inner.streams.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().tx.clone()),
            Entry::Vacant(slot) => {
                let inner = self.inner.clone();
                let reader =
                    tokio::spawn(inner.clone().pump_local(name.to_string(), id, reader))
                        .abort_handle();
                let writer = tokio::spawn(inner.write_local(name.to_string(), id, rx, writer))
                    .abort_handle();

                slot.insert(LocalStream {
                    id,
                    tx: tx.clone(),
                    reader,
                    writer,
                });
                Ok(tx)
            }
        }
    }
}

impl LocalInner {
    /// Remove the stream and drop everything still queued for it
    fn teardown(&self, name: &str, id: u64) {
        let Some((_, stream)) = self.streams.remove_if(name, |_, stream| stream.id == id) else {
            return;
        };

        stream.reader.abort();
        stream.writer.abort();

        if let Some(writer) = self.writer.borrow().as_ref() {
            writer.purge(name);
        }
        debug!(stream = %name, "App2 connection closed");
    }

    /// Writer of the live control connection, waiting while reconnecting
    async fn current_writer(&self) -> Option<OrderedStreamWriter> {
        let mut slot = self.writer.clone();
        slot.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|writer| writer.clone())
    }

    async fn pump_local(self: Arc<Self>, name: String, id: u64, mut reader: OwnedReadHalf) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(stream = %name, "App2 ended");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(stream = %name, "App2 socket error: {}", e);
                    break;
                }
            };

            let Some(writer) = self.current_writer().await else {
                break;
            };

            if let Err(e) = writer.enqueue(&name, Bytes::copy_from_slice(&buf[..n])).await {
                debug!(stream = %name, "Dropping App2 connection: {}", e);
                break;
            }
        }

        self.teardown(&name, id);
    }

    async fn write_local(
        self: Arc<Self>,
        name: String,
        id: u64,
        mut rx: mpsc::Receiver<Bytes>,
        mut writer: OwnedWriteHalf,
    ) {
        while let Some(data) = rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                warn!(stream = %name, "App2 write failed: {}", e);
                self.teardown(&name, id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn echo_target() -> LocalTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        LocalTarget {
            host: "127.0.0.1".to_string(),
            port,
            container_alias: None,
        }
    }

    #[test]
    fn test_announced_address() {
        let target = LocalTarget {
            host: "localhost".to_string(),
            port: 8080,
            container_alias: None,
        };
        assert_eq!(target.announced_address(), "localhost:8080");
    }

    #[tokio::test]
    async fn test_deliver_opens_connection_once() {
        let (_slot, rx) = watch::channel(None);
        let locals = LocalConnections::new(echo_target().await, rx);

        locals.deliver("s1", Bytes::from_static(b"one")).await.unwrap();
        locals.deliver("s1", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(locals.len(), 1);
        assert!(locals.contains("s1"));

        locals.deliver("s2", Bytes::from_static(b"three")).await.unwrap();
        assert_eq!(locals.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_local_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_slot, rx) = watch::channel(None);
        let locals = LocalConnections::new(
            LocalTarget {
                host: "127.0.0.1".to_string(),
                port,
                container_alias: None,
            },
            rx,
        );

        let result = locals.deliver("s1", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(TunnelError::LocalServiceUnavailable(_))));
        assert!(locals.is_empty());
    }

    #[tokio::test]
    async fn test_local_close_removes_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accepts one connection and closes it immediately
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let (_slot, rx) = watch::channel(None);
        let locals = LocalConnections::new(
            LocalTarget {
                host: "127.0.0.1".to_string(),
                port,
                container_alias: None,
            },
            rx,
        );

        locals.deliver("s1", Bytes::from_static(b"x")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while locals.contains("s1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let (_slot, rx) = watch::channel(None);
        let locals = LocalConnections::new(echo_target().await, rx);

        locals.deliver("s1", Bytes::from_static(b"a")).await.unwrap();
        locals.deliver("s2", Bytes::from_static(b"b")).await.unwrap();
        locals.close_all();
        assert!(locals.is_empty());
    }
}
