//! Ordered stream writer
//!
//! Bytes read from local connections are sent to the server as DATA_FROM_APP2
//! frames. Every stream name has its own FIFO of pending blocks and at most one
//! drain loop, so a stream's bytes are never reordered while different streams
//! interleave freely on the control socket. Each chunk is tagged with the session
//! token held at the moment it is sent.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tracing::debug;
use tunnelforge_common::constants::CHUNK_SIZE;
use tunnelforge_common::{ClientMessage, FrameSender, Result, TunnelError};

struct PendingBlock {
    data: Bytes,
    done: oneshot::Sender<Result<()>>,
}

struct StreamQueue {
    blocks: VecDeque<PendingBlock>,
    processing: bool,
    generation: u64,
}

/// Resolves once a block has been written to the control socket
#[derive(Debug)]
pub struct Completion {
    name: String,
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let name = self.name.clone();
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TunnelError::StreamClosed(name))))
    }
}

struct WriterInner {
    control: FrameSender,
    token: watch::Receiver<Option<String>>,
    queues: DashMap<String, StreamQueue>,
    generations: AtomicU64,
}

/// Per-connection writer; a fresh one is installed for every control connection
#[derive(Clone)]
pub struct OrderedStreamWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for OrderedStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedStreamWriter")
            .field("streams", &self.inner.queues.len())
            .finish()
    }
}

impl OrderedStreamWriter {
    pub fn new(control: FrameSender, token: watch::Receiver<Option<String>>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                control,
                token,
                queues: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `data` behind everything already queued for `name`
    pub fn enqueue(&self, name: &str, data: Bytes) -> Completion {
        let (done, rx) = oneshot::channel();

        let start = {
            let mut queue = self
                .inner
                .queues
                .entry(name.to_string())
                .or_insert_with(|| StreamQueue {
                    blocks: VecDeque::new(),
                    processing: false,
                    generation: self.inner.generations.fetch_add(1, Ordering::Relaxed),
                });

            queue.blocks.push_back(PendingBlock { data, done });
            if queue.processing {
                None
            } else {
                queue.processing = true;
                Some(queue.generation)
            }
        };

        if let Some(generation) = start {
            tokio::spawn(self.inner.clone().drain(name.to_string(), generation));
        }

        Completion {
            name: name.to_string(),
            rx,
        }
    }

    /// Drop every queued block of `name`; a running drain stops before its next chunk
    pub fn purge(&self, name: &str) {
        if let Some((_, queue)) = self.inner.queues.remove(name) {
            debug!(stream = %name, dropped = queue.blocks.len(), "Purged stream queue");
        }
    }

    /// Blocks waiting for `name`, not counting the one being sent
    pub fn pending(&self, name: &str) -> usize {
        self.inner
            .queues
            .get(name)
            .map(|queue| queue.blocks.len())
            .unwrap_or(0)
    }
}

impl WriterInner {
    fn is_current(&self, name: &str, generation: u64) -> bool {
        self.queues
            .get(name)
            .map(|queue| queue.generation == generation)
            .unwrap_or(false)
    }

    async fn drain(self: Arc<Self>, name: String, generation: u64) {
        loop {
            let block = {
                let Some(mut queue) = self.queues.get_mut(&name) else {
                    return;
                };
                if queue.generation != generation {
                    return;
                }
                match queue.blocks.pop_front() {
                    Some(block) => block,
                    None => {
                        queue.processing = false;
                        return;
                    }
                }
            };

            match self.send_block(&name, generation, &block.data).await {
                Ok(()) => {
                    let _ = block.done.send(Ok(()));
                }
                Err(e) => {
                    debug!(stream = %name, "Abandoning stream queue: {}", e);
                    let _ = block.done.send(Err(e));
                    // Dropping the remaining blocks fails their completions
                    self.queues
                        .remove_if(&name, |_, queue| queue.generation == generation);
                    return;
                }
            }
        }
    }

    async fn send_block(&self, name: &str, generation: u64, data: &Bytes) -> Result<()> {
        let mut offset = 0;

        while offset < data.len() {
            if !self.is_current(name, generation) {
                return Err(TunnelError::StreamClosed(name.to_string()));
            }

            let end = (offset + CHUNK_SIZE).min(data.len());
            let token = self.token.borrow().clone().unwrap_or_default();
            let message = ClientMessage::DataFromApp2 {
                name: name.to_string(),
                token,
                data: data.slice(offset..end),
            };

            self.control.send_flushed(message.to_record()).await?;
            offset = end;
        }

        Ok(())
    }
}
