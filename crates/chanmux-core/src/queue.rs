use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

/// A named, bounded, flow-gated buffer of payloads for one logical topic.
///
/// The producer is the session's dispatch loop; the consumer is whichever
/// application task drains the queue.
#[async_trait]
pub trait ChannelQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum number of buffered, undelivered payloads.
    fn capacity(&self) -> usize;

    fn flow(&self) -> bool;

    /// Takes effect for the next `enqueue`. Already-buffered payloads stay.
    fn set_flow(&self, flow: bool);

    /// Number of payloads currently buffered.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard when flow is off; otherwise append, waiting for space when full.
    async fn enqueue(&self, payload: Bytes);

    /// Wait for the next payload in FIFO order.
    async fn dequeue(&self) -> Bytes;

    /// Take the next payload if one is buffered. Meant for the single
    /// consumer: returns `None` while another task is inside `dequeue`,
    /// even if payloads are buffered.
    fn try_dequeue(&self) -> Option<Bytes>;
}

/// Bounded FIFO backed by a tokio mpsc channel.
pub struct BoundedQueue {
    name: String,
    flow: AtomicBool,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl BoundedQueue {
    /// Flow starts off.
    ///
    /// A capacity of 0 is raised to 1 and `capacity()` reports 1: there is
    /// no rendezvous mode, so one payload can sit in the buffer before the
    /// producer waits.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            flow: AtomicBool::new(false),
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl ChannelQueue for BoundedQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    fn flow(&self) -> bool {
        self.flow.load(Ordering::Acquire)
    }

    fn set_flow(&self, flow: bool) {
        self.flow.store(flow, Ordering::Release);
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    async fn enqueue(&self, payload: Bytes) {
        if !self.flow() {
            tracing::trace!(channel = %self.name, "Flow off, dropping payload");
            return;
        }
        // The receiver lives as long as `self`, so send only fails on drop.
        let _ = self.tx.send(payload).await;
    }

    async fn dequeue(&self) -> Bytes {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(payload) => payload,
            // Unreachable while we hold the sender.
            None => std::future::pending().await,
        }
    }

    fn try_dequeue(&self) -> Option<Bytes> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// Stand-in returned for unknown channel names: never retains, never blocks,
/// never yields.
#[derive(Debug, Default)]
pub struct DiscardQueue;

#[async_trait]
impl ChannelQueue for DiscardQueue {
    fn name(&self) -> &str {
        ""
    }

    fn capacity(&self) -> usize {
        0
    }

    fn flow(&self) -> bool {
        false
    }

    fn set_flow(&self, _flow: bool) {}

    fn len(&self) -> usize {
        0
    }

    async fn enqueue(&self, _payload: Bytes) {}

    async fn dequeue(&self) -> Bytes {
        std::future::pending().await
    }

    fn try_dequeue(&self) -> Option<Bytes> {
        None
    }
}
