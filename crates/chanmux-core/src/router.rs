use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::errors::RouteError;
use crate::queue::{BoundedQueue, ChannelQueue, DiscardQueue};

/// Resolves channel names to queues and dispatches raw inbound messages.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Exact-match lookup. Unknown names resolve to a non-retaining stand-in.
    fn get(&self, name: &str) -> Arc<dyn ChannelQueue>;

    /// Decode `raw` and enqueue its payload on the target queue. May wait
    /// when that queue has flow on and is full.
    async fn route(&self, raw: &[u8]) -> Result<(), RouteError>;

    /// Registered channel names, in no particular order.
    fn channels(&self) -> Vec<String>;
}

/// Router for `{"channel": ..., "payload": ...}` JSON envelopes over a fixed
/// channel set.
pub struct JsonRouter {
    channels: HashMap<String, Arc<dyn ChannelQueue>>,
    discard: Arc<dyn ChannelQueue>,
}

impl JsonRouter {
    /// Build one `BoundedQueue` of `capacity` per distinct name, flow off.
    pub fn new<I, S>(names: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                let queue: Arc<dyn ChannelQueue> =
                    Arc::new(BoundedQueue::new(name.clone(), capacity));
                (name, queue)
            })
            .collect();
        Self {
            channels,
            discard: Arc::new(DiscardQueue),
        }
    }
}

#[async_trait]
impl MessageRouter for JsonRouter {
    fn get(&self, name: &str) -> Arc<dyn ChannelQueue> {
        match self.channels.get(name) {
            Some(queue) => Arc::clone(queue),
            None => Arc::clone(&self.discard),
        }
    }

    async fn route(&self, raw: &[u8]) -> Result<(), RouteError> {
        let envelope = Envelope::decode(raw)?;
        let queue = match self.channels.get(envelope.channel.as_str()) {
            Some(queue) => queue,
            None => {
                tracing::trace!(channel = %envelope.channel, "No such channel, discarding");
                return Ok(());
            }
        };
        tracing::trace!(
            channel = %envelope.channel,
            payload_len = envelope.payload.len(),
            "Routing payload"
        );
        queue.enqueue(envelope.payload).await;
        Ok(())
    }

    fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }
}
