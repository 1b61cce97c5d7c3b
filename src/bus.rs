//! Topic-based event bus for observers of the runtime

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::Message;

/// Topic on which the execution engine publishes task status changes
pub const TOPIC_WORKFLOW_STATUS: &str = "workflow.status";

/// In-process publish/subscribe over bounded channels
///
/// Publishing never blocks: a subscriber whose buffer is full misses the
/// message, and closed subscribers are pruned on the next publish.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Message>>>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Subscribe to a topic
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish to every subscriber of a topic; returns how many received it
    pub fn publish(&self, topic: &str, msg: Message) -> usize {
        let mut delivered = 0;
        let mut saw_closed = false;
        {
            let subscribers = self.subscribers.read();
            let Some(senders) = subscribers.get(topic) else {
                return 0;
            };
            for tx in senders {
                match tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(topic, "Dropping event for slow subscriber");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }

        if saw_closed {
            let mut subscribers = self.subscribers.write();
            if let Some(senders) = subscribers.get_mut(topic) {
                senders.retain(|tx| !tx.is_closed());
                if senders.is_empty() {
                    subscribers.remove(topic);
                }
            }
        }
        delivered
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(10)
    }
}
