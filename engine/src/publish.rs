//! Change publisher seam between the engine and the subscriber transport
//!
//! The engine hands serializable records to a sink and walks away;
//! delivery to individual subscribers is the transport's problem.

use log::debug;
use shared::Record;
use tokio::sync::broadcast;

/// Fire-and-forget fan-out of updated records to subscribers.
pub trait PublishSink: Send + Sync {
    fn publish(&self, record: &Record);
    fn publish_subscriber_count(&self, count: usize);
    fn subscriber_count(&self) -> usize;
}

/// One message on the subscriber channel.
#[derive(Debug, Clone)]
pub enum Update {
    Record(Record),
    SubscriberCount(usize),
}

/// Broadcast-channel sink the transport layer subscribes to. Sending with
/// no live receivers is not an error; there is simply nobody to tell.
pub struct BroadcastSink {
    tx: broadcast::Sender<Update>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.tx.subscribe()
    }
}

impl PublishSink for BroadcastSink {
    fn publish(&self, record: &Record) {
        let _ = self.tx.send(Update::Record(record.clone()));
    }

    fn publish_subscriber_count(&self, count: usize) {
        debug!("broadcasting subscriber count: {}", count);
        let _ = self.tx.send(Update::SubscriberCount(count));
    }

    fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
