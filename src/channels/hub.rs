//! Shared broadcast base for the thin channels
//!
//! The log, info, chrome-observer and admin-panel channels are broadcast
//! shells: frames pushed by the server fan out to every connected
//! subscriber. The WebSocket glue lives in the API layer; this type only
//! owns the fan-out.

use super::Frame;
use tokio::sync::broadcast;

const SUBSCRIBER_CAPACITY: usize = 256;

pub struct BroadcastHub {
    name: &'static str,
    tx: broadcast::Sender<Frame>,
}

impl BroadcastHub {
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self { name, tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Push a frame to every current subscriber.
    pub fn publish(&self, frame: Frame) {
        tracing::debug!(channel = self.name, kind = %frame.kind, "broadcast frame");
        // No subscribers is fine
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
