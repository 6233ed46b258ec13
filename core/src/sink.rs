use concave_proto::StreamEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SinkError;

/// A stream sink owned by a handler. Writes must be non-blocking: a sink
/// that cannot accept an event reports failure and the bus tears the
/// handler down rather than stalling other subscribers.
pub trait EventSink: Send + Sync {
    fn send(&self, event: StreamEvent) -> Result<(), SinkError>;

    /// Release the underlying transport. Idempotent.
    fn close(&self);
}

/// The stock sink: a bounded channel per handler with a single consumer
/// draining it (the HTTP layer's writer task, which turns events into
/// frames). A full buffer means the consumer is too slow; the bus responds
/// with drop-and-invalidate.
pub struct ChannelSink {
    tx: std::sync::Mutex<Option<mpsc::Sender<StreamEvent>>>,
}

impl ChannelSink {
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx: std::sync::Mutex::new(Some(tx)) }), rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: StreamEvent) -> Result<(), SinkError> {
        let guard = self.tx.lock().expect("sink lock poisoned");
        let tx = guard.as_ref().ok_or(SinkError::Closed)?;
        tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Overflow,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn close(&self) { self.tx.lock().expect("sink lock poisoned").take(); }
}
