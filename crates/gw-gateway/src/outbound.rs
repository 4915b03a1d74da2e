//! The bounded per-device send pipeline, per §4.E.
//!
//! A single-producer (well, multi-producer: the session's own reader
//! task and the NATS adapter's delivery tasks both enqueue)
//! single-consumer bounded FIFO. Policy on overflow is drop-newest:
//! `try_send` failing because the channel is full simply drops the
//! new message rather than blocking the sender or evicting the
//! oldest entry already queued.

use gw_domain::wire::WireMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub enum EnqueueOutcome {
    Enqueued,
    Dropped,
    Closed,
}

#[derive(Clone)]
pub struct OutboundBuffer {
    sender: mpsc::Sender<WireMessage>,
    closed: Arc<AtomicBool>,
}

impl OutboundBuffer {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<WireMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                closed: Arc::new(AtomicBool::new(false)),
            },
            receiver,
        )
    }

    /// Enqueues `message`. A no-op returning `Closed` once the buffer
    /// has been closed. Never blocks: a full buffer drops the message
    /// and reports `Dropped`.
    pub fn enqueue(&self, message: WireMessage) -> EnqueueOutcome {
        if self.closed.load(Ordering::Acquire) {
            return EnqueueOutcome::Closed;
        }
        match self.sender.try_send(message) {
            Ok(()) => EnqueueOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Marks the buffer closed. Already-queued messages remain
    /// available to the writer task for a best-effort drain; new
    /// enqueues become no-ops immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_domain::wire::MessageType;

    fn msg() -> WireMessage {
        WireMessage::new(MessageType::Pong)
    }

    #[test]
    fn enqueue_up_to_capacity_then_drops() {
        let (buffer, _rx) = OutboundBuffer::bounded(2);
        assert!(matches!(buffer.enqueue(msg()), EnqueueOutcome::Enqueued));
        assert!(matches!(buffer.enqueue(msg()), EnqueueOutcome::Enqueued));
        assert!(matches!(buffer.enqueue(msg()), EnqueueOutcome::Dropped));
    }

    #[test]
    fn capacity_minus_one_still_enqueues() {
        let (buffer, _rx) = OutboundBuffer::bounded(3);
        assert!(matches!(buffer.enqueue(msg()), EnqueueOutcome::Enqueued));
        assert!(matches!(buffer.enqueue(msg()), EnqueueOutcome::Enqueued));
        assert!(matches!(buffer.enqueue(msg()), EnqueueOutcome::Enqueued));
    }

    #[test]
    fn enqueue_after_close_is_a_no_op() {
        let (buffer, _rx) = OutboundBuffer::bounded(4);
        buffer.close();
        assert!(matches!(buffer.enqueue(msg()), EnqueueOutcome::Closed));
    }

    #[tokio::test]
    async fn writer_drains_in_fifo_order() {
        let (buffer, mut rx) = OutboundBuffer::bounded(4);
        buffer.enqueue(
            WireMessage::new(MessageType::Pong).with_correlation_id("first"),
        );
        buffer.enqueue(
            WireMessage::new(MessageType::Pong).with_correlation_id("second"),
        );
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.correlation_id.as_deref(), Some("first"));
        assert_eq!(second.correlation_id.as_deref(), Some("second"));
    }
}
