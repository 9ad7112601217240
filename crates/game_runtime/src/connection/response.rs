//! Outbound frame channel.

use tokio::sync::mpsc;

/// Sending half of a connection's outbound queue.
///
/// Replies are queued as encoded frames; a writer task (socket) or the
/// request handler (HTTP) drains the receiving half. Sending never blocks.
#[derive(Clone, Debug)]
pub struct ResponseSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ResponseSink {
    /// Creates a sink together with the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues one frame. Returns `false` when the connection is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order_until_receiver_drops() {
        let (sink, mut rx) = ResponseSink::channel();
        assert!(sink.send(vec![1]));
        assert!(sink.send(vec![2]));
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.send(vec![3]));
    }
}
