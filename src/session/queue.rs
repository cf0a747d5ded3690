use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::SessionMessage;

/// FIFO buffer for envelopes issued while the transport is down.
///
/// Draining pops from the front; a message whose send fails goes back to
/// the front so the original order survives partial drains.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<SessionMessage>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, message: SessionMessage) {
        self.lock().push_back(message);
    }

    pub fn pop(&self) -> Option<SessionMessage> {
        self.lock().pop_front()
    }

    /// Puts a message back at the head after a failed send.
    pub fn restore(&self, message: SessionMessage) {
        self.lock().push_front(message);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SessionMessage>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn message(n: u64) -> SessionMessage {
        SessionMessage::new(format!("msg-{}", n), Value::Null)
    }

    #[test]
    fn test_drains_in_enqueue_order() {
        let queue = OutboundQueue::new();
        for n in 1..=3 {
            queue.enqueue(message(n));
        }

        assert_eq!(queue.pop().unwrap().msg_type, "msg-1");
        assert_eq!(queue.pop().unwrap().msg_type, "msg-2");
        assert_eq!(queue.pop().unwrap().msg_type, "msg-3");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_restore_preserves_order_after_failed_send() {
        let queue = OutboundQueue::new();
        for n in 1..=3 {
            queue.enqueue(message(n));
        }

        let first = queue.pop().unwrap();
        queue.restore(first);

        assert_eq!(queue.pop().unwrap().msg_type, "msg-1");
        assert_eq!(queue.pop().unwrap().msg_type, "msg-2");
    }

    #[test]
    fn test_empty_drain_is_a_no_op() {
        let queue = OutboundQueue::new();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        assert_eq!(queue.len(), 0);
    }
}
