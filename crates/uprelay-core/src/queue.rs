//! Per-connection outbound queue.

use std::collections::{TryReserveError, VecDeque};

use crate::message::Message;

/// FIFO of messages waiting to be written to one connection.
///
/// Head and tail operations are O(1). Messages leave the queue only once fully
/// written, or when the whole queue is discarded.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<Message>,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Queue holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Bytes still waiting for the wire across all queued messages.
    pub fn pending_bytes(&self) -> usize {
        self.messages.iter().map(|m| m.remaining().len()).sum()
    }

    /// Queued messages, head first.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Make room for one more message without allocating on [`push`].
    ///
    /// [`push`]: Self::push
    pub fn try_reserve_slot(&mut self) -> Result<(), TryReserveError> {
        self.messages.try_reserve(1)
    }

    /// Append a message at the tail.
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut Message> {
        self.messages.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Discard every queued message. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(bytes: &[u8]) -> Message {
        Message::copy_from(bytes).unwrap()
    }

    #[test]
    fn preserves_fifo_order() {
        let mut queue = OutboundQueue::new();
        queue.push(msg(b"one"));
        queue.push(msg(b"two"));
        queue.push(msg(b"three"));

        let order: Vec<_> = queue.iter().map(|m| m.payload().to_vec()).collect();
        assert_eq!(order, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

        assert_eq!(queue.pop_front().unwrap().payload(), b"one");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pending_bytes_excludes_written_prefix() {
        let mut queue = OutboundQueue::new();
        queue.push(msg(b"abcd"));
        queue.push(msg(b"ef"));

        queue.front_mut().unwrap().advance(3);
        assert_eq!(queue.pending_bytes(), 3);
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mut queue = OutboundQueue::new();
        queue.push(msg(b"a"));
        queue.push(msg(b"b"));

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.clear(), 0);
    }
}
