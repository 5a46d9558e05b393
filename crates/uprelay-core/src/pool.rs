//! Connection pool.
//!
//! The pool is an arena of [`Connection`] records keyed by descriptor, plus
//! the two interest sets the readiness loop hands to the multiplexer and a
//! cached maximum descriptor that bounds each readiness query.
//!
//! # Invariants
//!
//! - A descriptor appears in the pool at most once.
//! - Every live connection is read-interested.
//! - A connection is write-interested only while its queue is non-empty.
//! - `max_descriptor` equals the highest live descriptor, or `None` when the
//!   pool is empty. It is recomputed by a full scan only when the removed
//!   descriptor was the maximum.
//!
//! The pool never closes descriptors. Releasing the OS resource is the
//! caller's job, which keeps bookkeeping separate from I/O.

use std::collections::HashMap;

use crate::{
    descriptor::{Descriptor, DescriptorSet},
    error::PoolError,
    message::Message,
    queue::OutboundQueue,
};

/// State for one accepted client.
#[derive(Debug)]
pub struct Connection {
    descriptor: Descriptor,
    queue: OutboundQueue,
}

impl Connection {
    fn new(descriptor: Descriptor) -> Self {
        Self { descriptor, queue: OutboundQueue::new() }
    }

    /// Socket descriptor, unique among live connections.
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    /// Messages waiting to be written to this client.
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut OutboundQueue {
        &mut self.queue
    }
}

/// Set of live connections and their readiness interest.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    /// Descriptor → connection record
    connections: HashMap<Descriptor, Connection>,
    /// Highest live descriptor, `None` when empty
    max_descriptor: Option<Descriptor>,
    /// Descriptors to watch for read readiness
    read_interest: DescriptorSet,
    /// Descriptors with queued output
    write_interest: DescriptorSet,
    /// Per-connection backlog limit, `None` for unbounded
    queue_limit: Option<usize>,
}

impl ConnectionPool {
    /// Create an empty pool with unbounded outbound queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty pool whose queues hold at most `limit` messages.
    pub fn with_queue_limit(limit: Option<usize>) -> Self {
        Self { queue_limit: limit, ..Self::default() }
    }

    /// Track a newly accepted descriptor.
    ///
    /// On error nothing is recorded and the caller still owns the raw
    /// descriptor, so it must close it.
    pub fn add(&mut self, descriptor: Descriptor) -> Result<(), PoolError> {
        if self.connections.contains_key(&descriptor) {
            return Err(PoolError::DuplicateDescriptor(descriptor));
        }

        self.connections
            .try_reserve(1)
            .map_err(|source| PoolError::Allocation { descriptor, source })?;

        self.connections.insert(descriptor, Connection::new(descriptor));
        self.read_interest.insert(descriptor);

        if self.max_descriptor.is_none_or(|max| descriptor > max) {
            self.max_descriptor = Some(descriptor);
        }

        Ok(())
    }

    /// Stop tracking a descriptor and return its record.
    ///
    /// Dropping the returned connection releases its queue. Unknown
    /// descriptors are a no-op. Both interest bits are cleared either way.
    pub fn remove(&mut self, descriptor: Descriptor) -> Option<Connection> {
        let removed = self.connections.remove(&descriptor);

        self.read_interest.remove(descriptor);
        self.write_interest.remove(descriptor);

        if removed.is_some() && self.max_descriptor == Some(descriptor) {
            self.max_descriptor = self.connections.keys().copied().max();
        }

        removed
    }

    /// Remove every connection, calling `close` for each descriptor.
    ///
    /// Returns the number of connections removed. Safe on an empty pool.
    pub fn cleanup_all(&mut self, mut close: impl FnMut(Descriptor)) -> usize {
        let descriptors: Vec<Descriptor> = self.connections.keys().copied().collect();

        for &descriptor in &descriptors {
            self.remove(descriptor);
            close(descriptor);
        }

        debug_assert!(self.connections.is_empty());
        debug_assert!(self.max_descriptor.is_none());
        descriptors.len()
    }

    /// Append a message to one connection's queue and mark it
    /// write-interested.
    pub fn enqueue(&mut self, descriptor: Descriptor, message: Message) -> Result<(), PoolError> {
        let limit = self.queue_limit;
        let conn = self
            .connections
            .get_mut(&descriptor)
            .ok_or(PoolError::UnknownDescriptor(descriptor))?;

        reserve_slot(conn, limit)?;
        conn.queue.push(message);
        self.write_interest.insert(descriptor);
        Ok(())
    }

    /// Connection record for a descriptor.
    pub fn get(&self, descriptor: Descriptor) -> Option<&Connection> {
        self.connections.get(&descriptor)
    }

    pub(crate) fn get_mut(&mut self, descriptor: Descriptor) -> Option<&mut Connection> {
        self.connections.get_mut(&descriptor)
    }

    /// Descriptor is tracked by the pool.
    pub fn contains(&self, descriptor: Descriptor) -> bool {
        self.connections.contains_key(&descriptor)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Pool holds no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Highest live descriptor. `None` if the pool is empty.
    pub fn max_descriptor(&self) -> Option<Descriptor> {
        self.max_descriptor
    }

    /// Descriptors watched for read readiness.
    pub fn read_interest(&self) -> &DescriptorSet {
        &self.read_interest
    }

    /// Descriptors watched for write readiness.
    pub fn write_interest(&self) -> &DescriptorSet {
        &self.write_interest
    }

    /// Configured per-connection backlog limit.
    pub fn queue_limit(&self) -> Option<usize> {
        self.queue_limit
    }

    /// All live descriptors, in no particular order.
    pub fn descriptors(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.connections.keys().copied()
    }

    pub(crate) fn clear_write_interest(&mut self, descriptor: Descriptor) {
        self.write_interest.remove(descriptor);
    }
}

/// Check the backlog limit and reserve queue capacity for one message.
pub(crate) fn reserve_slot(conn: &mut Connection, limit: Option<usize>) -> Result<(), PoolError> {
    let descriptor = conn.descriptor;

    if let Some(limit) = limit
        && conn.queue.len() >= limit
    {
        return Err(PoolError::QueueFull { descriptor, limit });
    }

    conn.queue.try_reserve_slot().map_err(|source| PoolError::Allocation { descriptor, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(raw: i32) -> Descriptor {
        Descriptor::new(raw)
    }

    fn msg(bytes: &[u8]) -> Message {
        Message::copy_from(bytes).unwrap()
    }

    #[test]
    fn new_pool_is_empty() {
        let pool = ConnectionPool::new();

        assert!(pool.is_empty());
        assert_eq!(pool.max_descriptor(), None);
        assert!(pool.read_interest().is_empty());
        assert!(pool.write_interest().is_empty());
    }

    #[test]
    fn add_marks_read_interest_and_tracks_max() {
        let mut pool = ConnectionPool::new();

        pool.add(d(5)).unwrap();
        pool.add(d(9)).unwrap();
        pool.add(d(7)).unwrap();

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.max_descriptor(), Some(d(9)));
        assert!(pool.read_interest().contains(d(7)));
        assert!(!pool.write_interest().contains(d(7)));
    }

    #[test]
    fn add_duplicate_fails_without_side_effects() {
        let mut pool = ConnectionPool::new();
        pool.add(d(4)).unwrap();
        pool.enqueue(d(4), msg(b"keep")).unwrap();

        assert_eq!(pool.add(d(4)), Err(PoolError::DuplicateDescriptor(d(4))));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(d(4)).unwrap().queue().len(), 1);
    }

    #[test]
    fn remove_max_rescans() {
        let mut pool = ConnectionPool::new();
        pool.add(d(4)).unwrap();
        pool.add(d(8)).unwrap();
        pool.add(d(6)).unwrap();

        pool.remove(d(8));
        assert_eq!(pool.max_descriptor(), Some(d(6)));

        pool.remove(d(4));
        assert_eq!(pool.max_descriptor(), Some(d(6)));

        pool.remove(d(6));
        assert_eq!(pool.max_descriptor(), None);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut pool = ConnectionPool::new();
        pool.add(d(4)).unwrap();

        assert!(pool.remove(d(40)).is_none());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.max_descriptor(), Some(d(4)));
        assert!(pool.read_interest().contains(d(4)));
    }

    #[test]
    fn remove_clears_both_interest_sets_and_releases_queue() {
        let mut pool = ConnectionPool::new();
        pool.add(d(4)).unwrap();
        pool.enqueue(d(4), msg(b"a")).unwrap();
        pool.enqueue(d(4), msg(b"b")).unwrap();

        let conn = pool.remove(d(4)).unwrap();
        assert_eq!(conn.queue().len(), 2);
        assert!(!pool.read_interest().contains(d(4)));
        assert!(!pool.write_interest().contains(d(4)));
    }

    #[test]
    fn enqueue_marks_write_interest() {
        let mut pool = ConnectionPool::new();
        pool.add(d(4)).unwrap();

        pool.enqueue(d(4), msg(b"hello")).unwrap();
        assert!(pool.write_interest().contains(d(4)));
        assert_eq!(pool.get(d(4)).unwrap().queue().pending_bytes(), 5);
    }

    #[test]
    fn enqueue_unknown_fails() {
        let mut pool = ConnectionPool::new();

        assert_eq!(pool.enqueue(d(4), msg(b"x")), Err(PoolError::UnknownDescriptor(d(4))));
        assert!(pool.write_interest().is_empty());
    }

    #[test]
    fn queue_limit_rejects_overflow() {
        let mut pool = ConnectionPool::with_queue_limit(Some(1));
        pool.add(d(4)).unwrap();

        pool.enqueue(d(4), msg(b"first")).unwrap();
        assert_eq!(
            pool.enqueue(d(4), msg(b"second")),
            Err(PoolError::QueueFull { descriptor: d(4), limit: 1 })
        );
        assert_eq!(pool.get(d(4)).unwrap().queue().len(), 1);
    }

    #[test]
    fn cleanup_all_closes_everything() {
        let mut pool = ConnectionPool::new();
        pool.add(d(4)).unwrap();
        pool.add(d(5)).unwrap();
        pool.enqueue(d(5), msg(b"pending")).unwrap();

        let mut closed = Vec::new();
        let count = pool.cleanup_all(|descriptor| closed.push(descriptor));

        closed.sort();
        assert_eq!(count, 2);
        assert_eq!(closed, vec![d(4), d(5)]);
        assert!(pool.is_empty());
        assert_eq!(pool.max_descriptor(), None);
        assert!(pool.write_interest().is_empty());
    }

    #[test]
    fn cleanup_all_on_empty_pool() {
        let mut pool = ConnectionPool::new();
        assert_eq!(pool.cleanup_all(|_| {}), 0);
    }
}
