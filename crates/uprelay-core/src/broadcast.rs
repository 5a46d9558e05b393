//! Broadcast fan-out.
//!
//! Every peer except the origin receives its own copy of the chunk, so the
//! in-place uppercase applied at drain time never touches another
//! connection's bytes.

use tracing::warn;

use crate::{
    descriptor::Descriptor,
    error::PoolError,
    message::Message,
    pool::{ConnectionPool, reserve_slot},
};

/// What to do when the copy for one peer cannot be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    /// Prepare every copy before committing any. A single failure aborts the
    /// broadcast and no peer receives the chunk.
    #[default]
    AllOrNothing,
    /// Skip peers whose copy fails and deliver to the rest.
    BestEffort,
}

/// Outcome of a completed broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    /// Peers that received a copy
    pub delivered: usize,
    /// Peers skipped under [`BroadcastPolicy::BestEffort`]
    pub skipped: usize,
}

impl ConnectionPool {
    /// Queue a copy of `payload` on every connection except `origin`.
    ///
    /// Under [`BroadcastPolicy::AllOrNothing`] the first failing copy is
    /// returned and the pool is left without any new message. Under
    /// [`BroadcastPolicy::BestEffort`] this never fails.
    pub fn broadcast_except(
        &mut self,
        origin: Descriptor,
        payload: &[u8],
        policy: BroadcastPolicy,
    ) -> Result<BroadcastReport, PoolError> {
        match policy {
            BroadcastPolicy::AllOrNothing => self.broadcast_all_or_nothing(origin, payload),
            BroadcastPolicy::BestEffort => Ok(self.broadcast_best_effort(origin, payload)),
        }
    }

    fn broadcast_all_or_nothing(
        &mut self,
        origin: Descriptor,
        payload: &[u8],
    ) -> Result<BroadcastReport, PoolError> {
        let peers: Vec<Descriptor> = self.descriptors().filter(|&d| d != origin).collect();
        let limit = self.queue_limit();

        let mut staged = Vec::new();
        staged
            .try_reserve_exact(peers.len())
            .map_err(|source| PoolError::Allocation { descriptor: origin, source })?;

        // Reserve queue capacity and build every copy first, so the commit
        // loop below cannot fail halfway.
        for &peer in &peers {
            let conn = self.get_mut(peer).ok_or(PoolError::UnknownDescriptor(peer))?;
            reserve_slot(conn, limit)?;
            let message = Message::copy_from(payload)
                .map_err(|source| PoolError::Allocation { descriptor: peer, source })?;
            staged.push((peer, message));
        }

        let delivered = staged.len();
        for (peer, message) in staged {
            self.enqueue(peer, message)?;
        }

        Ok(BroadcastReport { delivered, skipped: 0 })
    }

    fn broadcast_best_effort(&mut self, origin: Descriptor, payload: &[u8]) -> BroadcastReport {
        let peers: Vec<Descriptor> = self.descriptors().filter(|&d| d != origin).collect();
        let mut report = BroadcastReport::default();

        for peer in peers {
            let queued = Message::copy_from(payload)
                .map_err(|source| PoolError::Allocation { descriptor: peer, source })
                .and_then(|message| self.enqueue(peer, message));

            match queued {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(%origin, %peer, error = %e, "skipping peer in broadcast");
                    report.skipped += 1;
                },
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(raw: i32) -> Descriptor {
        Descriptor::new(raw)
    }

    fn pool_with(descriptors: &[i32], limit: Option<usize>) -> ConnectionPool {
        let mut pool = ConnectionPool::with_queue_limit(limit);
        for &raw in descriptors {
            pool.add(d(raw)).unwrap();
        }
        pool
    }

    fn queued(pool: &ConnectionPool, raw: i32) -> Vec<Vec<u8>> {
        pool.get(d(raw)).unwrap().queue().iter().map(|m| m.payload().to_vec()).collect()
    }

    #[test]
    fn skips_origin_and_copies_to_peers() {
        let mut pool = pool_with(&[4, 5, 6], None);

        let report = pool.broadcast_except(d(4), b"hi", BroadcastPolicy::AllOrNothing).unwrap();

        assert_eq!(report, BroadcastReport { delivered: 2, skipped: 0 });
        assert!(queued(&pool, 4).is_empty());
        assert_eq!(queued(&pool, 5), vec![b"hi".to_vec()]);
        assert_eq!(queued(&pool, 6), vec![b"hi".to_vec()]);
        assert!(!pool.write_interest().contains(d(4)));
        assert!(pool.write_interest().contains(d(5)));
        assert!(pool.write_interest().contains(d(6)));
    }

    #[test]
    fn lone_connection_receives_nothing() {
        let mut pool = pool_with(&[4], None);

        let report = pool.broadcast_except(d(4), b"echo?", BroadcastPolicy::AllOrNothing).unwrap();

        assert_eq!(report.delivered, 0);
        assert!(pool.write_interest().is_empty());
    }

    #[test]
    fn all_or_nothing_aborts_when_one_peer_is_full() {
        let mut pool = pool_with(&[4, 5, 6], Some(1));
        pool.enqueue(d(6), Message::copy_from(b"backlog").unwrap()).unwrap();

        let result = pool.broadcast_except(d(4), b"hi", BroadcastPolicy::AllOrNothing);

        assert_eq!(result, Err(PoolError::QueueFull { descriptor: d(6), limit: 1 }));
        assert!(queued(&pool, 5).is_empty());
        assert!(!pool.write_interest().contains(d(5)));
        assert_eq!(queued(&pool, 6), vec![b"backlog".to_vec()]);
    }

    #[test]
    fn best_effort_skips_full_peer() {
        let mut pool = pool_with(&[4, 5, 6], Some(1));
        pool.enqueue(d(6), Message::copy_from(b"backlog").unwrap()).unwrap();

        let report = pool.broadcast_except(d(4), b"hi", BroadcastPolicy::BestEffort).unwrap();

        assert_eq!(report, BroadcastReport { delivered: 1, skipped: 1 });
        assert_eq!(queued(&pool, 5), vec![b"hi".to_vec()]);
        assert_eq!(queued(&pool, 6), vec![b"backlog".to_vec()]);
    }

    #[test]
    fn copies_are_independent() {
        let mut pool = pool_with(&[4, 5, 6], None);
        pool.broadcast_except(d(4), b"abc", BroadcastPolicy::AllOrNothing).unwrap();

        pool.get_mut(d(5)).unwrap().queue_mut().front_mut().unwrap().uppercase();

        assert_eq!(queued(&pool, 5), vec![b"ABC".to_vec()]);
        assert_eq!(queued(&pool, 6), vec![b"abc".to_vec()]);
    }
}
