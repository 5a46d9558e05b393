//! Property-based tests for the connection pool.
//!
//! These check the bookkeeping invariants that the readiness loop relies on:
//! the cached max descriptor, exact-once fan-out, and byte-exact resumption
//! of drains across arbitrary short writes.

use std::{
    collections::{BTreeSet, VecDeque},
    io,
};

use proptest::prelude::*;
use uprelay_core::{
    BroadcastPolicy, ConnectionPool, Descriptor, DrainOutcome, Message, Wire, uppercase_in_place,
};

#[derive(Debug, Clone)]
enum PoolOp {
    Add(i32),
    Remove(i32),
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![(4i32..48).prop_map(PoolOp::Add), (4i32..48).prop_map(PoolOp::Remove)]
}

/// Wire that accepts at most the next scripted number of bytes per call.
struct ChoppyWire {
    limits: VecDeque<usize>,
    sent: Vec<u8>,
}

impl Wire for ChoppyWire {
    fn write(&mut self, _descriptor: Descriptor, buf: &[u8]) -> io::Result<usize> {
        let n = self.limits.pop_front().map_or(buf.len(), |limit| limit.min(buf.len()));
        self.sent.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the cached max always equals the true max of live descriptors
    #[test]
    fn prop_max_descriptor_tracks_live_set(ops in prop::collection::vec(pool_op(), 0..64)) {
        let mut pool = ConnectionPool::new();
        let mut model = BTreeSet::new();

        for op in ops {
            match op {
                PoolOp::Add(raw) => {
                    let added = pool.add(Descriptor::new(raw)).is_ok();
                    prop_assert_eq!(added, model.insert(raw));
                },
                PoolOp::Remove(raw) => {
                    let removed = pool.remove(Descriptor::new(raw)).is_some();
                    prop_assert_eq!(removed, model.remove(&raw));
                },
            }

            prop_assert_eq!(pool.max_descriptor().map(Descriptor::raw), model.last().copied());
            prop_assert_eq!(pool.len(), model.len());
            prop_assert_eq!(pool.read_interest().len(), model.len());
        }
    }

    /// Property: removing a descriptor that was never added changes nothing
    #[test]
    fn prop_remove_unknown_is_noop(
        live in prop::collection::btree_set(4i32..32, 0..8),
        probe in 32i32..64
    ) {
        let mut pool = ConnectionPool::new();
        for &raw in &live {
            pool.add(Descriptor::new(raw))?;
        }
        let before = pool.max_descriptor();

        prop_assert!(pool.remove(Descriptor::new(probe)).is_none());
        prop_assert_eq!(pool.len(), live.len());
        prop_assert_eq!(pool.max_descriptor(), before);
    }

    /// Property: a broadcast queues exactly one copy on every peer but the origin
    #[test]
    fn prop_broadcast_reaches_every_peer_once(
        live in prop::collection::btree_set(4i32..40, 1..12),
        pick in any::<prop::sample::Index>(),
        payload in prop::collection::vec(any::<u8>(), 1..64)
    ) {
        let mut pool = ConnectionPool::new();
        for &raw in &live {
            pool.add(Descriptor::new(raw))?;
        }
        let origin = Descriptor::new(*pick.get(&live.iter().copied().collect::<Vec<_>>()));

        let report = pool.broadcast_except(origin, &payload, BroadcastPolicy::AllOrNothing)?;
        prop_assert_eq!(report.delivered, live.len() - 1);

        for &raw in &live {
            let descriptor = Descriptor::new(raw);
            let queued: Vec<Vec<u8>> = pool
                .get(descriptor)
                .map_or_else(Vec::new, |conn| conn.queue().iter().map(|m| m.payload().to_vec()).collect());

            if descriptor == origin {
                prop_assert!(queued.is_empty());
                prop_assert!(!pool.write_interest().contains(descriptor));
            } else {
                prop_assert_eq!(queued, vec![payload.clone()]);
                prop_assert!(pool.write_interest().contains(descriptor));
            }
        }
    }

    /// Property: uppercasing is idempotent and only touches ASCII lowercase
    #[test]
    fn prop_uppercase_is_idempotent(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let mut once = bytes.clone();
        uppercase_in_place(&mut once);
        let mut twice = once.clone();
        uppercase_in_place(&mut twice);

        prop_assert_eq!(&once, &twice);
        for (before, after) in bytes.iter().zip(&once) {
            if before.is_ascii_lowercase() {
                prop_assert_eq!(*after, before - 32);
            } else {
                prop_assert_eq!(after, before);
            }
        }
    }

    /// Property: a drain interrupted by arbitrary short writes delivers every
    /// byte exactly once, in order, uppercased
    #[test]
    fn prop_short_writes_resume_exactly(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..6),
        limits in prop::collection::vec(1usize..8, 0..32)
    ) {
        let descriptor = Descriptor::new(4);
        let mut pool = ConnectionPool::new();
        pool.add(descriptor)?;
        for payload in &messages {
            pool.enqueue(descriptor, Message::copy_from(payload)?)?;
        }

        let mut wire = ChoppyWire { limits: limits.into(), sent: Vec::new() };
        let mut rounds = 0;
        loop {
            rounds += 1;
            prop_assert!(rounds < 1024);
            match pool.drain(descriptor, &mut wire)? {
                DrainOutcome::Drained { .. } => break,
                DrainOutcome::Blocked { .. } => {},
            }
        }

        let mut expected = messages.concat();
        uppercase_in_place(&mut expected);
        prop_assert_eq!(wire.sent, expected);
        prop_assert!(!pool.write_interest().contains(descriptor));
    }
}
