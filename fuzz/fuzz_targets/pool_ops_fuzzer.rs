//! Fuzz target for ConnectionPool bookkeeping
//!
//! Prevent stale max-descriptor tracking and lost or duplicated bytes
//!
//! # Strategy
//!
//! - Random add/remove sequences over a small descriptor range (reuse heavy)
//! - Broadcasts under both policies, with and without a backlog limit
//! - Drains through a wire that accepts random short writes or fails
//! - Every write failure policy applied after a failed drain
//!
//! # Invariants
//!
//! - Cached max descriptor equals the max of live descriptors
//! - Write interest set equals the set of connections with queued messages
//! - Bytes reaching the wire are exactly the queued payloads, in order,
//!   uppercased, each byte once
//! - AllOrNothing either reaches every peer or none

#![no_main]

use std::{
    collections::{BTreeMap, VecDeque},
    io,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use uprelay_core::{
    BroadcastPolicy, ConnectionPool, Descriptor, DrainOutcome, Wire, WriteFailurePolicy,
    uppercase_in_place,
};

#[derive(Debug, Clone, Arbitrary)]
struct PoolScenario {
    queue_limit: Option<u8>,
    ops: Vec<PoolOp>,
}

#[derive(Debug, Clone, Arbitrary)]
enum PoolOp {
    Add(u8),
    Remove(u8),
    Broadcast { origin: u8, payload: Vec<u8>, best_effort: bool },
    Drain { target: u8, limits: Vec<u8>, fail_after: Option<u8>, policy: PolicyChoice },
}

#[derive(Debug, Clone, Copy, Arbitrary)]
enum PolicyChoice {
    Close,
    Requeue,
    Drop,
}

/// Expected queue contents of one connection.
#[derive(Debug, Default)]
struct ModelQueue {
    pending: VecDeque<Vec<u8>>,
    head_written: usize,
}

impl ModelQueue {
    /// Remaining bytes as the wire should see them.
    fn expected_stream(&self) -> Vec<u8> {
        let mut stream: Vec<u8> = self.pending.iter().flatten().copied().collect();
        stream.drain(..self.head_written);
        uppercase_in_place(&mut stream);
        stream
    }

    fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let head_len = self.pending.front().map_or(0, Vec::len);
            let left = head_len - self.head_written;
            if n >= left {
                self.pending.pop_front();
                self.head_written = 0;
                n -= left;
            } else {
                self.head_written += n;
                n = 0;
            }
        }
        // Completed heads are freed by the next drain, so the model drops them eagerly
        while self.pending.front().is_some_and(|head| head.len() == self.head_written) {
            self.pending.pop_front();
            self.head_written = 0;
        }
    }
}

/// Wire accepting a scripted number of bytes per call, failing after a set
/// number of calls.
struct FuzzWire {
    limits: VecDeque<u8>,
    calls_before_failure: Option<u8>,
    sent: Vec<u8>,
}

impl Wire for FuzzWire {
    fn write(&mut self, _descriptor: Descriptor, buf: &[u8]) -> io::Result<usize> {
        if let Some(calls) = self.calls_before_failure.as_mut() {
            if *calls == 0 {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            *calls -= 1;
        }

        let n = match self.limits.pop_front() {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(limit) => usize::from(limit).min(buf.len()),
            None => buf.len(),
        };
        self.sent.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

fn descriptor(raw: u8) -> Descriptor {
    Descriptor::new(4 + i32::from(raw % 16))
}

fuzz_target!(|scenario: PoolScenario| {
    let limit = scenario.queue_limit.map(|l| usize::from(l.max(1)));
    let mut pool = ConnectionPool::with_queue_limit(limit);
    let mut model: BTreeMap<Descriptor, ModelQueue> = BTreeMap::new();

    for op in scenario.ops {
        match op {
            PoolOp::Add(raw) => {
                let d = descriptor(raw);
                let added = pool.add(d).is_ok();
                assert_eq!(added, !model.contains_key(&d));
                model.entry(d).or_default();
            },
            PoolOp::Remove(raw) => {
                let d = descriptor(raw);
                assert_eq!(pool.remove(d).is_some(), model.remove(&d).is_some());
            },
            PoolOp::Broadcast { origin, payload, best_effort } => {
                if payload.is_empty() {
                    continue;
                }
                let origin = descriptor(origin);
                let policy =
                    if best_effort { BroadcastPolicy::BestEffort } else { BroadcastPolicy::AllOrNothing };
                let has_room =
                    |queue: &ModelQueue| limit.is_none_or(|limit| queue.pending.len() < limit);

                let any_full =
                    model.iter().any(|(&d, queue)| d != origin && !has_room(queue));
                let result = pool.broadcast_except(origin, &payload, policy);

                if any_full && !best_effort {
                    assert!(result.is_err(), "AllOrNothing committed despite a full peer");
                    continue;
                }

                let report = result.expect("broadcast failed without a full peer");
                let mut delivered = 0;
                for (&d, queue) in &mut model {
                    if d != origin && has_room(queue) {
                        queue.pending.push_back(payload.clone());
                        delivered += 1;
                    }
                }
                assert_eq!(report.delivered, delivered);
            },
            PoolOp::Drain { target, limits, fail_after, policy } => {
                let d = descriptor(target);
                let mut wire =
                    FuzzWire { limits: limits.into(), calls_before_failure: fail_after, sent: Vec::new() };

                let Some(queue) = model.get_mut(&d) else {
                    assert!(pool.drain(d, &mut wire).is_err());
                    continue;
                };

                let expected = queue.expected_stream();
                let result = pool.drain(d, &mut wire);

                assert_eq!(wire.sent.as_slice(), &expected[..wire.sent.len()]);
                queue.consume(wire.sent.len());

                match result {
                    Ok(DrainOutcome::Drained { .. }) => assert!(queue.pending.is_empty()),
                    Ok(DrainOutcome::Blocked { remaining, .. }) => {
                        assert_eq!(remaining, queue.pending.len());
                    },
                    Err(_) => {
                        let policy = match policy {
                            PolicyChoice::Close => WriteFailurePolicy::CloseConnection,
                            PolicyChoice::Requeue => WriteFailurePolicy::Requeue,
                            PolicyChoice::Drop => WriteFailurePolicy::DropPending,
                        };
                        let removed = pool.apply_write_failure(d, policy);
                        assert_eq!(removed, policy == WriteFailurePolicy::CloseConnection);
                        match policy {
                            WriteFailurePolicy::CloseConnection => {
                                model.remove(&d);
                            },
                            WriteFailurePolicy::Requeue => {},
                            WriteFailurePolicy::DropPending => *queue = ModelQueue::default(),
                        }
                    },
                }
            },
        }

        assert_eq!(pool.max_descriptor(), model.keys().next_back().copied());
        assert_eq!(pool.len(), model.len());
        for (&d, queue) in &model {
            assert_eq!(pool.write_interest().contains(d), !queue.pending.is_empty());
            let live = pool.get(d).expect("model and pool disagree on membership");
            assert_eq!(live.queue().len(), queue.pending.len());
        }
    }
});
