//! Readiness loop.
//!
//! Ties the [`ConnectionPool`] to a [`Reactor`]: each turn snapshots the
//! interest sets, waits for readiness, then walks the ready descriptors in
//! ascending order doing accept, read + fan-out, and drain work.
//!
//! # State Machine
//!
//! ```text
//!                ┌──────────────────────────┐
//!                ↓                          │ turn done / interrupted
//! ┌───────────────────────┐  ready   ┌─────────────┐
//! │ Blocked-on-Readiness  │─────────>│ Dispatching │
//! └───────────────────────┘          └─────────────┘
//!            │ shutdown token seen between turns
//!            ↓
//!     ┌─────────────┐
//!     │ Terminating │  close every connection, return stats
//!     └─────────────┘
//! ```
//!
//! Errors scoped to one connection (peer close, read error, write error) only
//! ever remove that connection. Only a failed readiness query ends the loop.

use std::io;

use tracing::{debug, error, info, trace, warn};

use crate::{
    broadcast::BroadcastPolicy,
    descriptor::Descriptor,
    drain::{DrainOutcome, WriteFailurePolicy},
    error::RelayError,
    pool::ConnectionPool,
    readiness::Reactor,
    shutdown::ShutdownToken,
};

/// Default capacity of the per-turn read buffer, i.e. the largest chunk
/// relayed as one message.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Largest chunk read from a client in one go
    pub read_buffer_size: usize,
    /// Handling of per-peer failures during fan-out
    pub broadcast_policy: BroadcastPolicy,
    /// Handling of hard write errors during drain
    pub write_failure_policy: WriteFailurePolicy,
    /// Backlog limit per connection, `None` for unbounded
    pub max_queued_messages: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            broadcast_policy: BroadcastPolicy::default(),
            write_failure_policy: WriteFailurePolicy::default(),
            max_queued_messages: None,
        }
    }
}

/// Counters accumulated over the relay's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    /// Connections accepted and tracked
    pub accepted: u64,
    /// Connections removed and closed, for any reason
    pub closed: u64,
    /// Chunks read from clients and handed to fan-out
    pub chunks_relayed: u64,
    /// Broadcasts abandoned under [`BroadcastPolicy::AllOrNothing`]
    pub broadcasts_aborted: u64,
    /// Drains that ended in a hard write error
    pub write_failures: u64,
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// Readiness arrived and every ready descriptor was dispatched
    Dispatched {
        /// Distinct descriptors that were ready
        ready: usize,
    },
    /// The wait was interrupted before anything became ready
    Interrupted,
}

/// Single-threaded chat relay driven by a [`Reactor`].
pub struct Relay<R: Reactor> {
    /// OS-facing readiness and socket I/O
    reactor: R,
    /// Live connections and interest sets
    pool: ConnectionPool,
    /// Relay configuration
    config: RelayConfig,
    /// Checked between turns
    shutdown: ShutdownToken,
    /// Reused for every read
    buffer: Vec<u8>,
    /// Lifetime counters
    stats: RelayStats,
}

impl<R: Reactor> Relay<R> {
    /// Create a relay over `reactor`.
    pub fn new(reactor: R, config: RelayConfig, shutdown: ShutdownToken) -> Result<Self, RelayError> {
        if config.read_buffer_size == 0 {
            return Err(RelayError::InvalidConfig("read_buffer_size must be at least 1".to_string()));
        }
        if config.max_queued_messages == Some(0) {
            return Err(RelayError::InvalidConfig(
                "max_queued_messages must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            pool: ConnectionPool::with_queue_limit(config.max_queued_messages),
            buffer: vec![0; config.read_buffer_size],
            reactor,
            config,
            shutdown,
            stats: RelayStats::default(),
        })
    }

    /// Run turns until the shutdown token is cancelled or the readiness query
    /// fails, then close every connection.
    pub fn run(mut self) -> Result<RelayStats, RelayError> {
        info!(listener = %self.reactor.listener(), "relay started");

        let result = self.serve();
        let closed = self.cleanup();

        match &result {
            Ok(()) => info!(closed, "relay stopped"),
            Err(e) => error!(error = %e, closed, "relay terminated"),
        }

        result.map(|()| self.stats)
    }

    fn serve(&mut self) -> Result<(), RelayError> {
        while !self.shutdown.is_cancelled() {
            if self.turn()? == Turn::Interrupted {
                debug!("readiness wait interrupted");
            }
        }
        Ok(())
    }

    /// Run one iteration: wait for readiness and dispatch it.
    pub fn turn(&mut self) -> Result<Turn, RelayError> {
        let listener = self.reactor.listener();

        let mut read = self.pool.read_interest().clone();
        read.insert(listener);
        let write = self.pool.write_interest().clone();
        let bound = self.pool.max_descriptor().map_or(listener, |max| max.max(listener));

        debug!(max = %bound, connections = self.pool.len(), "waiting for readiness");

        let readiness = match self.reactor.wait(&read, &write, bound) {
            Ok(readiness) => readiness,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Turn::Interrupted),
            Err(e) => return Err(RelayError::Multiplexer(e)),
        };

        let ready = readiness.ready_up_to(bound);

        for &descriptor in &ready {
            if readiness.readable.contains(descriptor) {
                if descriptor == listener {
                    self.accept_one();
                } else if self.pool.contains(descriptor) && !self.read_from(descriptor) {
                    continue;
                }
            }

            if readiness.writable.contains(descriptor) && self.pool.contains(descriptor) {
                self.write_to(descriptor);
            }
        }

        Ok(Turn::Dispatched { ready: ready.len() })
    }

    /// Remove and close every live connection. Returns how many were closed.
    pub fn cleanup(&mut self) -> usize {
        let reactor = &mut self.reactor;
        let closed = self.pool.cleanup_all(|descriptor| {
            debug!(%descriptor, "closing connection at shutdown");
            reactor.close(descriptor);
        });

        self.stats.closed += closed as u64;
        closed
    }

    fn accept_one(&mut self) {
        let descriptor = match self.reactor.accept() {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            },
        };

        if let Err(e) = self.pool.add(descriptor) {
            warn!(%descriptor, error = %e, "cannot track connection, closing it");
            self.reactor.close(descriptor);
            return;
        }

        self.stats.accepted += 1;
        info!(%descriptor, connections = self.pool.len(), "new incoming connection");
    }

    /// Read one chunk and fan it out. Returns `false` if the connection was
    /// removed.
    ///
    /// The descriptor was reported readable, so any read error, would-block
    /// and interrupted included, closes the connection without a retry.
    fn read_from(&mut self, descriptor: Descriptor) -> bool {
        match self.reactor.read(descriptor, &mut self.buffer) {
            Ok(0) => {
                self.close_connection(descriptor, "closed by peer");
                false
            },
            Ok(n) => {
                debug!(%descriptor, bytes = n, "chunk received");
                self.stats.chunks_relayed += 1;
                self.fan_out(descriptor, n);
                true
            },
            Err(e) => {
                warn!(%descriptor, error = %e, "read failed");
                self.close_connection(descriptor, "read error");
                false
            },
        }
    }

    fn fan_out(&mut self, origin: Descriptor, len: usize) {
        let payload = &self.buffer[..len];

        match self.pool.broadcast_except(origin, payload, self.config.broadcast_policy) {
            Ok(report) => {
                debug!(%origin, delivered = report.delivered, skipped = report.skipped, "chunk queued");
            },
            Err(e) => {
                self.stats.broadcasts_aborted += 1;
                warn!(%origin, error = %e, "broadcast aborted");
            },
        }
    }

    fn write_to(&mut self, descriptor: Descriptor) {
        match self.pool.drain(descriptor, &mut self.reactor) {
            Ok(DrainOutcome::Drained { messages }) => {
                trace!(%descriptor, messages, "queue drained");
            },
            Ok(DrainOutcome::Blocked { messages, remaining }) => {
                trace!(%descriptor, messages, remaining, "drain blocked");
            },
            Err(e) => {
                let policy = self.config.write_failure_policy;
                self.stats.write_failures += 1;
                warn!(%descriptor, error = %e, ?policy, "write failed");

                if self.pool.apply_write_failure(descriptor, policy) {
                    self.reactor.close(descriptor);
                    self.stats.closed += 1;
                    info!(%descriptor, reason = "write error", "removing connection");
                }
            },
        }
    }

    fn close_connection(&mut self, descriptor: Descriptor, reason: &str) {
        if self.pool.remove(descriptor).is_some() {
            self.reactor.close(descriptor);
            self.stats.closed += 1;
            info!(%descriptor, reason, "removing connection");
        }
    }

    /// Live connections and their queues.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Underlying reactor.
    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    /// Underlying reactor, mutably.
    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    /// Relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Counters so far.
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Token that stops [`Relay::run`] when cancelled.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }
}

impl<R: Reactor> std::fmt::Debug for Relay<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("listener", &self.reactor.listener())
            .field("connection_count", &self.pool.len())
            .field("max_descriptor", &self.pool.max_descriptor())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
