//! Write drain.
//!
//! Drains one connection's outbound queue to the wire. Each message is
//! uppercased in place right before it is written, then freed once every byte
//! has been accepted by the socket.
//!
//! Short writes and would-block are back-pressure, not failures: the unwritten
//! tail stays at the head of the queue and write interest is kept, so the next
//! writable event resumes at the exact byte where this one stopped. Hard write
//! errors are reported to the caller, which applies a [`WriteFailurePolicy`].

use std::io;

use tracing::trace;

use crate::{descriptor::Descriptor, error::DrainError, pool::ConnectionPool};

/// Sink for outbound bytes.
pub trait Wire {
    /// Write as many bytes of `buf` as the socket accepts without blocking.
    fn write(&mut self, descriptor: Descriptor, buf: &[u8]) -> io::Result<usize>;
}

/// What happens to a connection whose drain hit a hard write error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteFailurePolicy {
    /// Remove and close the connection, discarding its queue.
    #[default]
    CloseConnection,
    /// Keep the connection and its queue; retry on the next writable event.
    ///
    /// Reactors report a socket whose write failed as writable again only
    /// after a fresh writable edge, so a persistent error is not retried in a
    /// loop.
    Requeue,
    /// Keep the connection but discard everything still queued.
    DropPending,
}

/// Result of a drain that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Queue is empty and write interest was cleared.
    Drained {
        /// Messages fully written by this drain
        messages: usize,
    },
    /// Socket stopped accepting bytes; the rest waits for the next writable
    /// event.
    Blocked {
        /// Messages fully written by this drain
        messages: usize,
        /// Messages still queued, including the partially written head
        remaining: usize,
    },
}

impl ConnectionPool {
    /// Write every queued message for `descriptor` to `wire`, in order.
    ///
    /// On [`DrainError::Write`] the messages already written are freed and the
    /// failing message is still at the head of the queue, with write interest
    /// unchanged.
    pub fn drain<W>(&mut self, descriptor: Descriptor, wire: &mut W) -> Result<DrainOutcome, DrainError>
    where
        W: Wire + ?Sized,
    {
        let conn = self.get_mut(descriptor).ok_or(DrainError::UnknownDescriptor(descriptor))?;
        let queue = conn.queue_mut();
        let mut messages = 0;

        while let Some(message) = queue.front_mut() {
            if message.is_complete() {
                queue.pop_front();
                messages += 1;
                continue;
            }

            message.uppercase();

            match wire.write(descriptor, message.remaining()) {
                Ok(0) => {
                    return Err(DrainError::Write {
                        descriptor,
                        written: messages,
                        source: io::Error::from(io::ErrorKind::WriteZero),
                    });
                },
                Ok(n) => {
                    message.advance(n);
                    if !message.is_complete() {
                        trace!(%descriptor, n, left = message.remaining().len(), "short write");
                        return Ok(DrainOutcome::Blocked { messages, remaining: queue.len() });
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(DrainOutcome::Blocked { messages, remaining: queue.len() });
                },
                Err(source) => {
                    return Err(DrainError::Write { descriptor, written: messages, source });
                },
            }
        }

        self.clear_write_interest(descriptor);
        Ok(DrainOutcome::Drained { messages })
    }

    /// Apply `policy` after a failed drain.
    ///
    /// Returns `true` if the connection was removed from the pool, in which
    /// case the caller must close the descriptor.
    pub fn apply_write_failure(&mut self, descriptor: Descriptor, policy: WriteFailurePolicy) -> bool {
        match policy {
            WriteFailurePolicy::CloseConnection => self.remove(descriptor).is_some(),
            WriteFailurePolicy::Requeue => false,
            WriteFailurePolicy::DropPending => {
                if let Some(conn) = self.get_mut(descriptor) {
                    conn.queue_mut().clear();
                }
                self.clear_write_interest(descriptor);
                false
            },
        }
    }
}
