//! Error types for the relay engine.
//!
//! Errors are split by blast radius: [`PoolError`] and [`DrainError`] are
//! scoped to one connection or one broadcast and never stop the loop, while
//! [`RelayError`] is fatal and terminates [`crate::Relay::run`].

use std::{collections::TryReserveError, io};

use thiserror::Error;

use crate::descriptor::Descriptor;

/// Errors from connection pool bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Descriptor is already tracked by the pool
    #[error("{0} is already in the pool")]
    DuplicateDescriptor(Descriptor),

    /// Descriptor is not tracked by the pool
    #[error("{0} is not in the pool")]
    UnknownDescriptor(Descriptor),

    /// Outbound queue reached the configured backlog limit
    #[error("outbound queue for {descriptor} is full ({limit} messages)")]
    QueueFull {
        /// Connection whose queue is full
        descriptor: Descriptor,
        /// Configured limit
        limit: usize,
    },

    /// Memory for a connection or message could not be reserved
    #[error("allocation failed for {descriptor}: {source}")]
    Allocation {
        /// Connection the allocation was for
        descriptor: Descriptor,
        /// Underlying reservation failure
        source: TryReserveError,
    },
}

/// Errors from draining a connection's outbound queue.
#[derive(Error, Debug)]
pub enum DrainError {
    /// No connection matches the descriptor
    #[error("cannot drain unknown {0}")]
    UnknownDescriptor(Descriptor),

    /// Writing to the socket failed
    #[error("write to {descriptor} failed after {written} messages: {source}")]
    Write {
        /// Connection being drained
        descriptor: Descriptor,
        /// Messages fully written (and freed) before the failure
        written: usize,
        /// Underlying I/O error
        source: io::Error,
    },
}

impl DrainError {
    /// Descriptor the failed drain targeted.
    pub fn descriptor(&self) -> Descriptor {
        match self {
            Self::UnknownDescriptor(descriptor) | Self::Write { descriptor, .. } => *descriptor,
        }
    }
}

/// Fatal errors that stop the readiness loop.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Relay configuration is unusable
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),

    /// The readiness query failed for a reason other than interruption
    #[error("readiness query failed: {0}")]
    Multiplexer(#[source] io::Error),
}
