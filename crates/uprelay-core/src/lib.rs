//! Uprelay relay engine.
//!
//! Single-threaded chat relay core: every chunk read from one client is queued
//! for every other client and uppercased just before it is written out.
//!
//! # Architecture
//!
//! The engine never touches sockets itself. [`Relay`] drives a
//! [`ConnectionPool`] from readiness reports produced by a [`Reactor`], so the
//! same loop runs against mio in production (`uprelay-server`) and against
//! [`sim::SimReactor`] in tests.
//!
//! # Components
//!
//! - [`ConnectionPool`]: live connections, interest sets, cached max descriptor
//! - [`OutboundQueue`]: per-connection FIFO of pending [`Message`]s
//! - [`ConnectionPool::broadcast_except`]: fan-out under a [`BroadcastPolicy`]
//! - [`ConnectionPool::drain`]: resumable uppercase-and-write of one queue
//! - [`Relay`]: the readiness loop
//! - [`ShutdownToken`]: cooperative stop signal checked between turns

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod descriptor;
mod drain;
mod error;
mod message;
mod pool;
mod queue;
mod readiness;
mod relay;
mod shutdown;
pub mod sim;

pub use broadcast::{BroadcastPolicy, BroadcastReport};
pub use descriptor::{Descriptor, DescriptorSet};
pub use drain::{DrainOutcome, Wire, WriteFailurePolicy};
pub use error::{DrainError, PoolError, RelayError};
pub use message::{Message, uppercase_in_place};
pub use pool::{Connection, ConnectionPool};
pub use queue::OutboundQueue;
pub use readiness::{Reactor, Readiness};
pub use relay::{DEFAULT_READ_BUFFER_SIZE, Relay, RelayConfig, RelayStats, Turn};
pub use shutdown::ShutdownToken;
