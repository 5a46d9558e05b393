//! Uprelay production server.
//!
//! Runs the [`uprelay_core::Relay`] loop over a mio multiplexer and one TCP
//! listener bound on all interfaces.
//!
//! # Components
//!
//! - [`Server`]: binds the listener and runs the relay to completion
//! - [`MioReactor`]: level-triggered view over mio's edge-triggered events
//! - [`ShutdownHandle`]: stops a running server from another thread
//! - [`spawn_interrupt_listener`]: SIGINT to [`ShutdownHandle::shutdown`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod reactor;
mod signal;

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

pub use error::ServerError;
use mio::Waker;
pub use reactor::{DEFAULT_EVENTS_CAPACITY, MioReactor};
pub use signal::spawn_interrupt_listener;
use tracing::{info, warn};
use uprelay_core::{Reactor, Relay, RelayConfig, RelayStats, ShutdownToken};

/// Server configuration for the production runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRuntimeConfig {
    /// Port to listen on, all interfaces. `0` picks an ephemeral port.
    pub port: u16,
    /// Capacity of the multiplexer's event buffer
    pub events_capacity: usize,
    /// Relay engine configuration
    pub relay: RelayConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self { port: 0, events_capacity: DEFAULT_EVENTS_CAPACITY, relay: RelayConfig::default() }
    }
}

/// Bound, not yet running, relay server.
#[derive(Debug)]
pub struct Server {
    relay: Relay<MioReactor>,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listener and prepare the relay.
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.events_capacity == 0 {
            return Err(ServerError::Config("events_capacity must be at least 1".to_string()));
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let reactor = MioReactor::bind(addr, config.events_capacity)
            .map_err(|source| ServerError::Bind { port: config.port, source })?;
        let local_addr = reactor.local_addr()?;

        let relay = Relay::new(reactor, config.relay, ShutdownToken::new())?;
        info!(%local_addr, listener = %relay.reactor().listener(), "listening");

        Ok(Self { relay, local_addr })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops [`Server::run`] from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { token: self.relay.shutdown_token(), waker: self.relay.reactor().waker() }
    }

    /// Serve until shutdown is requested or the multiplexer fails. Every
    /// connection is closed before this returns.
    pub fn run(self) -> Result<RelayStats, ServerError> {
        let stats = self.relay.run()?;
        info!(
            accepted = stats.accepted,
            closed = stats.closed,
            chunks = stats.chunks_relayed,
            aborted = stats.broadcasts_aborted,
            write_failures = stats.write_failures,
            "server stopped"
        );
        Ok(stats)
    }
}

/// Cloneable request to stop a running [`Server`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: ShutdownToken,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Cancel the relay's token and wake its multiplexer. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake multiplexer");
        }
    }

    /// Shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}
