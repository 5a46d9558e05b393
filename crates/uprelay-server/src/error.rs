//! Server error types.

use std::io;

use thiserror::Error;
use uprelay_core::RelayError;

/// Errors that can occur in the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (zero event capacity, bad relay settings).
    ///
    /// Fatal, prevents startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Listening socket could not be bound.
    #[error("cannot listen on port {port}: {source}")]
    Bind {
        /// Requested port
        port: u16,
        /// Underlying socket error
        source: io::Error,
    },

    /// Multiplexer or socket setup failed after binding.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Interrupt handler could not be installed.
    #[error("cannot install interrupt handler: {0}")]
    Signal(#[source] io::Error),

    /// Relay loop stopped on a fatal error.
    #[error("relay error: {0}")]
    Relay(#[source] RelayError),
}

impl From<RelayError> for ServerError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidConfig(msg) => Self::Config(msg),
            RelayError::Multiplexer(source) => Self::Relay(RelayError::Multiplexer(source)),
        }
    }
}
