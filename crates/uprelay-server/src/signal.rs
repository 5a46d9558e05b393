//! Interrupt handling.
//!
//! The relay loop is single-threaded and blocks in the multiplexer, so the
//! interrupt is awaited on a dedicated thread running a small tokio runtime.
//! On SIGINT the thread cancels the shutdown token and wakes the multiplexer;
//! the loop notices the token at its next check and shuts down.

use std::thread::JoinHandle;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use crate::{ServerError, ShutdownHandle};

/// Spawn the thread that turns SIGINT into a graceful shutdown.
///
/// The SIGINT handler is installed before this returns; an interrupt that
/// arrives while the thread is still starting is delivered to it.
pub fn spawn_interrupt_listener(handle: ShutdownHandle) -> Result<JoinHandle<()>, ServerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(ServerError::Signal)?;

    let mut interrupts = {
        let _guard = runtime.enter();
        signal(SignalKind::interrupt()).map_err(ServerError::Signal)?
    };

    std::thread::Builder::new()
        .name("uprelay-signal".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if interrupts.recv().await.is_some() {
                    info!("interrupt received, shutting down");
                    handle.shutdown();
                } else {
                    error!("interrupt stream closed");
                }
            });
        })
        .map_err(ServerError::Signal)
}
