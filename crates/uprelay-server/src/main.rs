//! Uprelay server binary.
//!
//! # Usage
//!
//! ```bash
//! # Relay on port 9034, all interfaces
//! uprelay-server 9034
//!
//! # Same, with per-chunk traffic logged
//! RUST_LOG=debug uprelay-server 9034
//! ```

use clap::{Parser, error::ErrorKind};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uprelay_server::{Server, ServerRuntimeConfig, spawn_interrupt_listener};

const USAGE: &str = "Usage: uprelay-server <port>";

/// Uppercasing chat relay
#[derive(Parser, Debug)]
#[command(name = "uprelay-server")]
#[command(about = "Relays every client's text, uppercased, to every other client")]
#[command(version)]
struct Args {
    /// TCP port to listen on, all interfaces
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
}

#[allow(clippy::print_stdout)]
fn print_usage() {
    println!("{USAGE}");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(_) => {
            print_usage();
            return Ok(());
        },
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("uprelay server starting");

    let server = Server::bind(ServerRuntimeConfig { port: args.port, ..Default::default() })?;
    spawn_interrupt_listener(server.shutdown_handle())?;

    tracing::info!("Server listening on {}", server.local_addr());

    server.run()?;

    Ok(())
}
