//! Fuzz target for the readiness loop over the simulated reactor
//!
//! Exercise connection churn and I/O faults through the whole loop
//!
//! # Strategy
//!
//! - Clients connect, send, hang up and reconnect (descriptor reuse)
//! - Read faults, write faults, short writes, blocked peers, interrupted waits
//! - Random relay configuration (buffer size, policies, backlog limit)
//!
//! # Invariants
//!
//! - A turn never fails when the multiplexer itself does not
//! - Pool membership matches the set of open, accepted connections
//! - Clients never receive an ASCII lowercase byte
//! - Once every peer is unblocked and writable again the loop goes idle with
//!   nothing queued

#![no_main]

use std::io;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use uprelay_core::{
    BroadcastPolicy, Descriptor, Relay, RelayConfig, ShutdownToken, WriteFailurePolicy,
    sim::SimReactor,
};

#[derive(Debug, Clone, Arbitrary)]
struct RelayScenario {
    read_buffer_size: u8,
    best_effort: bool,
    write_policy: u8,
    queue_limit: Option<u8>,
    ops: Vec<ClientOp>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ClientOp {
    Connect,
    Send { client: u8, bytes: Vec<u8> },
    HangUp { client: u8 },
    FailRead { client: u8 },
    FailWrite { client: u8 },
    LimitWrite { client: u8, limit: u8 },
    Block { client: u8, blocked: bool },
    InterruptWait,
    Pump,
}

fn pump(relay: &mut Relay<SimReactor>) {
    let idle = ShutdownToken::new();
    relay.reactor_mut().cancel_when_idle(idle.clone());
    for _ in 0..10_000 {
        if idle.is_cancelled() {
            return;
        }
        relay.turn().expect("turn failed without a multiplexer fault");
    }
    panic!("relay never went idle");
}

fuzz_target!(|scenario: RelayScenario| {
    let config = RelayConfig {
        read_buffer_size: usize::from(scenario.read_buffer_size.max(1)),
        broadcast_policy: if scenario.best_effort {
            BroadcastPolicy::BestEffort
        } else {
            BroadcastPolicy::AllOrNothing
        },
        write_failure_policy: match scenario.write_policy % 3 {
            0 => WriteFailurePolicy::CloseConnection,
            1 => WriteFailurePolicy::Requeue,
            _ => WriteFailurePolicy::DropPending,
        },
        max_queued_messages: scenario.queue_limit.map(|l| usize::from(l.max(1))),
    };
    let mut relay = Relay::new(SimReactor::new(), config, ShutdownToken::new()).expect("valid config");
    let mut clients: Vec<Descriptor> = Vec::new();
    // Each round clears at most one scripted write failure per peer
    let settle_rounds = scenario.ops.len() + 1;

    let pick = |clients: &[Descriptor], i: u8| -> Option<Descriptor> {
        (!clients.is_empty()).then(|| clients[usize::from(i) % clients.len()])
    };

    for op in scenario.ops {
        let sim = relay.reactor_mut();
        match op {
            ClientOp::Connect => clients.push(sim.connect()),
            ClientOp::Send { client, bytes } => {
                if let Some(d) = pick(&clients, client)
                    && !bytes.is_empty()
                {
                    sim.send(d, &bytes);
                }
            },
            ClientOp::HangUp { client } => {
                if let Some(d) = pick(&clients, client) {
                    sim.hang_up(d);
                }
            },
            ClientOp::FailRead { client } => {
                if let Some(d) = pick(&clients, client) {
                    sim.fail_next_read(d, io::ErrorKind::ConnectionReset);
                }
            },
            ClientOp::FailWrite { client } => {
                if let Some(d) = pick(&clients, client) {
                    sim.fail_next_write(d, io::ErrorKind::BrokenPipe);
                }
            },
            ClientOp::LimitWrite { client, limit } => {
                if let Some(d) = pick(&clients, client) {
                    sim.limit_next_write(d, usize::from(limit.max(1)));
                }
            },
            ClientOp::Block { client, blocked } => {
                if let Some(d) = pick(&clients, client) {
                    sim.block_writes(d, blocked);
                }
            },
            ClientOp::InterruptWait => sim.interrupt_next_wait(),
            ClientOp::Pump => pump(&mut relay),
        }

        clients.retain(|&d| relay.reactor().is_open(d));
    }

    for _ in 0..settle_rounds {
        if relay.pool().write_interest().is_empty() {
            break;
        }
        for &d in &clients {
            relay.reactor_mut().block_writes(d, false);
        }
        pump(&mut relay);
        clients.retain(|&d| relay.reactor().is_open(d));
    }

    for &d in &clients {
        assert!(!relay.reactor().received(d).iter().any(u8::is_ascii_lowercase));
        if relay.pool().contains(d) {
            assert!(relay.reactor().is_open(d));
        }
    }
    for d in relay.pool().descriptors() {
        assert!(relay.reactor().is_open(d), "pool tracks a closed descriptor");
    }
    assert!(relay.pool().write_interest().is_empty(), "queued bytes left after going idle");
    assert_eq!(relay.pool().max_descriptor(), relay.pool().descriptors().max());
});
