//! In-memory reactor for deterministic tests.
//!
//! `SimReactor` implements [`Reactor`] without any sockets. Tests play the
//! client side directly (connect, send, hang up) and script faults such as
//! read/write errors, short writes, blocked writes and interrupted waits.
//! A failed write stalls the peer's writability until
//! [`SimReactor::signal_writable`], the way a hard socket error only clears on
//! the next writable edge.
//! Descriptors are allocated the way a POSIX kernel does: lowest free number
//! above the listener, reused once closed.
//!
//! A wait with nothing ready would block forever on a real multiplexer. Here
//! it either cancels the token registered with [`SimReactor::cancel_when_idle`]
//! and returns an empty report, or fails with [`io::ErrorKind::TimedOut`].

use std::{
    collections::{BTreeMap, VecDeque},
    io,
};

use crate::{
    descriptor::{Descriptor, DescriptorSet},
    drain::Wire,
    readiness::{Reactor, Readiness},
    shutdown::ShutdownToken,
};

/// Descriptor the simulated listener occupies, after stdin/stdout/stderr.
pub const SIM_LISTENER: Descriptor = Descriptor::new(3);

#[derive(Debug)]
enum WriteStep {
    Fail(io::ErrorKind),
    Limit(usize),
}

#[derive(Debug)]
enum AcceptStep {
    Fail(io::ErrorKind),
    Reissue(Descriptor),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// Waiting in the accept backlog
    #[default]
    Pending,
    Accepted,
    Closed,
}

/// Client end of one simulated connection.
#[derive(Debug, Default)]
struct SimPeer {
    state: PeerState,
    hung_up: bool,
    blocked: bool,
    /// Set by a failed write, cleared by the next writable signal
    stalled: bool,
    inbound: VecDeque<Vec<u8>>,
    read_faults: VecDeque<io::ErrorKind>,
    write_steps: VecDeque<WriteStep>,
    received: Vec<u8>,
    writes: Vec<Vec<u8>>,
}

impl SimPeer {
    fn is_open(&self) -> bool {
        self.state != PeerState::Closed
    }

    fn is_readable(&self) -> bool {
        !self.inbound.is_empty() || self.hung_up || !self.read_faults.is_empty()
    }
}

/// Deterministic, socket-free [`Reactor`].
#[derive(Debug, Default)]
pub struct SimReactor {
    peers: BTreeMap<Descriptor, SimPeer>,
    backlog: VecDeque<Descriptor>,
    accept_steps: VecDeque<AcceptStep>,
    wait_faults: VecDeque<io::ErrorKind>,
    closed: Vec<Descriptor>,
    waits: usize,
    idle_token: Option<ShutdownToken>,
}

impl SimReactor {
    /// Create a reactor with no connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client connection. It sits in the accept backlog until the
    /// relay accepts it.
    pub fn connect(&mut self) -> Descriptor {
        let mut raw = SIM_LISTENER.raw() + 1;
        while self.peers.get(&Descriptor::new(raw)).is_some_and(SimPeer::is_open) {
            raw += 1;
        }

        let descriptor = Descriptor::new(raw);
        self.peers.insert(descriptor, SimPeer::default());
        self.backlog.push_back(descriptor);
        descriptor
    }

    /// Queue `bytes` to arrive on `descriptor` as a single chunk.
    pub fn send(&mut self, descriptor: Descriptor, bytes: &[u8]) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.inbound.push_back(bytes.to_vec());
        }
    }

    /// Close the client end. Reads drain queued chunks, then return 0.
    pub fn hang_up(&mut self, descriptor: Descriptor) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.hung_up = true;
        }
    }

    /// Make the next read on `descriptor` fail with `kind`.
    pub fn fail_next_read(&mut self, descriptor: Descriptor, kind: io::ErrorKind) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.read_faults.push_back(kind);
        }
    }

    /// Make the next write on `descriptor` fail with `kind`.
    pub fn fail_next_write(&mut self, descriptor: Descriptor, kind: io::ErrorKind) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.write_steps.push_back(WriteStep::Fail(kind));
        }
    }

    /// Make the next write on `descriptor` accept at most `limit` bytes.
    pub fn limit_next_write(&mut self, descriptor: Descriptor, limit: usize) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.write_steps.push_back(WriteStep::Limit(limit));
        }
    }

    /// Stop (or resume) reporting `descriptor` writable. Writes while blocked
    /// return [`io::ErrorKind::WouldBlock`]. Resuming also clears a stall left
    /// by a failed write.
    pub fn block_writes(&mut self, descriptor: Descriptor, blocked: bool) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.blocked = blocked;
            peer.stalled &= blocked;
        }
    }

    /// Deliver a writable edge: `descriptor` is reported writable again after
    /// a failed write.
    pub fn signal_writable(&mut self, descriptor: Descriptor) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.stalled = false;
        }
    }

    /// Make the next accept fail with `kind`.
    pub fn fail_next_accept(&mut self, kind: io::ErrorKind) {
        self.accept_steps.push_back(AcceptStep::Fail(kind));
    }

    /// Make the next accept hand out `descriptor` although it is already
    /// connected, as if the relay had missed its close.
    pub fn reissue_next_accept(&mut self, descriptor: Descriptor) {
        self.accept_steps.push_back(AcceptStep::Reissue(descriptor));
    }

    /// Make the next wait return [`io::ErrorKind::Interrupted`].
    pub fn interrupt_next_wait(&mut self) {
        self.wait_faults.push_back(io::ErrorKind::Interrupted);
    }

    /// Make the next wait fail with `kind`.
    pub fn fail_next_wait(&mut self, kind: io::ErrorKind) {
        self.wait_faults.push_back(kind);
    }

    /// Cancel `token` the first time a wait finds nothing ready.
    pub fn cancel_when_idle(&mut self, token: ShutdownToken) {
        self.idle_token = Some(token);
    }

    /// Every byte the relay wrote to `descriptor`.
    pub fn received(&self, descriptor: Descriptor) -> &[u8] {
        self.peers.get(&descriptor).map_or(&[], |peer| peer.received.as_slice())
    }

    /// Bytes accepted by each individual write call on `descriptor`.
    pub fn writes(&self, descriptor: Descriptor) -> &[Vec<u8>] {
        self.peers.get(&descriptor).map_or(&[], |peer| peer.writes.as_slice())
    }

    /// `descriptor` is connected and not yet closed by the relay.
    pub fn is_open(&self, descriptor: Descriptor) -> bool {
        self.peers.get(&descriptor).is_some_and(SimPeer::is_open)
    }

    /// Descriptors the relay closed, in order.
    pub fn closed(&self) -> &[Descriptor] {
        &self.closed
    }

    /// Number of readiness queries made so far.
    pub fn waits(&self) -> usize {
        self.waits
    }

    fn open_peer_mut(&mut self, descriptor: Descriptor) -> Option<&mut SimPeer> {
        self.peers.get_mut(&descriptor).filter(|peer| peer.is_open())
    }

    fn accepted_peer_mut(&mut self, descriptor: Descriptor) -> io::Result<&mut SimPeer> {
        self.open_peer_mut(descriptor)
            .filter(|peer| peer.state == PeerState::Accepted)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Wire for SimReactor {
    fn write(&mut self, descriptor: Descriptor, buf: &[u8]) -> io::Result<usize> {
        let peer = self.accepted_peer_mut(descriptor)?;

        let n = match peer.write_steps.pop_front() {
            Some(WriteStep::Fail(kind)) => {
                peer.stalled |= kind != io::ErrorKind::Interrupted;
                return Err(kind.into());
            },
            Some(WriteStep::Limit(limit)) => limit.min(buf.len()),
            None if peer.blocked => return Err(io::ErrorKind::WouldBlock.into()),
            None => buf.len(),
        };

        if n > 0 {
            peer.received.extend_from_slice(&buf[..n]);
            peer.writes.push(buf[..n].to_vec());
        }
        Ok(n)
    }
}

impl Reactor for SimReactor {
    fn listener(&self) -> Descriptor {
        SIM_LISTENER
    }

    fn wait(
        &mut self,
        read: &DescriptorSet,
        write: &DescriptorSet,
        bound: Descriptor,
    ) -> io::Result<Readiness> {
        self.waits += 1;

        if let Some(kind) = self.wait_faults.pop_front() {
            return Err(kind.into());
        }

        let mut readiness = Readiness::default();

        let accept_pending = !self.backlog.is_empty() || !self.accept_steps.is_empty();
        if accept_pending && read.contains(SIM_LISTENER) {
            readiness.readable.insert(SIM_LISTENER);
        }

        for (&descriptor, peer) in self.peers.range_mut(..=bound) {
            if peer.state != PeerState::Accepted {
                continue;
            }
            if read.contains(descriptor) && peer.is_readable() {
                readiness.readable.insert(descriptor);
            }
            if !write.contains(descriptor) {
                // Dropping write interest re-arms the next writable edge
                peer.stalled = false;
            } else if !peer.blocked && !peer.stalled {
                readiness.writable.insert(descriptor);
            }
        }

        if !readiness.is_empty() {
            return Ok(readiness);
        }
        if let Some(token) = &self.idle_token {
            token.cancel();
            return Ok(readiness);
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "nothing will ever become ready"))
    }

    fn accept(&mut self) -> io::Result<Option<Descriptor>> {
        match self.accept_steps.pop_front() {
            Some(AcceptStep::Fail(kind)) => return Err(kind.into()),
            Some(AcceptStep::Reissue(descriptor)) => return Ok(Some(descriptor)),
            None => {},
        }

        while let Some(descriptor) = self.backlog.pop_front() {
            if let Some(peer) = self.open_peer_mut(descriptor) {
                peer.state = PeerState::Accepted;
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }

    fn read(&mut self, descriptor: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        let peer = self.accepted_peer_mut(descriptor)?;

        if let Some(kind) = peer.read_faults.pop_front() {
            return Err(kind.into());
        }

        let Some(chunk) = peer.inbound.front_mut() else {
            return if peer.hung_up { Ok(0) } else { Err(io::ErrorKind::WouldBlock.into()) };
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n == chunk.len() {
            peer.inbound.pop_front();
        } else {
            chunk.drain(..n);
        }
        Ok(n)
    }

    fn close(&mut self, descriptor: Descriptor) {
        if let Some(peer) = self.open_peer_mut(descriptor) {
            peer.state = PeerState::Closed;
            self.closed.push(descriptor);
        }
    }
}
