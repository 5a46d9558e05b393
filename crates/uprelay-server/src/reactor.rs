//! mio-backed reactor.
//!
//! mio delivers edge-triggered events, while the relay loop expects the
//! level-triggered view of a `select(2)` scan: it accepts one connection and
//! reads one chunk per descriptor per turn, and expects the rest to be
//! reported again on the next turn. The reactor bridges the two by carrying
//! readiness across turns:
//!
//! - a stream becomes readable on an event only if a peek shows input (data,
//!   EOF or a pending error), so a stale edge never reports it;
//! - a descriptor stays readable until a read (or a peek after a read) would
//!   block, and the listener stays readable until an accept would block;
//! - a write-interested descriptor counts as writable until a write would
//!   block or fails, and becomes writable again on the next writable event.
//!
//! While any readiness is carried the poll does not block.

use std::{
    collections::{HashMap, HashSet},
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::Arc,
    time::Duration,
};

use mio::{
    Events, Interest, Poll, Token, Waker,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, trace};
use uprelay_core::{Descriptor, DescriptorSet, Reactor, Readiness, Wire};

/// Token reserved for the shutdown waker. Never a valid descriptor.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Default capacity of the event buffer filled by one poll.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

struct Registered {
    stream: TcpStream,
    interest: Interest,
}

/// [`Reactor`] over a mio [`Poll`] and one listening socket.
pub struct MioReactor {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listener: TcpListener,
    listener_descriptor: Descriptor,
    streams: HashMap<Descriptor, Registered>,
    /// Descriptors whose readability has not yet been exhausted
    readable: HashSet<Descriptor>,
    /// Write-interested descriptors whose last write would have blocked or
    /// failed
    write_blocked: HashSet<Descriptor>,
}

fn token(descriptor: Descriptor) -> Token {
    Token(descriptor.raw() as usize)
}

fn descriptor_of(source: &impl AsRawFd) -> Descriptor {
    Descriptor::new(source.as_raw_fd())
}

impl MioReactor {
    /// Bind a non-blocking listener on `addr` and register it for accepts.
    pub fn bind(addr: SocketAddr, events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let listener_descriptor = descriptor_of(&listener);

        poll.registry().register(&mut listener, token(listener_descriptor), Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity),
            waker,
            listener,
            listener_descriptor,
            streams: HashMap::new(),
            readable: HashSet::new(),
            write_blocked: HashSet::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waker that interrupts a blocked [`Reactor::wait`].
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Number of accepted streams not yet closed.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Bring each stream's registration in line with the loop's write
    /// interest.
    fn sync_interest(&mut self, write: &DescriptorSet) -> io::Result<()> {
        for (&descriptor, registered) in &mut self.streams {
            let wanted = if write.contains(descriptor) {
                Interest::READABLE | Interest::WRITABLE
            } else {
                self.write_blocked.remove(&descriptor);
                Interest::READABLE
            };

            if registered.interest != wanted {
                self.poll.registry().reregister(&mut registered.stream, token(descriptor), wanted)?;
                registered.interest = wanted;
            }
        }
        Ok(())
    }

    fn carried(&self, read: &DescriptorSet, write: &DescriptorSet, bound: Descriptor) -> Readiness {
        let readable = self
            .readable
            .iter()
            .copied()
            .filter(|&descriptor| descriptor <= bound && read.contains(descriptor))
            .collect();
        let writable = write
            .iter_up_to(bound)
            .filter(|descriptor| self.streams.contains_key(descriptor))
            .filter(|descriptor| !self.write_blocked.contains(descriptor))
            .collect();

        Readiness { readable, writable }
    }

    /// A peek shows data, EOF or a pending error on `descriptor`.
    fn has_input(&self, descriptor: Descriptor) -> bool {
        self.streams.get(&descriptor).is_some_and(|registered| {
            !matches!(registered.stream.peek(&mut [0; 1]), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
        })
    }

    fn register_stream(&mut self, mut stream: TcpStream) -> io::Result<Descriptor> {
        let descriptor = descriptor_of(&stream);
        self.poll.registry().register(&mut stream, token(descriptor), Interest::READABLE)?;
        self.streams.insert(descriptor, Registered { stream, interest: Interest::READABLE });
        Ok(descriptor)
    }

    fn stream_mut(&mut self, descriptor: Descriptor) -> io::Result<&mut TcpStream> {
        self.streams
            .get_mut(&descriptor)
            .map(|registered| &mut registered.stream)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Wire for MioReactor {
    fn write(&mut self, descriptor: Descriptor, buf: &[u8]) -> io::Result<usize> {
        let result = self.stream_mut(descriptor)?.write(buf);
        if matches!(&result, Err(e) if e.kind() != io::ErrorKind::Interrupted) {
            self.write_blocked.insert(descriptor);
        }
        result
    }
}

impl Reactor for MioReactor {
    fn listener(&self) -> Descriptor {
        self.listener_descriptor
    }

    fn wait(
        &mut self,
        read: &DescriptorSet,
        write: &DescriptorSet,
        bound: Descriptor,
    ) -> io::Result<Readiness> {
        self.sync_interest(write)?;

        let timeout =
            if self.carried(read, write, bound).is_empty() { None } else { Some(Duration::ZERO) };
        self.poll.poll(&mut self.events, timeout)?;

        for event in &self.events {
            if event.token() == WAKER_TOKEN {
                trace!("multiplexer woken");
                continue;
            }
            let Ok(raw) = i32::try_from(event.token().0) else {
                continue;
            };

            let descriptor = Descriptor::new(raw);
            let is_listener = descriptor == self.listener_descriptor;
            if !is_listener && !self.streams.contains_key(&descriptor) {
                continue;
            }
            if (event.is_readable() || event.is_read_closed() || event.is_error())
                && (is_listener || self.has_input(descriptor))
            {
                self.readable.insert(descriptor);
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                self.write_blocked.remove(&descriptor);
            }
        }

        Ok(self.carried(read, write, bound))
    }

    fn accept(&mut self) -> io::Result<Option<Descriptor>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let descriptor = self.register_stream(stream)?;
                    debug!(%descriptor, %peer, "accepted stream");
                    return Ok(Some(descriptor));
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readable.remove(&self.listener_descriptor);
                    return Ok(None);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
    }

    fn read(&mut self, descriptor: Descriptor, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream_mut(descriptor)?;

        let n = match stream.read(buf) {
            Ok(n) => n,
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    self.readable.remove(&descriptor);
                }
                return Err(e);
            },
        };

        // Only forget readability once the socket is known to be empty. EOF
        // and pending errors keep it readable so the next read reports them.
        if n > 0 && matches!(stream.peek(&mut [0; 1]), Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.readable.remove(&descriptor);
        }
        Ok(n)
    }

    fn close(&mut self, descriptor: Descriptor) {
        self.readable.remove(&descriptor);
        self.write_blocked.remove(&descriptor);

        if let Some(mut registered) = self.streams.remove(&descriptor)
            && let Err(e) = self.poll.registry().deregister(&mut registered.stream)
        {
            debug!(%descriptor, error = %e, "deregister failed");
        }
    }
}

impl std::fmt::Debug for MioReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioReactor")
            .field("listener", &self.listener_descriptor)
            .field("streams", &self.streams.len())
            .field("readable", &self.readable.len())
            .field("write_blocked", &self.write_blocked.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, TcpStream as StdTcpStream},
        time::Instant,
    };

    use super::*;

    fn loopback_reactor() -> MioReactor {
        MioReactor::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), 64).unwrap()
    }

    fn interest(descriptors: &[Descriptor]) -> DescriptorSet {
        descriptors.iter().copied().collect()
    }

    /// Poll until `descriptor` is reported readable.
    fn wait_readable(reactor: &mut MioReactor, descriptor: Descriptor) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let read = interest(&[reactor.listener(), descriptor]);
        let bound = descriptor.max(reactor.listener());
        loop {
            assert!(Instant::now() < deadline, "{descriptor} never became readable");
            let readiness = reactor.wait(&read, &DescriptorSet::new(), bound).unwrap();
            if readiness.readable.contains(descriptor) {
                return;
            }
        }
    }

    fn accept_one(reactor: &mut MioReactor) -> Descriptor {
        let listener = reactor.listener();
        wait_readable(reactor, listener);
        reactor.accept().unwrap().unwrap()
    }

    #[test]
    fn accept_then_listener_goes_quiet() {
        let mut reactor = loopback_reactor();
        let _client = StdTcpStream::connect(reactor.local_addr().unwrap()).unwrap();

        let descriptor = accept_one(&mut reactor);
        assert_ne!(descriptor, reactor.listener());
        assert_eq!(reactor.stream_count(), 1);

        assert_eq!(reactor.accept().unwrap(), None);
    }

    #[test]
    fn readability_is_carried_until_drained() {
        let mut reactor = loopback_reactor();
        let mut client = StdTcpStream::connect(reactor.local_addr().unwrap()).unwrap();
        let descriptor = accept_one(&mut reactor);

        client.write_all(b"abcdef").unwrap();
        wait_readable(&mut reactor, descriptor);

        let mut buf = [0; 4];
        let mut got = Vec::new();
        while got.len() < 6 {
            wait_readable(&mut reactor, descriptor);
            let n = reactor.read(descriptor, &mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"abcdef");

        drop(client);
        wait_readable(&mut reactor, descriptor);
        assert_eq!(reactor.read(descriptor, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_interest_reports_writable() {
        let mut reactor = loopback_reactor();
        let mut client = StdTcpStream::connect(reactor.local_addr().unwrap()).unwrap();
        let descriptor = accept_one(&mut reactor);

        let write = interest(&[descriptor]);
        let readiness = reactor.wait(&DescriptorSet::new(), &write, descriptor).unwrap();
        assert!(readiness.writable.contains(descriptor));

        assert_eq!(reactor.write(descriptor, b"pong").unwrap(), 4);
        let mut buf = [0; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn stale_read_edge_is_not_reported() {
        let mut reactor = loopback_reactor();
        let mut client = StdTcpStream::connect(reactor.local_addr().unwrap()).unwrap();
        let descriptor = accept_one(&mut reactor);

        client.write_all(b"a").unwrap();
        wait_readable(&mut reactor, descriptor);
        let mut buf = [0; 8];
        assert_eq!(reactor.read(descriptor, &mut buf).unwrap(), 1);

        // Consume the next chunk before polling, leaving its edge queued
        client.write_all(b"b").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let n = loop {
            match reactor.read(descriptor, &mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "second chunk never arrived");
                    std::thread::sleep(Duration::from_millis(5));
                },
                Err(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"b");

        reactor.waker().wake().unwrap();
        let read = interest(&[reactor.listener(), descriptor]);
        let readiness = reactor.wait(&read, &DescriptorSet::new(), descriptor).unwrap();
        assert!(!readiness.readable.contains(descriptor));
    }

    #[test]
    fn failed_write_waits_for_next_writable_event() {
        let mut reactor = loopback_reactor();
        let client = StdTcpStream::connect(reactor.local_addr().unwrap()).unwrap();
        let descriptor = accept_one(&mut reactor);
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match reactor.write(descriptor, b"x") {
                Err(e) if e.kind() != io::ErrorKind::WouldBlock => break e,
                _ => {
                    assert!(Instant::now() < deadline, "writes to a departed peer never failed");
                    std::thread::sleep(Duration::from_millis(5));
                },
            }
        };
        assert_ne!(err.kind(), io::ErrorKind::Interrupted);

        let write = interest(&[descriptor]);
        let carried = reactor.carried(&DescriptorSet::new(), &write, descriptor);
        assert!(!carried.writable.contains(descriptor));
    }

    #[test]
    fn closed_descriptor_is_forgotten() {
        let mut reactor = loopback_reactor();
        let _client = StdTcpStream::connect(reactor.local_addr().unwrap()).unwrap();
        let descriptor = accept_one(&mut reactor);

        reactor.close(descriptor);

        assert_eq!(reactor.stream_count(), 0);
        let err = reactor.write(descriptor, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn waker_interrupts_blocking_wait() {
        let mut reactor = loopback_reactor();
        let waker = reactor.waker();
        let listener = reactor.listener();

        std::thread::spawn(move || waker.wake().unwrap());

        let readiness = reactor.wait(&interest(&[listener]), &DescriptorSet::new(), listener).unwrap();
        assert!(readiness.is_empty());
    }
}
