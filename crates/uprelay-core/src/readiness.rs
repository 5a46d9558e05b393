//! Readiness multiplexer interface.
//!
//! The relay loop never talks to the OS directly. It hands its interest sets
//! to a [`Reactor`] and gets back a [`Readiness`] report, then performs
//! accept/read/write/close through the same reactor. The production server
//! implements this over mio; tests use [`crate::sim::SimReactor`].

use std::io;

use crate::{
    descriptor::{Descriptor, DescriptorSet},
    drain::Wire,
};

/// Descriptors reported ready by one readiness query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Descriptors ready for reading (or accepting, for the listener)
    pub readable: DescriptorSet,
    /// Descriptors ready for writing
    pub writable: DescriptorSet,
}

impl Readiness {
    /// Nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }

    /// Every ready descriptor up to `bound` (inclusive), ascending, each once.
    pub fn ready_up_to(&self, bound: Descriptor) -> Vec<Descriptor> {
        let mut ready: DescriptorSet = self.readable.iter_up_to(bound).collect();
        ready.extend(self.writable.iter_up_to(bound));
        ready.iter().collect()
    }
}

/// OS-facing side of the relay: one listening socket plus its accepted
/// connections, all non-blocking.
pub trait Reactor: Wire {
    /// Descriptor of the listening socket.
    fn listener(&self) -> Descriptor;

    /// Block until at least one descriptor in `read` or `write` is ready.
    ///
    /// `bound` is the highest descriptor the caller is interested in. An
    /// [`io::ErrorKind::Interrupted`] error means "try again", any other error
    /// is fatal to the loop.
    fn wait(
        &mut self,
        read: &DescriptorSet,
        write: &DescriptorSet,
        bound: Descriptor,
    ) -> io::Result<Readiness>;

    /// Accept one pending connection. `Ok(None)` if nothing is pending.
    fn accept(&mut self) -> io::Result<Option<Descriptor>>;

    /// Read one chunk. `Ok(0)` is an orderly close by the peer.
    fn read(&mut self, descriptor: Descriptor, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the OS resources behind an accepted descriptor.
    fn close(&mut self, descriptor: Descriptor);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(raws: &[i32]) -> DescriptorSet {
        raws.iter().copied().map(Descriptor::new).collect()
    }

    #[test]
    fn ready_up_to_merges_and_bounds() {
        let readiness = Readiness { readable: set(&[3, 6, 9]), writable: set(&[5, 6, 12]) };

        let ready: Vec<_> =
            readiness.ready_up_to(Descriptor::new(9)).into_iter().map(Descriptor::raw).collect();
        assert_eq!(ready, vec![3, 5, 6, 9]);
    }

    #[test]
    fn empty_readiness() {
        assert!(Readiness::default().is_empty());
        assert!(!Readiness { readable: set(&[3]), writable: set(&[]) }.is_empty());
    }
}
