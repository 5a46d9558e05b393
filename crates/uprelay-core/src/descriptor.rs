//! Descriptor handles and ordered descriptor sets.
//!
//! A [`Descriptor`] is the OS handle of one socket, listening or connected. It
//! doubles as the primary key of a connection in the pool. [`DescriptorSet`]
//! keeps descriptors in ascending order so that dispatch walks ready sockets
//! the same way a `select(2)` scan would.

use std::{collections::BTreeSet, fmt};

/// OS handle identifying one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(i32);

impl Descriptor {
    /// Wrap a raw OS descriptor.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw OS descriptor value.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl From<i32> for Descriptor {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sd {}", self.0)
    }
}

/// Ordered set of descriptors.
///
/// Used both for interest (what the loop wants to hear about) and for
/// readiness (what the multiplexer reported).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    descriptors: BTreeSet<Descriptor>,
}

impl DescriptorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Returns `false` if it was already present.
    pub fn insert(&mut self, descriptor: Descriptor) -> bool {
        self.descriptors.insert(descriptor)
    }

    /// Remove a descriptor. Returns `false` if it was not present.
    pub fn remove(&mut self, descriptor: Descriptor) -> bool {
        self.descriptors.remove(&descriptor)
    }

    /// Descriptor is in the set.
    pub fn contains(&self, descriptor: Descriptor) -> bool {
        self.descriptors.contains(&descriptor)
    }

    /// Number of descriptors in the set.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Set holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Highest descriptor in the set.
    pub fn max(&self) -> Option<Descriptor> {
        self.descriptors.last().copied()
    }

    /// Remove every descriptor.
    pub fn clear(&mut self) {
        self.descriptors.clear();
    }

    /// Descriptors in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.descriptors.iter().copied()
    }

    /// Descriptors in ascending order, stopping at `bound` (inclusive).
    pub fn iter_up_to(&self, bound: Descriptor) -> impl Iterator<Item = Descriptor> + '_ {
        self.descriptors.range(..=bound).copied()
    }
}

impl FromIterator<Descriptor> for DescriptorSet {
    fn from_iter<T: IntoIterator<Item = Descriptor>>(iter: T) -> Self {
        Self { descriptors: iter.into_iter().collect() }
    }
}

impl Extend<Descriptor> for DescriptorSet {
    fn extend<T: IntoIterator<Item = Descriptor>>(&mut self, iter: T) {
        self.descriptors.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_ascending_order() {
        let set: DescriptorSet = [7, 3, 5].into_iter().map(Descriptor::new).collect();

        let order: Vec<_> = set.iter().map(Descriptor::raw).collect();
        assert_eq!(order, vec![3, 5, 7]);
        assert_eq!(set.max(), Some(Descriptor::new(7)));
    }

    #[test]
    fn iter_up_to_is_inclusive() {
        let set: DescriptorSet = [3, 4, 9].into_iter().map(Descriptor::new).collect();

        let bounded: Vec<_> = set.iter_up_to(Descriptor::new(4)).map(Descriptor::raw).collect();
        assert_eq!(bounded, vec![3, 4]);
    }

    #[test]
    fn insert_and_remove_report_membership_changes() {
        let mut set = DescriptorSet::new();

        assert!(set.insert(Descriptor::new(4)));
        assert!(!set.insert(Descriptor::new(4)));
        assert!(set.remove(Descriptor::new(4)));
        assert!(!set.remove(Descriptor::new(4)));
        assert!(set.is_empty());
    }

    #[test]
    fn display_matches_log_format() {
        assert_eq!(Descriptor::new(12).to_string(), "sd 12");
    }
}
