//! Duplicate suppression for inbound packets using two-set rotation.
//!
//! The same envelope can arrive several times: once per socket when several interfaces are
//!  joined to the multicast group, and again for every resend of a reliable packet whose
//!  acknowledgement was lost. Ids are kept in a current and a previous set; when the current
//!  set exceeds the rotation threshold, it becomes the previous set and a new empty set is
//!  started, bounding memory to twice the threshold.

use rustc_hash::FxHashSet;
use uuid::Uuid;

pub struct PacketIdFilter {
    current: FxHashSet<Uuid>,
    prev: FxHashSet<Uuid>,
    rotation_threshold: usize,
}

impl PacketIdFilter {
    pub fn new(rotation_threshold: usize) -> PacketIdFilter {
        PacketIdFilter {
            current: FxHashSet::default(),
            prev: FxHashSet::default(),
            rotation_threshold,
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.current.contains(id) || self.prev.contains(id)
    }

    /// Remembers a packet id, returning `true` if it was not seen before
    pub fn insert(&mut self, id: Uuid) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.current.insert(id);

        if self.current.len() > self.rotation_threshold {
            self.prev = std::mem::take(&mut self.current);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.prev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.prev.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_rejected() {
        let mut filter = PacketIdFilter::new(10);
        let id = Uuid::new_v4();

        assert!(filter.insert(id));
        assert!(!filter.insert(id));
        assert!(filter.insert(Uuid::new_v4()));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let mut filter = PacketIdFilter::new(2);
        let ids = (0..3).map(|_| Uuid::new_v4()).collect::<Vec<_>>();

        for id in &ids {
            assert!(filter.insert(*id));
        }
        // the third insert rotated all three ids into the previous generation
        assert!(filter.current.is_empty());
        for id in &ids {
            assert!(filter.contains(id));
        }

        let more = (0..3).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
        for id in &more {
            assert!(filter.insert(*id));
        }
        // second rotation drops the first generation
        for id in &ids {
            assert!(!filter.contains(id));
        }
        for id in &more {
            assert!(filter.contains(id));
        }
    }

    #[test]
    fn test_empty() {
        let filter = PacketIdFilter::new(2);
        assert!(filter.is_empty());
        assert!(!filter.contains(&Uuid::new_v4()));
    }
}
