use crate::address::{AddressSet, EndpointEntry, TcpAddress};
use ahash::AHashSet as HashSet;

/// The result of comparing two [`AddressSet`]s: addresses present only in
/// the new set, and addresses present only in the old set. Compared by the
/// full address tuple (ip + port), per spec.md §4.2.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddressDiff {
    pub added: Vec<EndpointEntry>,
    pub removed: Vec<TcpAddress>,
}

impl AddressDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes `(added, removed)` between `old` and `new`: `added = new \ old`,
/// `removed = old \ new`.
pub fn diff(old: &AddressSet, new: &AddressSet) -> AddressDiff {
    let old_keys: HashSet<TcpAddress> = old.iter().map(|(a, _)| *a).collect();
    let new_keys: HashSet<TcpAddress> = new.iter().map(|(a, _)| *a).collect();

    let added = new
        .iter()
        .filter(|(a, _)| !old_keys.contains(a))
        .map(|(a, m)| EndpointEntry {
            addr: *a,
            meta: m.cloned(),
        })
        .collect();

    let removed = old
        .iter()
        .filter(|(a, _)| !new_keys.contains(a))
        .map(|(a, _)| *a)
        .collect();

    AddressDiff { added, removed }
}

/// Applies a diff produced by [`diff`] to a known address set, returning the
/// resulting set. Used by tests to verify the round-trip diff property.
pub fn apply(base: &AddressSet, delta: &AddressDiff) -> AddressSet {
    let mut out = base.clone();
    for removed in &delta.removed {
        out = out
            .iter()
            .filter(|(a, _)| *a != removed)
            .map(|(a, m)| (*a, m.cloned()))
            .collect();
    }
    for added in &delta.added {
        out.insert(added.addr, added.meta.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(a: u8, port: u16) -> TcpAddress {
        TcpAddress::new(Ipv4Addr::new(172, 17, 0, a), port)
    }

    fn set(addrs: &[TcpAddress]) -> AddressSet {
        addrs.iter().map(|a| (*a, None)).collect()
    }

    #[test]
    fn diff_detects_additions_and_removals() {
        let old = set(&[addr(1, 80), addr(2, 80)]);
        let new = set(&[addr(2, 80), addr(3, 80)]);
        let d = diff(&old, &new);
        assert_eq!(d.removed, vec![addr(1, 80)]);
        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].addr, addr(3, 80));
    }

    #[test]
    fn equal_sets_produce_no_diff() {
        let s = set(&[addr(1, 80)]);
        assert!(diff(&s, &s.clone()).is_empty());
    }

    #[test]
    fn round_trip_diff_reconstructs_sequence() {
        let s0 = set(&[addr(1, 80), addr(2, 80)]);
        let s1 = set(&[addr(2, 80), addr(3, 80)]);
        let s2 = s1.clone(); // equal update: no-op step
        let s3 = set(&[addr(3, 80)]);

        let mut acc = s0.clone();
        for next in [&s1, &s2, &s3] {
            let d = diff(&acc, next);
            if next == &acc {
                assert!(d.is_empty());
            }
            acc = apply(&acc, &d);
            assert_eq!(&acc, next);
        }
    }
}
