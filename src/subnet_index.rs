use crate::error::{Error, Result};
use crate::subnet::Subnet;

/// An ordered collection mapping subnets to a value, supporting longest-prefix-match lookup.
///
/// Entries are kept sorted by [`Subnet`]'s `Ord` impl (narrowest prefix first, ties broken by
/// network address), so [`SubnetIndex::lookup`] is a first-match linear scan: the first entry
/// whose subnet contains the queried address is the longest (most specific) match.
///
/// A plain `Vec` is adequate here: interface listeners register a handful of subnets at startup,
/// not per-packet, so insertion cost is irrelevant and lookup is the hot path.
#[derive(Debug)]
pub struct SubnetIndex<T> {
    entries: Vec<(Subnet, T)>,
}

impl<T> Default for SubnetIndex<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> SubnetIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `subnet -> value`, rejecting both exact duplicates and subnets that are already
    /// masked-equal to an existing entry.
    pub fn insert(&mut self, subnet: Subnet, value: T) -> Result<()> {
        if self.entries.iter().any(|(s, _)| *s == subnet) {
            return Err(Error::already_registered(format!("subnet {subnet}")));
        }

        let pos = self
            .entries
            .partition_point(|(existing, _)| *existing <= subnet);
        self.entries.insert(pos, (subnet, value));

        Ok(())
    }

    /// Returns the value registered for the most specific subnet containing `addr`, if any.
    pub fn lookup(&self, addr: std::net::IpAddr) -> Option<&T> {
        self.entries
            .iter()
            .find(|(subnet, _)| subnet.contains(addr))
            .map(|(_, value)| value)
    }

    pub fn lookup_mut(&mut self, addr: std::net::IpAddr) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|(subnet, _)| subnet.contains(addr))
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Subnet, &T)> {
        self.entries.iter().map(|(s, v)| (s, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::proptest::{distinct_ipv4_subnets, ipv4_addr};
    use proptest::prelude::*;

    proptest! {
        /// Invariant 1: after any sequence of inserts, entries stay sorted narrowest-first with
        /// unique subnets.
        #[test]
        fn stays_sorted_and_unique(subnets in distinct_ipv4_subnets(20)) {
            let mut index = SubnetIndex::new();
            for subnet in &subnets {
                index.insert(*subnet, ()).unwrap();
            }

            let stored: Vec<Subnet> = index.iter().map(|(s, _)| *s).collect();
            let mut sorted = stored.clone();
            sorted.sort();
            prop_assert_eq!(stored, sorted);

            let unique: std::collections::HashSet<_> = index.iter().map(|(s, _)| *s).collect();
            prop_assert_eq!(unique.len(), index.len());
        }

        /// Invariant 2: lookup returns the entry whose subnet has the largest prefix length
        /// among those containing the address.
        #[test]
        fn lookup_matches_longest_prefix(subnets in distinct_ipv4_subnets(20), addr in ipv4_addr()) {
            let mut index = SubnetIndex::new();
            for subnet in &subnets {
                index.insert(*subnet, *subnet).unwrap();
            }

            let expected = subnets
                .iter()
                .filter(|s| s.contains(addr))
                .max_by_key(|s| s.prefix_len());

            prop_assert_eq!(index.lookup(addr), expected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn subnet(s: &str) -> Subnet {
        let (addr, len) = s.split_once('/').unwrap();
        Subnet::new(addr.parse().unwrap(), len.parse().unwrap()).unwrap()
    }

    #[test]
    fn lookup_prefers_most_specific_match() {
        let mut index = SubnetIndex::new();
        index.insert(subnet("1.0.0.0/16"), "wide").unwrap();
        index.insert(subnet("1.0.0.0/24"), "narrow").unwrap();
        index.insert(subnet("1.2.0.0/16"), "other-wide").unwrap();

        assert_eq!(
            index.lookup(Ipv4Addr::new(1, 0, 0, 5).into()),
            Some(&"narrow")
        );
        assert_eq!(
            index.lookup(Ipv4Addr::new(1, 0, 1, 5).into()),
            Some(&"wide")
        );
        assert_eq!(
            index.lookup(Ipv4Addr::new(1, 2, 3, 4).into()),
            Some(&"other-wide")
        );
        assert_eq!(index.lookup(Ipv4Addr::new(2, 0, 0, 1).into()), None);
    }

    #[test]
    fn duplicate_subnet_is_rejected() {
        let mut index = SubnetIndex::new();
        index.insert(subnet("10.0.0.0/24"), 1).unwrap();

        assert!(matches!(
            index.insert(subnet("10.0.0.0/24"), 2),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn iteration_order_matches_subnet_ord() {
        let mut index = SubnetIndex::new();
        index.insert(subnet("1.2.0.0/16"), ()).unwrap();
        index.insert(subnet("1.0.0.0/24"), ()).unwrap();
        index.insert(subnet("1.0.0.0/16"), ()).unwrap();

        let order: Vec<_> = index.iter().map(|(s, _)| s.to_string()).collect();
        assert_eq!(order, vec!["1.0.0.0/24", "1.0.0.0/16", "1.2.0.0/16"]);
    }
}
