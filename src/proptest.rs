//! `proptest` strategies for generating the crate's core value types, used by the
//! property-based tests enumerated in the design's "testable properties" section
//! ([`crate::subnet`], [`crate::subnet_index`], [`crate::conn_limiter`]).
//!
//! Internal-only (`#[cfg(test)]`), matching the teacher crate's own `proptest` module -- except
//! ours has no reason to be a public, feature-gated surface, since nothing outside this crate's
//! own test suite needs to generate these values.

use std::net::Ipv4Addr;

use proptest::prelude::*;

use crate::subnet::Subnet;

/// An IPv4 `Subnet` with a masked, valid prefix length.
pub fn ipv4_subnet() -> impl Strategy<Value = Subnet> {
    (any::<u32>(), 0u8..=32).prop_map(|(addr, prefix_len)| {
        #[allow(clippy::unwrap_used)]
        Subnet::new(Ipv4Addr::from(addr).into(), prefix_len)
            .unwrap()
            .masked()
    })
}

/// A set of distinct masked `Subnet`s, suitable for populating a `SubnetIndex`.
pub fn distinct_ipv4_subnets(max: usize) -> impl Strategy<Value = Vec<Subnet>> {
    proptest::collection::vec(ipv4_subnet(), 0..max).prop_map(|subnets| {
        let mut seen = std::collections::HashSet::new();
        subnets.into_iter().filter(|s| seen.insert(*s)).collect()
    })
}

/// An arbitrary IPv4 address, for querying a populated `SubnetIndex`.
pub fn ipv4_addr() -> impl Strategy<Value = std::net::IpAddr> {
    any::<u32>().prop_map(|bits| Ipv4Addr::from(bits).into())
}
