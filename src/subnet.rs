use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ip_network::IpNetwork;

use crate::error::{Error, Result};

/// A CIDR prefix.
///
/// Invariant upheld by every [`Subnet`] that escapes [`Subnet::new`]: host bits are zero, i.e.
/// `subnet == subnet.masked()`. Callers that might hand us an unmasked prefix (e.g. a CIDR
/// literal typed by a human) must go through [`Subnet::new`] and then compare against
/// [`Subnet::masked`] themselves if they need to reject the unmasked form with [`Error::BadSubnet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet(IpNetwork);

impl Subnet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let network = match addr {
            IpAddr::V4(addr) => ip_network::Ipv4Network::new(addr, prefix_len)
                .map(IpNetwork::V4)
                .map_err(|_| Error::SocketSetupFailed {
                    option: "subnet prefix length",
                    source: std::io::Error::other("prefix length out of range"),
                })?,
            IpAddr::V6(addr) => ip_network::Ipv6Network::new(addr, prefix_len)
                .map(IpNetwork::V6)
                .map_err(|_| Error::SocketSetupFailed {
                    option: "subnet prefix length",
                    source: std::io::Error::other("prefix length out of range"),
                })?,
        };

        Ok(Self(network))
    }

    /// Returns the masked form of this subnet (host bits cleared).
    pub fn masked(&self) -> Self {
        let masked = match self.0 {
            IpNetwork::V4(net) => {
                // `network_address` already clears host bits; round-trip through `new` to get
                // an `IpNetwork` whose stored address matches it exactly.
                IpNetwork::V4(
                    ip_network::Ipv4Network::new(net.network_address(), net.netmask())
                        .expect("prefix length unchanged"),
                )
            }
            IpNetwork::V6(net) => IpNetwork::V6(
                ip_network::Ipv6Network::new(net.network_address(), net.netmask())
                    .expect("prefix length unchanged"),
            ),
        };

        Self(masked)
    }

    pub fn is_masked(&self) -> bool {
        *self == self.masked()
    }

    pub fn network_address(&self) -> IpAddr {
        match self.0 {
            IpNetwork::V4(net) => IpAddr::V4(net.network_address()),
            IpNetwork::V6(net) => IpAddr::V6(net.network_address()),
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self.0 {
            IpNetwork::V4(net) => net.netmask(),
            IpNetwork::V6(net) => net.netmask(),
        }
    }

    fn max_prefix_len(&self) -> u8 {
        match self.0 {
            IpNetwork::V4(_) => 32,
            IpNetwork::V6(_) => 128,
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.0, addr) {
            (IpNetwork::V4(net), IpAddr::V4(addr)) => net.contains(addr),
            (IpNetwork::V6(net), IpAddr::V6(addr)) => net.contains(addr),
            _ => false,
        }
    }

    /// `true` iff `other` is contained in `self` and `self`'s prefix is at least as short, i.e.
    /// every address matched by `other` is also matched by `self`.
    pub fn contains_or_equals(&self, other: &Subnet) -> bool {
        self.prefix_len() <= other.prefix_len() && self.contains(other.network_address())
    }
}

/// Narrower prefixes (larger `prefix_len`) sort first; ties broken by network address.
impl Ord for Subnet {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .prefix_len()
            .cmp(&self.prefix_len())
            .then_with(|| self.network_address().cmp(&other.network_address()))
    }
}

impl PartialOrd for Subnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address(), self.prefix_len())
    }
}

/// The "local address" of a virtual endpoint: a subnet, paired with the port the owning
/// interface listener is bound to.
///
/// String form is `<network-address>:<port>/<prefix-length>`, or `<addr>:<port>` when the
/// prefix covers the full address length (i.e. a single host).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrefixAddr {
    subnet: Subnet,
    port: u16,
}

impl PrefixAddr {
    pub fn new(subnet: Subnet, port: u16) -> Self {
        Self { subnet, port }
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn as_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.subnet.network_address(), self.port)
    }

    fn is_full_length(&self) -> bool {
        self.subnet.prefix_len() == self.subnet.max_prefix_len()
    }
}

impl fmt::Display for PrefixAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full_length() {
            write!(f, "{}:{}", self.subnet.network_address(), self.port)
        } else {
            write!(
                f,
                "{}:{}/{}",
                self.subnet.network_address(),
                self.port,
                self.subnet.prefix_len()
            )
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
    fn narrower_prefix_sorts_first() {
        let mut subnets = vec![
            subnet("1.0.0.0/16"),
            subnet("1.0.0.0/24"),
            subnet("1.2.0.0/16"),
            subnet("1.2.3.0/24"),
        ];
        subnets.sort();

        assert_eq!(
            subnets,
            vec![
                subnet("1.0.0.0/24"),
                subnet("1.2.3.0/24"),
                subnet("1.0.0.0/16"),
                subnet("1.2.0.0/16"),
            ]
        );
    }

    #[test]
    fn equal_prefix_len_breaks_tie_by_address() {
        let mut subnets = vec![subnet("10.0.1.0/24"), subnet("10.0.0.0/24")];
        subnets.sort();

        assert_eq!(subnets, vec![subnet("10.0.0.0/24"), subnet("10.0.1.0/24")]);
    }

    #[test]
    fn unmasked_subnet_differs_from_masked_form() {
        let unmasked = Subnet::new(Ipv4Addr::new(1, 2, 3, 4).into(), 24).unwrap();

        assert!(!unmasked.is_masked());
        assert_eq!(unmasked.masked().to_string(), "1.2.3.0/24");
    }

    #[test]
    fn full_length_prefix_addr_omits_suffix() {
        let addr = PrefixAddr::new(subnet("1.2.3.4/32"), 53);
        assert_eq!(addr.to_string(), "1.2.3.4:53");

        let addr = PrefixAddr::new(subnet("1.2.3.0/24"), 53);
        assert_eq!(addr.to_string(), "1.2.3.0:53/24");
    }
}
