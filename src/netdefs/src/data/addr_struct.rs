//! The generic network address and its total ordering.  Every tree and list
//! in the engine keys on this ordering, so it must behave as a strict total
//! order and must never degenerate into identity comparison.

use std::cmp::Ordering;
use std::fmt;

/// Size in bytes of the address payload.  Large enough for any supported
/// domain (IPv6 needs all sixteen; IPv4 and physical addresses use a
/// prefix and leave the rest zero).
pub const MAX_NETWORK_ADDRESS_SIZE: usize = 16;

/// The address family or link domain an address belongs to.  Physical
/// domains (used for device hardware addresses) sort below the network
/// domains; the discriminant order is part of the address total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetDomain {
    /// No domain assigned.
    Invalid,
    /// Loopback-only communication.
    Local,
    /// An 802.11 wireless device address.
    Physical80211,
    /// An Ethernet device address.
    Ethernet,
    /// An IPv4 address.
    Ip4,
    /// An IPv6 address.
    Ip6,
    /// An address resolution protocol address.
    Arp,
    /// A netlink-style control channel address.
    Netlink,
}

impl NetDomain {
    /// Returns true for the device hardware address domains.
    pub fn is_physical(self) -> bool {
        matches!(self, NetDomain::Physical80211 | NetDomain::Ethernet)
    }
}

/// A network address: domain tag, fixed address payload, and port.  A plain
/// value type; copies are cheap and the engine copies freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    /// The domain the address belongs to.
    pub domain: NetDomain,
    /// The port, or zero where ports do not apply (physical addresses,
    /// translation cache keys, raw sockets).
    pub port: u32,
    /// The address payload.  Domains using fewer bytes leave the tail zero.
    pub address: [u8; MAX_NETWORK_ADDRESS_SIZE],
}

impl NetworkAddress {
    /// The wildcard ("any") address for a domain: zero payload, zero port.
    pub const fn any(domain: NetDomain) -> Self {
        NetworkAddress {
            domain,
            port: 0,
            address: [0; MAX_NETWORK_ADDRESS_SIZE],
        }
    }

    /// Builds an IPv4 address from its four octets and a port.
    pub fn ip4(octets: [u8; 4], port: u32) -> Self {
        let mut address = [0; MAX_NETWORK_ADDRESS_SIZE];
        address[..4].copy_from_slice(&octets);
        NetworkAddress {
            domain: NetDomain::Ip4,
            port,
            address,
        }
    }

    /// Builds an Ethernet hardware address.
    pub fn ethernet(octets: [u8; 6]) -> Self {
        let mut address = [0; MAX_NETWORK_ADDRESS_SIZE];
        address[..6].copy_from_slice(&octets);
        NetworkAddress {
            domain: NetDomain::Ethernet,
            port: 0,
            address,
        }
    }

    /// True if every payload byte is zero, regardless of port.  This is the
    /// "wildcard supplied" test used by the availability checks.
    pub fn is_unspecified(&self) -> bool {
        self.address_words().iter().all(|word| *word == 0)
    }

    /// True if the payloads match, ignoring port and domain.
    pub fn same_payload(&self, other: &NetworkAddress) -> bool {
        self.address == other.address
    }

    /// True if port and domain match, ignoring the payload.  Wildcard
    /// searches through the link address list use this form.
    pub fn same_port_and_domain(&self, other: &NetworkAddress) -> bool {
        self.port == other.port && self.domain == other.domain
    }

    /// The total order: port first, then domain, then the payload compared a
    /// word at a time.  Everything keyed on addresses relies on this exact
    /// tie-break sequence.
    pub fn compare(&self, other: &NetworkAddress) -> Ordering {
        self.port
            .cmp(&other.port)
            .then(self.domain.cmp(&other.domain))
            .then_with(|| self.address_words().cmp(&other.address_words()))
    }

    fn address_words(&self) -> [u64; MAX_NETWORK_ADDRESS_SIZE / 8] {
        let mut words = [0u64; MAX_NETWORK_ADDRESS_SIZE / 8];
        for (index, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&self.address[index * 8..index * 8 + 8]);
            *word = u64::from_be_bytes(chunk);
        }
        words
    }
}

impl PartialOrd for NetworkAddress {
    fn partial_cmp(&self, other: &NetworkAddress) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for NetworkAddress {
    fn cmp(&self, other: &NetworkAddress) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain {
            NetDomain::Ip4 => write!(
                f,
                "{}.{}.{}.{}:{}",
                self.address[0], self.address[1], self.address[2], self.address[3], self.port
            ),
            NetDomain::Ethernet | NetDomain::Physical80211 => {
                for (index, byte) in self.address[..6].iter().enumerate() {
                    if index != 0 {
                        write!(f, ":")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            _ => {
                write!(f, "{:?}/", self.domain)?;
                for byte in &self.address {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, ":{}", self.port)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_port_first() {
        let low_port = NetworkAddress::ip4([200, 0, 0, 1], 10);
        let high_port = NetworkAddress::ip4([1, 0, 0, 1], 11);
        assert_eq!(low_port.compare(&high_port), Ordering::Less);
    }

    #[test]
    fn ordering_breaks_port_ties_on_domain() {
        let ip4 = NetworkAddress::ip4([10, 0, 0, 1], 80);
        let mut ip6 = ip4;
        ip6.domain = NetDomain::Ip6;
        assert_eq!(ip4.compare(&ip6), Ordering::Less);
        assert_eq!(ip6.compare(&ip4), Ordering::Greater);
    }

    #[test]
    fn ordering_breaks_domain_ties_on_payload() {
        let small = NetworkAddress::ip4([10, 0, 0, 1], 80);
        let large = NetworkAddress::ip4([10, 0, 0, 2], 80);
        assert_eq!(small.compare(&large), Ordering::Less);
        assert_eq!(small.compare(&small), Ordering::Equal);
    }

    #[test]
    fn ordering_is_a_strict_total_order() {
        let samples = [
            NetworkAddress::any(NetDomain::Ip4),
            NetworkAddress::ip4([10, 0, 0, 1], 0),
            NetworkAddress::ip4([10, 0, 0, 1], 80),
            NetworkAddress::ip4([10, 0, 0, 2], 80),
            NetworkAddress::ip4([255, 255, 255, 255], 80),
            NetworkAddress::ethernet([2, 0, 0, 0, 0, 1]),
        ];
        for a in &samples {
            for b in &samples {
                let forward = a.compare(b);
                let backward = b.compare(a);
                assert_eq!(forward, backward.reverse());
                assert_eq!(forward == Ordering::Equal, a == b);
                for c in &samples {
                    if forward == Ordering::Less && b.compare(c) == Ordering::Less {
                        assert_eq!(a.compare(c), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn unspecified_ignores_port() {
        let mut any = NetworkAddress::any(NetDomain::Ip4);
        any.port = 8080;
        assert!(any.is_unspecified());
        assert!(!NetworkAddress::ip4([0, 0, 0, 1], 0).is_unspecified());
    }

    #[test]
    fn display_formats_ip4_and_ethernet() {
        let ip = NetworkAddress::ip4([192, 168, 1, 5], 8080);
        assert_eq!(format!("{}", ip), "192.168.1.5:8080");
        let mac = NetworkAddress::ethernet([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(format!("{}", mac), "de:ad:be:ef:00:01");
    }
}
