//! A dedicated IPv6 subnet module.
//!
//! The standard library only exposes [`Ipv6Addr`] and related address
//! types. It does not, however, expose a dedicated type to represent a
//! prefix with an arbitrary bit length, which is the shape every prefix in
//! the partition network data comes in.
//!
//! This code is not meant to fully support subnets, but rather only the
//! subset as needed by the network data parser and the DHCPv6 client. As
//! such, this implementation is optimized for the specific use case, and
//! might not be optimal for other uses.

use core::fmt;
use std::{hash::Hash, net::Ipv6Addr};

use ipnet::Ipv6Net;

/// Representation of an IPv6 subnet.
#[derive(Debug, Clone, Copy, Eq, PartialOrd, Ord)]
pub struct Subnet {
    inner: Ipv6Net,
}

/// An error returned when creating a new [`Subnet`] with an invalid prefix
/// length. The max prefix length is 128.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixLenError;

impl Subnet {
    /// Create a new `Subnet` from the given [`Ipv6Addr`] and prefix length.
    pub fn new(addr: Ipv6Addr, prefix_len: u8) -> Result<Subnet, PrefixLenError> {
        Ok(Self {
            inner: Ipv6Net::new(addr, prefix_len)
                .map_err(|_| PrefixLenError)?
                .trunc(),
        })
    }

    /// Create a new `Subnet` from the packed wire form used in network data
    /// TLVs: `prefix_len` bits taken from the head of `bytes`. Bits beyond
    /// the prefix length are zeroed.
    pub fn from_wire_bits(bytes: &[u8], prefix_len: u8) -> Result<Subnet, PrefixLenError> {
        let byte_len = prefix_len.div_ceil(8) as usize;
        if prefix_len > 128 || bytes.len() < byte_len {
            return Err(PrefixLenError);
        }
        let mut raw = [0; 16];
        raw[..byte_len].copy_from_slice(&bytes[..byte_len]);
        Subnet::new(Ipv6Addr::from(raw), prefix_len)
    }

    /// Returns the size of the prefix in bits.
    pub fn prefix_len(&self) -> u8 {
        self.inner.prefix_len()
    }

    /// Returns the number of bytes needed to carry the prefix on the wire.
    pub fn wire_len(&self) -> usize {
        self.prefix_len().div_ceil(8) as usize
    }

    /// Returns the network part of the `Subnet`. All non prefix bits are
    /// set to 0.
    pub fn network(&self) -> Ipv6Addr {
        self.inner.network()
    }

    /// Checks if this `Subnet` contains the provided [`Ipv6Addr`].
    pub fn contains_ip(&self, ip: Ipv6Addr) -> bool {
        self.inner.contains(&ip)
    }

    /// Checks if this `Subnet` contains the provided `Subnet`, i.e. all
    /// addresses of the provided `Subnet` are also part of this `Subnet`.
    pub fn contains_subnet(&self, other: &Self) -> bool {
        self.inner.contains(&other.inner)
    }

    /// Whether the subnet lies in the link-local unicast range (fe80::/10).
    pub fn is_link_local(&self) -> bool {
        let octets = self.network().octets();
        octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80
    }

    /// Whether the subnet lies in the multicast range (ff00::/8).
    pub fn is_multicast(&self) -> bool {
        self.network().octets()[0] == 0xff
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl PartialEq for Subnet {
    fn eq(&self, other: &Self) -> bool {
        // Quick check, subnets of different sizes are never equal.
        if self.prefix_len() != other.prefix_len() {
            return false;
        }

        // Full check
        self.network() == other.network()
    }
}

impl Hash for Subnet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // First write the subnet size
        state.write_u8(self.prefix_len());
        // Then write the IP of the network. This sets the non prefix bits
        // to 0, so hash values will be equal according to the PartialEq
        // rules.
        self.network().hash(state)
    }
}

impl fmt::Display for PrefixLenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Invalid prefix length for this address")
    }
}

impl std::error::Error for PrefixLenError {}
