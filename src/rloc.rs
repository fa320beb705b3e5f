//! Routing locators and mesh-local address derivation.
//!
//! Every node in a partition is addressable through a 16 bit routing
//! locator. The upper 7 bits name the parent router, the low 9 bits the
//! child id on that router (zero for the router itself). Well known
//! locator based addresses share the interface identifier
//! `0000:00ff:fe00:xxxx` under the partition's mesh-local prefix.

use core::fmt;
use std::net::Ipv6Addr;

/// Mask selecting the child id bits of a routing locator.
const CHILD_ID_MASK: u16 = 0x01ff;

/// First anycast locator assigned to DNS/SRP anycast services.
const DNS_SRP_ANYCAST_ALOC_BASE: u16 = 0xfc10;

/// A 16 bit routing locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rloc16(u16);

impl Rloc16 {
    /// Create a new `Rloc16` from its raw value.
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// The raw 16 bit value.
    pub fn value(self) -> u16 {
        self.0
    }

    /// Whether this locator names a child endpoint (nonzero child id bits).
    pub fn is_child(self) -> bool {
        self.0 & CHILD_ID_MASK != 0
    }

    /// Whether this locator names a router.
    pub fn is_router(self) -> bool {
        !self.is_child()
    }
}

impl From<u16> for Rloc16 {
    fn from(value: u16) -> Self {
        Rloc16(value)
    }
}

impl From<Rloc16> for u16 {
    fn from(value: Rloc16) -> Self {
        value.0
    }
}

impl fmt::Display for Rloc16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The 64 bit mesh-local prefix of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshLocalPrefix([u8; 8]);

impl MeshLocalPrefix {
    /// Create a new `MeshLocalPrefix` from its raw bytes.
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// The raw prefix bytes.
    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Mesh-local address with the well known locator interface identifier
    /// for the given locator value.
    pub fn locator_address(&self, locator: u16) -> Ipv6Addr {
        let mut raw = [0; 16];
        raw[..8].copy_from_slice(&self.0);
        raw[11] = 0xff;
        raw[12] = 0xfe;
        raw[14..].copy_from_slice(&locator.to_be_bytes());
        Ipv6Addr::from(raw)
    }

    /// The mesh-local routing locator address of a node.
    pub fn rloc_address(&self, rloc16: Rloc16) -> Ipv6Addr {
        self.locator_address(rloc16.value())
    }

    /// The anycast address of the DNS/SRP service with the given service
    /// number.
    pub fn dns_srp_anycast_address(&self, service_number: u8) -> Ipv6Addr {
        self.locator_address(DNS_SRP_ANYCAST_ALOC_BASE + u16::from(service_number))
    }
}

impl fmt::Display for MeshLocalPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/64", self.locator_address(0))
    }
}
