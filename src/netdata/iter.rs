//! Resumable iteration over the typed records of a network data buffer.
//!
//! Iteration positions are packed into an opaque 32 bit cookie so callers
//! can store them, hand them across an FFI boundary, or resume a walk on a
//! later event loop turn. Malformed TLVs are skipped without ever yielding
//! a partial record, and every call advances the position, so iteration
//! always terminates.

use crate::netdata::tlv::{
    BorderRouterEntry, ContextTlv, HasRouteEntry, Preference, PrefixTlv, ServerTlv, ServiceTlv,
    TlvReader, TlvType, TlvView, BORDER_ROUTER_ENTRY_SIZE, HAS_ROUTE_ENTRY_SIZE,
};
use crate::rloc::Rloc16;
use crate::subnet::Subnet;
use crate::Error;

/// Opaque, resumable position in a network data buffer.
///
/// The value packs the offset of the top level TLV being walked, the offset
/// of the sub TLV within that TLV's value, and the index of the next entry
/// inside the sub TLV. A value of zero is the start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkDataIterator(u32);

impl NetworkDataIterator {
    /// The start position.
    pub const INIT: Self = Self(0);

    /// Create a new iterator at the start position.
    pub fn new() -> Self {
        Self::INIT
    }

    fn tlv_offset(self) -> usize {
        (self.0 & 0xff) as usize
    }

    fn sub_offset(self) -> usize {
        ((self.0 >> 8) & 0xff) as usize
    }

    fn entry_index(self) -> usize {
        ((self.0 >> 16) & 0xff) as usize
    }

    fn save(&mut self, tlv_offset: usize, sub_offset: usize, entry_index: usize) {
        self.0 = (tlv_offset as u32 & 0xff)
            | ((sub_offset as u32 & 0xff) << 8)
            | ((entry_index as u32 & 0xff) << 16);
    }

    fn exhaust(&mut self, buffer_len: usize) {
        self.save(buffer_len.min(0xff), 0xff, 0xff);
    }
}

impl From<u32> for NetworkDataIterator {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<NetworkDataIterator> for u32 {
    fn from(value: NetworkDataIterator) -> Self {
        value.0
    }
}

/// An on-mesh prefix entry. One record per border router entry advertising
/// the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnMeshPrefixConfig {
    /// The advertised prefix.
    pub prefix: Subnet,
    /// Locator of the border router announcing the entry.
    pub rloc16: Rloc16,
    /// The advertised route preference.
    pub preference: Preference,
    /// Whether the prefix is preferred.
    pub preferred: bool,
    /// Whether the prefix can be used for stateless address configuration.
    pub slaac: bool,
    /// Whether the border router is a DHCPv6 agent for the prefix.
    pub dhcp: bool,
    /// Whether the DHCPv6 agent supplies other configuration data.
    pub configure: bool,
    /// Whether the border router is a default router for the prefix.
    pub default_route: bool,
    /// Whether the prefix is on-mesh.
    pub on_mesh: bool,
    /// Whether the border router supplies DNS information via neighbor
    /// discovery.
    pub nd_dns: bool,
    /// Whether the prefix is a domain prefix.
    pub domain_prefix: bool,
    /// Whether the entry is part of the stable network data.
    pub stable: bool,
}

/// An external route entry. One record per route entry advertising the
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalRouteConfig {
    /// The routed prefix.
    pub prefix: Subnet,
    /// Locator of the router announcing the route.
    pub rloc16: Rloc16,
    /// The advertised route preference.
    pub preference: Preference,
    /// Whether the route is a NAT64 prefix.
    pub nat64: bool,
    /// Whether the router advertises the prefix in a PIO.
    pub adv_pio: bool,
    /// Whether the entry is part of the stable network data.
    pub stable: bool,
}

/// A service record together with one of its servers. Iteration yields one
/// record per (service, server) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// The service id.
    pub service_id: u8,
    /// The IANA enterprise number the service data is scoped to.
    pub enterprise_number: u32,
    /// The service data bytes.
    pub service_data: Vec<u8>,
    /// Locator of the server.
    pub server_rloc16: Rloc16,
    /// The server data bytes.
    pub server_data: Vec<u8>,
    /// Whether the server entry is part of the stable network data.
    pub stable: bool,
}

/// A 6LoWPAN context attached to an on-mesh prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowpanContextInfo {
    /// The 6LoWPAN context id.
    pub context_id: u8,
    /// Whether the context may be used for compression.
    pub compress: bool,
    /// Whether the context is part of the stable network data.
    pub stable: bool,
    /// The prefix the context belongs to.
    pub prefix: Subnet,
}

/// The next on-mesh prefix entry after the iterator position.
pub(crate) fn next_on_mesh_prefix(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
) -> Result<OnMeshPrefixConfig, Error> {
    next_prefix_sub_entry(
        bytes,
        iterator,
        TlvType::BorderRouter,
        BORDER_ROUTER_ENTRY_SIZE,
        |prefix, sub_tlv, entry_bytes| {
            let subnet = prefix.subnet()?;
            let entry = BorderRouterEntry::parse(entry_bytes)?;
            Some(OnMeshPrefixConfig {
                prefix: subnet,
                rloc16: entry.rloc16,
                preference: entry.preference(),
                preferred: entry.is_preferred(),
                slaac: entry.is_slaac(),
                dhcp: entry.is_dhcp(),
                configure: entry.is_configure(),
                default_route: entry.is_default_route(),
                on_mesh: entry.is_on_mesh(),
                nd_dns: entry.is_nd_dns(),
                domain_prefix: entry.is_domain_prefix(),
                stable: sub_tlv.stable,
            })
        },
    )
}

/// The next external route entry after the iterator position.
pub(crate) fn next_external_route(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
) -> Result<ExternalRouteConfig, Error> {
    next_prefix_sub_entry(
        bytes,
        iterator,
        TlvType::HasRoute,
        HAS_ROUTE_ENTRY_SIZE,
        |prefix, sub_tlv, entry_bytes| {
            let subnet = prefix.subnet()?;
            let entry = HasRouteEntry::parse(entry_bytes)?;
            Some(ExternalRouteConfig {
                prefix: subnet,
                rloc16: entry.rloc16,
                preference: entry.preference(),
                nat64: entry.is_nat64(),
                adv_pio: entry.is_adv_pio(),
                stable: sub_tlv.stable,
            })
        },
    )
}

/// The next 6LoWPAN context after the iterator position.
pub(crate) fn next_lowpan_context(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
) -> Result<LowpanContextInfo, Error> {
    // A Context sub TLV holds a single record, modeled here as one entry
    // spanning the whole sub TLV value.
    next_prefix_sub_entry(
        bytes,
        iterator,
        TlvType::Context,
        usize::MAX,
        |prefix, sub_tlv, entry_bytes| {
            let subnet = prefix.subnet()?;
            let context = ContextTlv::parse(entry_bytes)?;
            Some(LowpanContextInfo {
                context_id: context.context_id,
                compress: context.compress,
                stable: sub_tlv.stable,
                prefix: subnet,
            })
        },
    )
}

/// The next (service, server) pair after the iterator position.
pub(crate) fn next_service(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
) -> Result<ServiceConfig, Error> {
    let mut resume_sub = iterator.sub_offset();
    let mut reader = TlvReader::from_offset(bytes, iterator.tlv_offset());

    while let Some((tlv_offset, tlv)) = reader.next_tlv() {
        if tlv_offset != iterator.tlv_offset() {
            resume_sub = 0;
        }
        if tlv.tlv_type != Some(TlvType::Service) {
            continue;
        }
        let Some(service) = ServiceTlv::parse(tlv.value) else {
            continue;
        };

        let start = resume_sub.max(service.sub_tlvs_offset());
        let mut sub_reader = TlvReader::from_offset(tlv.value, start);
        while let Some((sub_offset, sub_tlv)) = sub_reader.next_tlv() {
            if sub_tlv.tlv_type != Some(TlvType::Server) {
                continue;
            }
            let Some(server) = ServerTlv::parse(sub_tlv.value) else {
                continue;
            };
            // Save the position just past this server sub TLV.
            let next_sub = sub_offset + 2 + sub_tlv.value.len();
            iterator.save(tlv_offset, next_sub, 0);
            return Ok(ServiceConfig {
                service_id: service.service_id,
                enterprise_number: service.enterprise_number,
                service_data: service.service_data.to_vec(),
                server_rloc16: server.rloc16,
                server_data: server.server_data.to_vec(),
                stable: sub_tlv.stable,
            });
        }
    }

    iterator.exhaust(bytes.len());
    Err(Error::NotFound)
}

/// Shared walk over the sub TLVs of all Prefix TLVs, yielding one record
/// per fixed size entry of sub TLVs matching `sub_type`. An `entry_size` of
/// `usize::MAX` treats the whole sub TLV value as a single entry.
fn next_prefix_sub_entry<T>(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
    sub_type: TlvType,
    entry_size: usize,
    mut build: impl FnMut(&PrefixTlv, &TlvView, &[u8]) -> Option<T>,
) -> Result<T, Error> {
    let mut resume_sub = iterator.sub_offset();
    let mut resume_entry = iterator.entry_index();
    let mut reader = TlvReader::from_offset(bytes, iterator.tlv_offset());

    while let Some((tlv_offset, tlv)) = reader.next_tlv() {
        if tlv_offset != iterator.tlv_offset() {
            resume_sub = 0;
            resume_entry = 0;
        }
        if tlv.tlv_type != Some(TlvType::Prefix) {
            continue;
        }
        let Some(prefix) = PrefixTlv::parse(tlv.value) else {
            continue;
        };

        let start = resume_sub.max(prefix.sub_tlvs_offset());
        let mut sub_reader = TlvReader::from_offset(tlv.value, start);
        while let Some((sub_offset, sub_tlv)) = sub_reader.next_tlv() {
            let first_entry = if sub_offset == resume_sub {
                resume_entry
            } else {
                0
            };
            if sub_tlv.tlv_type != Some(sub_type) {
                continue;
            }

            if entry_size == usize::MAX {
                // Whole value entries: a sub TLV yields at most one record.
                if first_entry > 0 {
                    continue;
                }
                if let Some(record) = build(&prefix, &sub_tlv, sub_tlv.value) {
                    iterator.save(tlv_offset, sub_offset, 1);
                    return Ok(record);
                }
                continue;
            }

            let entries = sub_tlv.value.chunks_exact(entry_size);
            for (index, entry_bytes) in entries.enumerate().skip(first_entry) {
                if let Some(record) = build(&prefix, &sub_tlv, entry_bytes) {
                    iterator.save(tlv_offset, sub_offset, index + 1);
                    return Ok(record);
                }
            }
        }
    }

    iterator.exhaust(bytes.len());
    Err(Error::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn subnet(addr: Ipv6Addr, len: u8) -> Subnet {
        Subnet::new(addr, len).unwrap()
    }

    /// Network data with, in order: an unrecognized TLV, a prefix TLV with
    /// prefix length 129, a prefix TLV too short to hold anything, a prefix
    /// TLV without room for its prefix bytes, and finally a valid prefix
    /// TLV carrying two HasRoute sub TLVs.
    const MALFORMED_TOLERANCE: &[u8] = &[
        0xff, 0x03, 0x01, 0x02, 0x03, //
        0x03, 0x1d, 0x00, 0x81, 0xfd, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa,
        0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, 0x00, 0x03, 0xb8, 0x00, 0x40, 0x01, 0x03, 0x14, 0x00,
        0x00, //
        0x03, 0x01, 0x00, //
        0x03, 0x02, 0x00, 0x40, //
        0x03, 0x14, 0x00, 0x40, 0xfd, 0x00, 0x12, 0x34, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0xc8,
        0x00, 0x40, 0x01, 0x03, 0x54, 0x00, 0x00,
    ];

    #[test]
    fn external_routes_skip_malformed_tlvs() {
        let mut iterator = NetworkDataIterator::new();
        let prefix = subnet(Ipv6Addr::new(0xfd00, 0x1234, 0, 0, 0, 0, 0, 0), 64);

        let route = next_external_route(MALFORMED_TOLERANCE, &mut iterator).unwrap();
        assert_eq!(
            route,
            ExternalRouteConfig {
                prefix,
                rloc16: Rloc16::new(0xc800),
                preference: Preference::High,
                nat64: false,
                adv_pio: false,
                stable: false,
            }
        );

        let route = next_external_route(MALFORMED_TOLERANCE, &mut iterator).unwrap();
        assert_eq!(
            route,
            ExternalRouteConfig {
                prefix,
                rloc16: Rloc16::new(0x5400),
                preference: Preference::Medium,
                nat64: false,
                adv_pio: false,
                stable: true,
            }
        );

        assert_eq!(
            next_external_route(MALFORMED_TOLERANCE, &mut iterator),
            Err(Error::NotFound)
        );
        // Subsequent calls on an exhausted iterator stay exhausted.
        assert_eq!(
            next_external_route(MALFORMED_TOLERANCE, &mut iterator),
            Err(Error::NotFound)
        );
    }

    /// Network data holding a commissioning data TLV, three prefix TLVs
    /// with mixed HasRoute, BorderRouter and Context sub TLVs, and a server
    /// TLV, modeling a small partition.
    const MIXED_NETWORK_DATA: &[u8] = &[
        0x08, 0x04, 0x0b, 0x02, 0x00, 0x00, //
        0x03, 0x1e, 0x00, 0x40, 0xfd, 0x00, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00, //
        0x07, 0x02, 0x11, 0x40, //
        0x00, 0x03, 0x10, 0x00, 0x40, //
        0x01, 0x03, 0x54, 0x00, 0x00, //
        0x05, 0x04, 0x54, 0x00, 0x31, 0x00, //
        0x02, 0x0f, 0x00, 0x40, 0xfd, 0x00, 0xab, 0xba, 0xcd, 0xdc, 0x00, 0x00, //
        0x00, 0x03, 0x10, 0x00, 0x20, //
        0x03, 0x0e, 0x00, 0x20, 0xfd, 0x00, 0xab, 0xba, //
        0x01, 0x06, 0x54, 0x00, 0x00, 0x04, 0x01, 0x00,
    ];

    #[test]
    fn external_routes_across_prefixes() {
        let mut iterator = NetworkDataIterator::new();

        let expected = [
            (
                subnet(Ipv6Addr::new(0xfd00, 0x1234, 0x5678, 0, 0, 0, 0, 0), 64),
                0x1000,
                Preference::High,
                false,
                false,
            ),
            (
                subnet(Ipv6Addr::new(0xfd00, 0x1234, 0x5678, 0, 0, 0, 0, 0), 64),
                0x5400,
                Preference::Medium,
                false,
                true,
            ),
            (
                subnet(Ipv6Addr::new(0xfd00, 0xabba, 0xcddc, 0, 0, 0, 0, 0), 64),
                0x1000,
                Preference::Medium,
                true,
                false,
            ),
            (
                subnet(Ipv6Addr::new(0xfd00, 0xabba, 0, 0, 0, 0, 0, 0), 32),
                0x5400,
                Preference::Medium,
                false,
                true,
            ),
            (
                subnet(Ipv6Addr::new(0xfd00, 0xabba, 0, 0, 0, 0, 0, 0), 32),
                0x0401,
                Preference::Medium,
                false,
                true,
            ),
        ];

        for (prefix, rloc16, preference, nat64, stable) in expected {
            let route = next_external_route(MIXED_NETWORK_DATA, &mut iterator).unwrap();
            assert_eq!(route.prefix, prefix);
            assert_eq!(route.rloc16.value(), rloc16);
            assert_eq!(route.preference, preference);
            assert_eq!(route.nat64, nat64);
            assert_eq!(route.stable, stable);
        }

        assert_eq!(
            next_external_route(MIXED_NETWORK_DATA, &mut iterator),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn on_mesh_prefix_entries() {
        let mut iterator = NetworkDataIterator::new();

        let config = next_on_mesh_prefix(MIXED_NETWORK_DATA, &mut iterator).unwrap();
        assert_eq!(
            config.prefix,
            subnet(Ipv6Addr::new(0xfd00, 0x1234, 0x5678, 0, 0, 0, 0, 0), 64)
        );
        assert_eq!(config.rloc16.value(), 0x5400);
        assert_eq!(config.preference, Preference::Medium);
        assert!(config.preferred);
        assert!(config.slaac);
        assert!(!config.dhcp);
        assert!(!config.default_route);
        assert!(config.on_mesh);
        assert!(config.stable);

        assert_eq!(
            next_on_mesh_prefix(MIXED_NETWORK_DATA, &mut iterator),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn lowpan_contexts() {
        let mut iterator = NetworkDataIterator::new();

        let context = next_lowpan_context(MIXED_NETWORK_DATA, &mut iterator).unwrap();
        assert_eq!(context.context_id, 1);
        assert!(context.compress);
        assert!(context.stable);
        assert_eq!(
            context.prefix,
            subnet(Ipv6Addr::new(0xfd00, 0x1234, 0x5678, 0, 0, 0, 0, 0), 64)
        );

        assert_eq!(
            next_lowpan_context(MIXED_NETWORK_DATA, &mut iterator),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn services_yield_per_server() {
        // Two service TLVs, the first with two servers, the second with a
        // malformed (one byte) server sub TLV which is skipped.
        let bytes = [
            0x0b, 0x0e, 0x81, 0x02, 0x5c, 0x81, //
            0x0d, 0x03, 0x50, 0x01, 0x02, //
            0x0d, 0x03, 0x50, 0x02, 0x02, //
            0x0b, 0x08, 0x84, 0x01, 0x5c, 0x0d, 0x02, 0x14, 0x01, 0x0d,
        ];
        let mut iterator = NetworkDataIterator::new();

        let service = next_service(&bytes, &mut iterator).unwrap();
        assert_eq!(service.service_id, 1);
        assert_eq!(service.service_data, vec![0x5c, 0x81]);
        assert_eq!(service.server_rloc16.value(), 0x5001);
        assert_eq!(service.server_data, vec![0x02]);
        assert!(service.stable);

        let service = next_service(&bytes, &mut iterator).unwrap();
        assert_eq!(service.server_rloc16.value(), 0x5002);

        let service = next_service(&bytes, &mut iterator).unwrap();
        assert_eq!(service.service_id, 4);
        assert_eq!(service.service_data, vec![0x5c]);
        assert_eq!(service.server_rloc16.value(), 0x1401);

        assert_eq!(next_service(&bytes, &mut iterator), Err(Error::NotFound));
    }

    #[test]
    fn iteration_terminates_on_random_buffers() {
        // Small deterministic xorshift generator, no external inputs.
        let mut state = 0x853c_49e6_748f_ea9bu64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..500 {
            let len = (next() % 256) as usize;
            let bytes: Vec<u8> = (0..len).map(|_| (next() & 0xff) as u8).collect();

            let mut iterator = NetworkDataIterator::new();
            let mut calls = 0;
            while next_on_mesh_prefix(&bytes, &mut iterator).is_ok() {
                calls += 1;
                assert!(calls <= 4 * bytes.len() + 8, "iteration failed to terminate");
            }

            let mut iterator = NetworkDataIterator::new();
            let mut calls = 0;
            while next_external_route(&bytes, &mut iterator).is_ok() {
                calls += 1;
                assert!(calls <= 4 * bytes.len() + 8, "iteration failed to terminate");
            }

            let mut iterator = NetworkDataIterator::new();
            let mut calls = 0;
            while next_service(&bytes, &mut iterator).is_ok() {
                calls += 1;
                assert!(calls <= 4 * bytes.len() + 8, "iteration failed to terminate");
            }
        }
    }
}
