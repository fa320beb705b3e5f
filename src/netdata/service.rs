//! DNS/SRP service discovery over the network data Service TLVs.
//!
//! The Thread service namespace advertises the partition's DNS and service
//! registration servers in two well known forms. Anycast records carry a
//! sequence number and point clients at an anycast locator, unicast records
//! carry a full socket address either in the service data or in each
//! server's data. Clients pick the anycast record with the freshest
//! sequence number, compared with serial number arithmetic.

use std::net::Ipv6Addr;

use crate::netdata::iter::ServiceConfig;
use crate::netdata::tlv::THREAD_ENTERPRISE_NUMBER;
use crate::rloc::{MeshLocalPrefix, Rloc16};
use crate::sequence_number::SeqNo;
use crate::Error;

use super::NetworkDataIterator;

/// Service number of the DNS/SRP anycast service.
pub const DNS_SRP_ANYCAST_SERVICE_NUMBER: u8 = 0x5c;
/// Service number of the DNS/SRP unicast service.
pub const DNS_SRP_UNICAST_SERVICE_NUMBER: u8 = 0x5d;

/// Where a unicast service record carries its socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsSrpUnicastSource {
    /// The address and port are part of the service data, shared by all
    /// servers of the service.
    ServiceData,
    /// Each server carries its own address and port in its server data.
    ServerData,
}

/// A discovered DNS/SRP anycast service entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsSrpAnycastInfo {
    /// The anycast address clients send to.
    pub anycast_address: Ipv6Addr,
    /// The advertised sequence number.
    pub sequence_number: SeqNo,
    /// The advertised protocol version.
    pub version: u8,
    /// Locator of the server backing this entry.
    pub rloc16: Rloc16,
}

/// A discovered DNS/SRP unicast service entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsSrpUnicastInfo {
    /// The server address.
    pub address: Ipv6Addr,
    /// The server UDP port.
    pub port: u16,
    /// The advertised protocol version.
    pub version: u8,
    /// Locator of the server backing this entry.
    pub rloc16: Rloc16,
}

/// The next DNS/SRP anycast entry after the iterator position. One entry is
/// yielded per Server sub TLV of each anycast service record.
pub(crate) fn next_dns_srp_anycast_info(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
    mesh_local: &MeshLocalPrefix,
) -> Result<DnsSrpAnycastInfo, Error> {
    next_thread_service_server(bytes, iterator, |config| {
        if config.service_data.len() < 2
            || config.service_data[0] != DNS_SRP_ANYCAST_SERVICE_NUMBER
        {
            return None;
        }
        Some(DnsSrpAnycastInfo {
            anycast_address: mesh_local.dns_srp_anycast_address(config.service_id),
            sequence_number: SeqNo::from(config.service_data[1]),
            version: config.server_data.first().copied().unwrap_or(0),
            rloc16: config.server_rloc16,
        })
    })
}

/// The next DNS/SRP unicast entry after the iterator position, for the
/// given address source.
pub(crate) fn next_dns_srp_unicast_info(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
    source: DnsSrpUnicastSource,
    mesh_local: &MeshLocalPrefix,
) -> Result<DnsSrpUnicastInfo, Error> {
    next_thread_service_server(bytes, iterator, |config| {
        if config.service_data.first() != Some(&DNS_SRP_UNICAST_SERVICE_NUMBER) {
            return None;
        }
        match source {
            DnsSrpUnicastSource::ServiceData => {
                // Service data: service number, address, port, optional
                // version.
                let data = &config.service_data;
                if data.len() < 19 {
                    return None;
                }
                let mut raw = [0; 16];
                raw.copy_from_slice(&data[1..17]);
                Some(DnsSrpUnicastInfo {
                    address: Ipv6Addr::from(raw),
                    port: u16::from_be_bytes([data[17], data[18]]),
                    version: data.get(19).copied().unwrap_or(0),
                    rloc16: config.server_rloc16,
                })
            }
            DnsSrpUnicastSource::ServerData => {
                let data = &config.server_data;
                if data.len() >= 18 {
                    // Server data: address, port, optional version.
                    let mut raw = [0; 16];
                    raw.copy_from_slice(&data[..16]);
                    Some(DnsSrpUnicastInfo {
                        address: Ipv6Addr::from(raw),
                        port: u16::from_be_bytes([data[16], data[17]]),
                        version: data.get(18).copied().unwrap_or(0),
                        rloc16: config.server_rloc16,
                    })
                } else if data.len() == 2 {
                    // Port only, the address is the server's mesh-local
                    // routing locator address.
                    Some(DnsSrpUnicastInfo {
                        address: mesh_local.rloc_address(config.server_rloc16),
                        port: u16::from_be_bytes([data[0], data[1]]),
                        version: 0,
                        rloc16: config.server_rloc16,
                    })
                } else {
                    None
                }
            }
        }
    })
}

/// The preferred DNS/SRP anycast entry.
///
/// The winning sequence number is determined with serial number arithmetic
/// and must be ahead of every other advertised number. When it is not, the
/// numbers span more than half of the sequence space, the stragglers are
/// treated as stale, and the numerically largest value wins instead. Among
/// the entries carrying the winning sequence number the highest version is
/// preferred, with remaining ties broken in favor of the entry encountered
/// first.
pub(crate) fn find_preferred_dns_srp_anycast_info(
    bytes: &[u8],
    mesh_local: &MeshLocalPrefix,
) -> Result<DnsSrpAnycastInfo, Error> {
    let mut serial_max: Option<SeqNo> = None;
    let mut numeric_max: Option<SeqNo> = None;

    let mut iterator = NetworkDataIterator::new();
    while let Ok(info) = next_dns_srp_anycast_info(bytes, &mut iterator, mesh_local) {
        let seq = info.sequence_number;
        match serial_max {
            Some(current) if !seq.gt(&current) => {}
            _ => serial_max = Some(seq),
        }
        match numeric_max {
            Some(current) if u8::from(seq) <= u8::from(current) => {}
            _ => numeric_max = Some(seq),
        }
    }

    let serial_max = serial_max.ok_or(Error::NotFound)?;
    let numeric_max = numeric_max.ok_or(Error::NotFound)?;

    let mut winner = serial_max;
    let mut iterator = NetworkDataIterator::new();
    while let Ok(info) = next_dns_srp_anycast_info(bytes, &mut iterator, mesh_local) {
        let seq = info.sequence_number;
        if seq != winner && !winner.gt(&seq) {
            winner = numeric_max;
            break;
        }
    }

    let mut preferred: Option<DnsSrpAnycastInfo> = None;
    let mut iterator = NetworkDataIterator::new();
    while let Ok(info) = next_dns_srp_anycast_info(bytes, &mut iterator, mesh_local) {
        if info.sequence_number != winner {
            continue;
        }
        match preferred {
            Some(current) if info.version <= current.version => {}
            _ => preferred = Some(info),
        }
    }

    preferred.ok_or(Error::NotFound)
}

/// Walk all (Service, Server) pairs scoped to the Thread enterprise number,
/// yielding the first record `build` accepts.
fn next_thread_service_server<T>(
    bytes: &[u8],
    iterator: &mut NetworkDataIterator,
    mut build: impl FnMut(&ServiceConfig) -> Option<T>,
) -> Result<T, Error> {
    loop {
        let config = super::iter::next_service(bytes, iterator)?;

        if config.enterprise_number != THREAD_ENTERPRISE_NUMBER {
            continue;
        }

        if let Some(record) = build(&config) {
            return Ok(record);
        }
    }
}
