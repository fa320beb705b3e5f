//! The partition network data store and its derived queries.
//!
//! Network data is a versioned, TLV encoded advertisement of border
//! routers, on-mesh prefixes, external routes, 6LoWPAN contexts,
//! commissioning data and services, shared by every node in a partition.
//! The store holds the current byte image and replaces it atomically, all
//! queries walk the bytes read-only through the iterators in [`iter`].

use bytes::Bytes;
use tracing::{debug, trace};

use crate::rloc::{MeshLocalPrefix, Rloc16};
use crate::subnet::Subnet;
use crate::Error;

pub mod commissioning;
pub mod iter;
pub mod service;
pub mod tlv;

pub use self::commissioning::{CommissioningDataset, JoinerDiscerner};
pub use self::iter::{
    ExternalRouteConfig, LowpanContextInfo, NetworkDataIterator, OnMeshPrefixConfig, ServiceConfig,
};
pub use self::service::{DnsSrpAnycastInfo, DnsSrpUnicastInfo, DnsSrpUnicastSource};

use self::tlv::{PrefixTlv, ServiceTlv, TlvReader, TlvType};

/// Largest supported network data image.
pub const MAX_NETWORK_DATA_SIZE: usize = 254;

/// Filter on which border routers to collect locators from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderRouterFilter {
    /// Any border router or server entry.
    AnyBrOrServer,
    /// Only border routers providing external IP connectivity: routers
    /// announcing an external route, or a prefix with the default route or
    /// DHCPv6 agent flags.
    BrProvidingExternalIpConn,
}

/// Filter on the device role a locator implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    /// Routers and children alike.
    AnyRole,
    /// Only router locators.
    RouterRoleOnly,
    /// Only child locators.
    ChildRoleOnly,
}

impl RoleFilter {
    fn matches(self, rloc16: Rloc16) -> bool {
        match self {
            RoleFilter::AnyRole => true,
            RoleFilter::RouterRoleOnly => rloc16.is_router(),
            RoleFilter::ChildRoleOnly => rloc16.is_child(),
        }
    }
}

/// The versioned network data image of the partition this node operates
/// in.
#[derive(Debug, Clone, Default)]
pub struct NetworkData {
    bytes: Bytes,
    version: u8,
    stable_version: u8,
    max_length: u8,
}

/// What changed when the network data image was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkDataChange {
    /// The full network data changed.
    pub changed: bool,
    /// The stable subset of the network data changed.
    pub stable_changed: bool,
}

impl NetworkData {
    /// Create a new, empty `NetworkData`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the network data image. The buffer is swapped wholesale, it
    /// is never mutated in place, so concurrent read-only walks of a clone
    /// stay consistent.
    pub fn set(&mut self, data: &[u8]) -> Result<NetworkDataChange, Error> {
        if data.len() > MAX_NETWORK_DATA_SIZE {
            return Err(Error::NoBufs);
        }

        let mut change = NetworkDataChange::default();
        if data != self.bytes.as_ref() {
            change.changed = true;
            change.stable_changed = stable_copy(&self.bytes) != stable_copy(data);

            self.version = self.version.wrapping_add(1);
            if change.stable_changed {
                self.stable_version = self.stable_version.wrapping_add(1);
            }
            self.bytes = Bytes::copy_from_slice(data);
            debug!(
                len = data.len(),
                version = self.version,
                stable_version = self.stable_version,
                "Network data replaced"
            );
        } else {
            trace!("Network data unchanged");
        }

        self.max_length = self.max_length.max(data.len() as u8);
        Ok(change)
    }

    /// The raw network data bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy the full or stable network data into `out`, returning the
    /// number of bytes written.
    pub fn get(&self, stable: bool, out: &mut [u8]) -> Result<usize, Error> {
        let data = if stable {
            stable_copy(&self.bytes)
        } else {
            self.bytes.to_vec()
        };
        if out.len() < data.len() {
            return Err(Error::NoBufs);
        }
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// The current length of the network data.
    pub fn length(&self) -> u8 {
        self.bytes.len() as u8
    }

    /// High water mark for the network data length since the last reset.
    pub fn max_length(&self) -> u8 {
        self.max_length
    }

    /// Reset the tracked maximum length to the current length.
    pub fn reset_max_length(&mut self) {
        self.max_length = self.length();
    }

    /// The network data version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The stable network data version.
    pub fn stable_version(&self) -> u8 {
        self.stable_version
    }

    /// The next on-mesh prefix entry after the iterator position.
    pub fn next_on_mesh_prefix(
        &self,
        iterator: &mut NetworkDataIterator,
    ) -> Result<OnMeshPrefixConfig, Error> {
        iter::next_on_mesh_prefix(&self.bytes, iterator)
    }

    /// The next external route entry after the iterator position.
    pub fn next_external_route(
        &self,
        iterator: &mut NetworkDataIterator,
    ) -> Result<ExternalRouteConfig, Error> {
        iter::next_external_route(&self.bytes, iterator)
    }

    /// The next (service, server) pair after the iterator position.
    pub fn next_service(
        &self,
        iterator: &mut NetworkDataIterator,
    ) -> Result<ServiceConfig, Error> {
        iter::next_service(&self.bytes, iterator)
    }

    /// The next 6LoWPAN context after the iterator position.
    pub fn next_lowpan_context(
        &self,
        iterator: &mut NetworkDataIterator,
    ) -> Result<LowpanContextInfo, Error> {
        iter::next_lowpan_context(&self.bytes, iterator)
    }

    /// The next DNS/SRP anycast entry after the iterator position.
    pub fn next_dns_srp_anycast_info(
        &self,
        iterator: &mut NetworkDataIterator,
        mesh_local: &MeshLocalPrefix,
    ) -> Result<DnsSrpAnycastInfo, Error> {
        service::next_dns_srp_anycast_info(&self.bytes, iterator, mesh_local)
    }

    /// The next DNS/SRP unicast entry after the iterator position, for the
    /// given address source.
    pub fn next_dns_srp_unicast_info(
        &self,
        iterator: &mut NetworkDataIterator,
        source: DnsSrpUnicastSource,
        mesh_local: &MeshLocalPrefix,
    ) -> Result<DnsSrpUnicastInfo, Error> {
        service::next_dns_srp_unicast_info(&self.bytes, iterator, source, mesh_local)
    }

    /// The preferred DNS/SRP anycast entry, selected by sequence number and
    /// version.
    pub fn find_preferred_dns_srp_anycast_info(
        &self,
        mesh_local: &MeshLocalPrefix,
    ) -> Result<DnsSrpAnycastInfo, Error> {
        service::find_preferred_dns_srp_anycast_info(&self.bytes, mesh_local)
    }

    /// Collect the locators of all border routers and servers matching the
    /// filters. The result is free of duplicates, in first-encountered
    /// order.
    pub fn find_rlocs(&self, br_filter: BorderRouterFilter, role: RoleFilter) -> Vec<Rloc16> {
        let mut rlocs = Vec::new();
        let mut add = |rloc16: Rloc16| {
            if role.matches(rloc16) && !rlocs.contains(&rloc16) {
                rlocs.push(rloc16);
            }
        };

        let mut reader = TlvReader::new(&self.bytes);
        while let Some((_, tlv)) = reader.next_tlv() {
            match tlv.tlv_type {
                Some(TlvType::Prefix) => {
                    let Some(prefix) = PrefixTlv::parse(tlv.value) else {
                        continue;
                    };
                    let mut sub_reader = TlvReader::new(prefix.sub_tlvs());
                    while let Some((_, sub_tlv)) = sub_reader.next_tlv() {
                        match sub_tlv.tlv_type {
                            Some(TlvType::HasRoute) => {
                                // Any external route provides external
                                // connectivity.
                                for entry in
                                    sub_tlv.value.chunks_exact(tlv::HAS_ROUTE_ENTRY_SIZE)
                                {
                                    if let Some(entry) = tlv::HasRouteEntry::parse(entry) {
                                        add(entry.rloc16);
                                    }
                                }
                            }
                            Some(TlvType::BorderRouter) => {
                                for entry in
                                    sub_tlv.value.chunks_exact(tlv::BORDER_ROUTER_ENTRY_SIZE)
                                {
                                    let Some(entry) = tlv::BorderRouterEntry::parse(entry) else {
                                        continue;
                                    };
                                    let matches = match br_filter {
                                        BorderRouterFilter::AnyBrOrServer => true,
                                        BorderRouterFilter::BrProvidingExternalIpConn => {
                                            entry.is_default_route() || entry.is_dhcp()
                                        }
                                    };
                                    if matches {
                                        add(entry.rloc16);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Some(TlvType::Service) => {
                    if br_filter != BorderRouterFilter::AnyBrOrServer {
                        continue;
                    }
                    let Some(service) = ServiceTlv::parse(tlv.value) else {
                        continue;
                    };
                    let mut sub_reader = TlvReader::new(service.sub_tlvs());
                    while let Some((_, sub_tlv)) = sub_reader.next_tlv() {
                        if sub_tlv.tlv_type != Some(TlvType::Server) {
                            continue;
                        }
                        if let Some(server) = tlv::ServerTlv::parse(sub_tlv.value) {
                            add(server.rloc16);
                        }
                    }
                }
                _ => {}
            }
        }

        rlocs
    }

    /// Number of border routers providing external IP connectivity,
    /// restricted to the given role.
    pub fn count_border_routers(&self, role: RoleFilter) -> usize {
        self.find_rlocs(BorderRouterFilter::BrProvidingExternalIpConn, role)
            .len()
    }

    /// Whether the given locator belongs to a border router providing
    /// external IP connectivity.
    pub fn contains_border_router_with_rloc(&self, rloc16: Rloc16) -> bool {
        self.find_rlocs(
            BorderRouterFilter::BrProvidingExternalIpConn,
            RoleFilter::AnyRole,
        )
        .contains(&rloc16)
    }

    /// Whether the network data advertises `prefix` as an off-mesh-routable
    /// prefix: a 64 bit, non link-local, non multicast prefix flagged
    /// on-mesh and SLAAC and not a domain prefix.
    pub fn contains_omr_prefix(&self, prefix: &Subnet) -> bool {
        if prefix.prefix_len() != 64 || prefix.is_link_local() || prefix.is_multicast() {
            return false;
        }

        let mut iterator = NetworkDataIterator::new();
        while let Ok(config) = self.next_on_mesh_prefix(&mut iterator) {
            if config.prefix == *prefix
                && config.on_mesh
                && config.slaac
                && !config.domain_prefix
            {
                return true;
            }
        }
        false
    }

    /// The commissioning dataset advertised in the network data.
    pub fn commissioning_dataset(&self) -> CommissioningDataset {
        commissioning::commissioning_dataset(&self.bytes)
    }

    /// Check whether the steering data admits a joiner with the given
    /// factory EUI-64.
    ///
    /// Returns `Ok(())` when the joiner is admitted, [`Error::NotFound`]
    /// when it is not, and [`Error::InvalidState`] when no steering data is
    /// present.
    pub fn steering_check_joiner(&self, eui64: &[u8; 8]) -> Result<(), Error> {
        self.steering_check(eui64)
    }

    /// Check whether the steering data admits a joiner advertising the
    /// given discerner. Same return contract as
    /// [`steering_check_joiner`](Self::steering_check_joiner).
    pub fn steering_check_joiner_with_discerner(
        &self,
        discerner: &JoinerDiscerner,
    ) -> Result<(), Error> {
        self.steering_check(&discerner.joiner_id())
    }

    fn steering_check(&self, joiner_id: &[u8; 8]) -> Result<(), Error> {
        let dataset = self.commissioning_dataset();
        let steering = dataset.steering_data.ok_or(Error::InvalidState)?;
        if steering.is_empty() {
            return Err(Error::InvalidState);
        }
        if commissioning::steering_contains(&steering, joiner_id) {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }
}

/// Build the stable subset of a network data image: non stable TLVs are
/// dropped, non stable sub TLVs are filtered out of Prefix and Service
/// TLVs, and Prefix/Service TLVs left without sub TLVs are dropped
/// entirely.
fn stable_copy(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut reader = TlvReader::new(bytes);

    while let Some((offset, tlv)) = reader.next_tlv() {
        if !tlv.stable {
            continue;
        }

        match tlv.tlv_type {
            Some(TlvType::Prefix) => {
                if let Some(prefix) = PrefixTlv::parse(tlv.value) {
                    let header_len = prefix.sub_tlvs_offset();
                    let subs = stable_sub_tlvs(prefix.sub_tlvs());
                    if subs.is_empty() {
                        continue;
                    }
                    out.push(bytes[offset]);
                    out.push((header_len + subs.len()) as u8);
                    out.extend_from_slice(&tlv.value[..header_len]);
                    out.extend_from_slice(&subs);
                } else {
                    // Malformed but stable: carried over verbatim.
                    out.extend_from_slice(&bytes[offset..offset + 2 + tlv.value.len()]);
                }
            }
            Some(TlvType::Service) => {
                if let Some(service) = ServiceTlv::parse(tlv.value) {
                    let header_len = service.sub_tlvs_offset();
                    let subs = stable_sub_tlvs(service.sub_tlvs());
                    if subs.is_empty() {
                        continue;
                    }
                    out.push(bytes[offset]);
                    out.push((header_len + subs.len()) as u8);
                    out.extend_from_slice(&tlv.value[..header_len]);
                    out.extend_from_slice(&subs);
                } else {
                    out.extend_from_slice(&bytes[offset..offset + 2 + tlv.value.len()]);
                }
            }
            _ => {
                out.extend_from_slice(&bytes[offset..offset + 2 + tlv.value.len()]);
            }
        }
    }

    out
}

/// The raw bytes of the stable sub TLVs in a sub TLV region.
fn stable_sub_tlvs(sub_tlvs: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sub_tlvs.len());
    let mut reader = TlvReader::new(sub_tlvs);
    while let Some((offset, sub_tlv)) = reader.next_tlv() {
        if sub_tlv.stable {
            out.extend_from_slice(&sub_tlvs[offset..offset + 2 + sub_tlv.value.len()]);
        }
    }
    out
}
