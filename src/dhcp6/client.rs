//! DHCPv6 client soliciting addresses for DHCP flagged on-mesh prefixes.
//!
//! The client keeps one identity association per candidate prefix found in
//! the partition network data. Associations are created when a DHCP
//! flagged prefix appears and torn down the moment it disappears. One
//! association at a time runs the rapid commit Solicit/Reply exchange,
//! paced by a trickle timer, and a committed address is installed on the
//! thread interface until its prefix vanishes or its valid lifetime runs
//! out.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use crate::dhcp6::options::{
    client_id_matches, find_option, parse_ia_address, server_id_valid, status_is_success,
    write_client_id, write_elapsed_time, write_header, write_ia_address, write_ia_na_header,
    write_rapid_commit, MessageType, OptionIter, TransactionId, DHCP6_SERVER_PORT, HEADER_SIZE,
    IA_NA_HEADER_SIZE, OPTION_CLIENT_ID, OPTION_IA_ADDRESS, OPTION_IA_NA, OPTION_RAPID_COMMIT,
    OPTION_SERVER_ID, OPTION_STATUS_CODE, REALM_LOCAL_ALL_ROUTERS,
};
use crate::metrics::Metrics;
use crate::netdata::{NetworkData, NetworkDataIterator};
use crate::rloc::{MeshLocalPrefix, Rloc16};
use crate::subnet::Subnet;
use crate::trickle::TrickleTimer;
use crate::Error;

/// Capacity of the identity association table.
pub const MAX_IDENTITY_ASSOCIATIONS: usize = 4;

/// Trickle interval bounds for solicit retransmission.
const TRICKLE_IMIN: Duration = Duration::from_secs(1);
const TRICKLE_IMAX: Duration = Duration::from_secs(120);

/// A valid lifetime of all ones means the address never expires.
const INFINITE_LIFETIME: u32 = u32::MAX;

/// An address the client installs on the thread interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetifAddress {
    /// The address itself.
    pub address: Ipv6Addr,
    /// Prefix length of the subnet the address was assigned from.
    pub prefix_len: u8,
    /// Whether the preferred lifetime is still running.
    pub preferred: bool,
    /// Whether the valid lifetime is still running.
    pub valid: bool,
}

/// Interface address operations driven by the client. Addresses managed
/// through this trait are owned by the DHCPv6 client, no other subsystem
/// removes them.
pub trait Netif {
    /// Install an address.
    fn add_address(&mut self, address: NetifAddress);
    /// Remove a previously installed address.
    fn remove_address(&mut self, address: &NetifAddress);
}

/// Outbound datagram sink for the socket bound to the DHCPv6 client port.
pub trait Transport {
    /// Send a datagram.
    fn send_to(&mut self, payload: &[u8], dst: SocketAddrV6) -> Result<(), Error>;
}

/// Lifecycle of an identity association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum IaStatus {
    /// The slot is unused.
    #[default]
    Invalid,
    /// A solicit is queued for this association.
    Solicit,
    /// The solicit exchange is in flight.
    Soliciting,
    /// A reply was accepted and the address is installed.
    SolicitReplied,
}

/// One identity association, bound to a candidate DHCP prefix.
#[derive(Debug, Clone, Copy, Default)]
struct IdentityAssociation {
    status: IaStatus,
    prefix: Option<Subnet>,
    address: Option<Ipv6Addr>,
    agent_rloc: Option<Rloc16>,
    preferred_lifetime: u32,
    valid_lifetime: u32,
    installed_at: Option<Instant>,
}

impl IdentityAssociation {
    fn netif_address(&self) -> Option<NetifAddress> {
        Some(NetifAddress {
            address: self.address?,
            prefix_len: self.prefix?.prefix_len(),
            preferred: self.preferred_lifetime != 0,
            valid: self.valid_lifetime != 0,
        })
    }
}

/// The DHCPv6 client.
pub struct Client<M> {
    running: bool,
    trickle: TrickleTimer,
    transaction_id: TransactionId,
    solicit_start: Option<Instant>,
    identity_associations: [IdentityAssociation; MAX_IDENTITY_ASSOCIATIONS],
    current: Option<usize>,
    eui64: [u8; 8],
    multicast_solicit: bool,
    metrics: M,
}

impl<M> Client<M>
where
    M: Metrics,
{
    /// Create a new, stopped `Client`.
    ///
    /// With `multicast_solicit` set, solicits go to the realm-local all
    /// routers group instead of the prefix agent's routing locator
    /// address.
    pub fn new(eui64: [u8; 8], multicast_solicit: bool, metrics: M) -> Self {
        Self {
            running: false,
            trickle: TrickleTimer::new(TRICKLE_IMIN, TRICKLE_IMAX),
            transaction_id: TransactionId::generate(),
            solicit_start: None,
            identity_associations: [IdentityAssociation::default(); MAX_IDENTITY_ASSOCIATIONS],
            current: None,
            eui64,
            multicast_solicit,
            metrics,
        }
    }

    /// Whether the client currently wants its socket open.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Reconcile the identity association table against the current
    /// network data. Associations whose prefix vanished are torn down
    /// immediately, new DHCP flagged prefixes get a fresh association, and
    /// the client starts or stops depending on whether any agent is left.
    pub fn handle_netdata_changed<N: Netif>(
        &mut self,
        netdata: &NetworkData,
        netif: &mut N,
        now: Instant,
    ) {
        // Tear down associations whose prefix is no longer advertised with
        // the DHCP flag.
        for index in 0..self.identity_associations.len() {
            let ia = self.identity_associations[index];
            if ia.status == IaStatus::Invalid {
                continue;
            }
            let Some(prefix) = ia.prefix else {
                continue;
            };

            let mut found = false;
            let mut iterator = NetworkDataIterator::new();
            while let Ok(config) = netdata.next_on_mesh_prefix(&mut iterator) {
                if config.dhcp && config.prefix == prefix {
                    found = true;
                    break;
                }
            }

            if !found {
                if ia.valid_lifetime != 0 {
                    if let Some(address) = ia.netif_address() {
                        netif.remove_address(&address);
                    }
                }
                self.identity_associations[index] = IdentityAssociation::default();
                if self.current == Some(index) {
                    self.current = None;
                }
                debug!(%prefix, "DHCP prefix withdrawn, association invalidated");
            }
        }

        // Create associations for newly advertised DHCP prefixes.
        let mut agent_exists = false;
        let mut iterator = NetworkDataIterator::new();
        while let Ok(config) = netdata.next_on_mesh_prefix(&mut iterator) {
            if !config.dhcp {
                continue;
            }
            agent_exists = true;

            let mut existing = None;
            let mut free = None;
            for (index, ia) in self.identity_associations.iter().enumerate() {
                if ia.status == IaStatus::Invalid {
                    if free.is_none() {
                        free = Some(index);
                    }
                } else if ia.prefix == Some(config.prefix) {
                    existing = Some(index);
                    break;
                }
            }

            let index = match existing.or(free) {
                Some(index) => index,
                None => {
                    warn!(prefix = %config.prefix, "No association slot left for DHCP prefix");
                    continue;
                }
            };

            if existing.is_none() {
                self.identity_associations[index] = IdentityAssociation {
                    status: IaStatus::Solicit,
                    prefix: Some(config.prefix),
                    address: Some(config.prefix.network()),
                    ..Default::default()
                };
                debug!(prefix = %config.prefix, agent = %config.rloc16, "New DHCP prefix");
            }
            self.identity_associations[index].agent_rloc = Some(config.rloc16);
        }

        if agent_exists {
            self.start(now);
        } else {
            self.stop();
        }
    }

    fn start(&mut self, now: Instant) {
        if self.running {
            return;
        }
        self.running = true;
        info!("DHCPv6 client started");
        self.process_next_identity_association(now);
    }

    fn stop(&mut self) {
        self.trickle.stop();
        self.current = None;
        if self.running {
            self.running = false;
            info!("DHCPv6 client stopped");
        }
    }

    /// Pick the next association in `Solicit` state and begin its
    /// exchange. Returns `false` when there is nothing to do. An in-flight
    /// exchange is never interrupted.
    fn process_next_identity_association(&mut self, now: Instant) -> bool {
        if let Some(index) = self.current {
            if self.identity_associations[index].status == IaStatus::Soliciting {
                return false;
            }
        }

        self.trickle.stop();

        for index in 0..self.identity_associations.len() {
            if self.identity_associations[index].status != IaStatus::Solicit {
                continue;
            }
            self.transaction_id = TransactionId::generate();
            self.current = Some(index);
            self.trickle.start(now);
            return true;
        }

        false
    }

    /// The next point in time [`handle_timer`](Self::handle_timer) or
    /// [`evaluate_lifetimes`](Self::evaluate_lifetimes) wants to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        let lifetime = self
            .identity_associations
            .iter()
            .filter_map(|ia| self.expiry(ia))
            .min();
        match (self.trickle.next_deadline(), lifetime) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) => deadline,
            (None, deadline) => deadline,
        }
    }

    fn expiry(&self, ia: &IdentityAssociation) -> Option<Instant> {
        if ia.status != IaStatus::SolicitReplied
            || ia.valid_lifetime == 0
            || ia.valid_lifetime == INFINITE_LIFETIME
        {
            return None;
        }
        Some(ia.installed_at? + Duration::from_secs(u64::from(ia.valid_lifetime)))
    }

    /// Drive the trickle timer: transmit a solicit for the current
    /// association, or advance to the next one.
    pub fn handle_timer<T: Transport>(
        &mut self,
        mesh_local: &MeshLocalPrefix,
        transport: &mut T,
        now: Instant,
    ) {
        if !self.trickle.is_running() || !self.trickle.handle_expired(now) {
            return;
        }

        let Some(index) = self.current else {
            self.trickle.stop();
            return;
        };

        match self.identity_associations[index].status {
            IaStatus::Solicit => {
                self.solicit_start = Some(now);
                self.identity_associations[index].status = IaStatus::Soliciting;
                self.solicit(mesh_local, transport, now);
            }
            IaStatus::Soliciting => self.solicit(mesh_local, transport, now),
            IaStatus::SolicitReplied | IaStatus::Invalid => {
                self.current = None;
                if !self.process_next_identity_association(now) {
                    self.stop();
                }
            }
        }
    }

    /// Invalidate associations whose valid lifetime ran out and remove
    /// their addresses.
    pub fn evaluate_lifetimes<N: Netif>(&mut self, netif: &mut N, now: Instant) {
        for index in 0..self.identity_associations.len() {
            let ia = self.identity_associations[index];
            let Some(expiry) = self.expiry(&ia) else {
                continue;
            };
            if now < expiry {
                continue;
            }
            if let Some(address) = ia.netif_address() {
                netif.remove_address(&address);
            }
            self.identity_associations[index] = IdentityAssociation::default();
            debug!(prefix = ?ia.prefix, "DHCPv6 address lifetime expired");
        }
    }

    fn solicit<T: Transport>(
        &mut self,
        mesh_local: &MeshLocalPrefix,
        transport: &mut T,
        now: Instant,
    ) {
        let Some(index) = self.current else {
            return;
        };
        let Some(agent_rloc) = self.identity_associations[index].agent_rloc else {
            return;
        };

        let mut buf = BytesMut::with_capacity(128);
        write_header(&mut buf, MessageType::Solicit, self.transaction_id);

        let elapsed = self
            .solicit_start
            .map(|start| now.duration_since(start).as_secs().min(u64::from(u16::MAX)) as u16)
            .unwrap_or(0);
        write_elapsed_time(&mut buf, elapsed);
        write_client_id(&mut buf, &self.eui64);

        // One IA address per in-flight association bound to the solicited
        // agent.
        let addresses: Vec<Ipv6Addr> = self
            .identity_associations
            .iter()
            .filter(|ia| {
                matches!(ia.status, IaStatus::Solicit | IaStatus::Soliciting)
                    && ia.agent_rloc == Some(agent_rloc)
            })
            .filter_map(|ia| ia.address)
            .collect();
        write_ia_na_header(&mut buf, addresses.len());
        for address in &addresses {
            write_ia_address(&mut buf, *address, 0, 0);
        }
        write_rapid_commit(&mut buf);

        let destination = if self.multicast_solicit {
            REALM_LOCAL_ALL_ROUTERS
        } else {
            mesh_local.rloc_address(agent_rloc)
        };
        let destination = SocketAddrV6::new(destination, DHCP6_SERVER_PORT, 0, 0);

        match transport.send_to(&buf, destination) {
            Ok(()) => {
                self.metrics.dhcp6_solicit_sent();
                info!(agent = %agent_rloc, "Solicit sent");
            }
            Err(error) => warn!(%error, "Failed to send DHCPv6 solicit"),
        }
    }

    /// Process a datagram received on the client socket. Anything but a
    /// valid Reply to the outstanding transaction is silently dropped.
    pub fn handle_udp_receive<N: Netif>(&mut self, payload: &[u8], netif: &mut N, now: Instant) {
        if payload.len() < HEADER_SIZE
            || MessageType::from_u8(payload[0]) != Some(MessageType::Reply)
            || payload[1..HEADER_SIZE] != self.transaction_id.bytes()[..]
        {
            trace!("Ignoring datagram not matching the outstanding transaction");
            return;
        }

        match self.process_reply(&payload[HEADER_SIZE..], netif, now) {
            Ok(()) => {
                self.metrics.dhcp6_reply_accepted();
                self.advance(now);
            }
            Err(error) => {
                self.metrics.dhcp6_reply_dropped();
                trace!(%error, "Dropped invalid DHCPv6 reply");
            }
        }
    }

    fn process_reply<N: Netif>(
        &mut self,
        options: &[u8],
        netif: &mut N,
        now: Instant,
    ) -> Result<(), Error> {
        if let Some(status) = find_option(options, OPTION_STATUS_CODE) {
            if !status_is_success(status) {
                return Err(Error::Parse);
            }
        }

        let server_id = find_option(options, OPTION_SERVER_ID).ok_or(Error::NotFound)?;
        if !server_id_valid(server_id) {
            return Err(Error::Parse);
        }

        let client_id = find_option(options, OPTION_CLIENT_ID).ok_or(Error::NotFound)?;
        if !client_id_matches(client_id, &self.eui64) {
            return Err(Error::Parse);
        }

        find_option(options, OPTION_RAPID_COMMIT).ok_or(Error::NotFound)?;

        let ia_na = find_option(options, OPTION_IA_NA).ok_or(Error::NotFound)?;
        self.process_ia_na(ia_na, netif, now)
    }

    fn process_ia_na<N: Netif>(
        &mut self,
        value: &[u8],
        netif: &mut N,
        now: Instant,
    ) -> Result<(), Error> {
        if value.len() < IA_NA_HEADER_SIZE {
            return Err(Error::Parse);
        }
        let options = &value[IA_NA_HEADER_SIZE..];

        if let Some(status) = find_option(options, OPTION_STATUS_CODE) {
            if !status_is_success(status) {
                return Err(Error::Parse);
            }
        }

        for (code, option_value) in OptionIter::new(options) {
            if code != OPTION_IA_ADDRESS {
                continue;
            }
            self.process_ia_address(option_value, netif, now)?;
        }
        Ok(())
    }

    fn process_ia_address<N: Netif>(
        &mut self,
        value: &[u8],
        netif: &mut N,
        now: Instant,
    ) -> Result<(), Error> {
        let assigned = parse_ia_address(value).ok_or(Error::Parse)?;

        for ia in self.identity_associations.iter_mut() {
            if ia.status == IaStatus::Invalid || ia.valid_lifetime != 0 {
                continue;
            }
            let Some(prefix) = ia.prefix else {
                continue;
            };
            if !prefix.contains_ip(assigned.address) {
                continue;
            }

            ia.address = Some(assigned.address);
            ia.preferred_lifetime = assigned.preferred_lifetime;
            ia.valid_lifetime = assigned.valid_lifetime;
            ia.installed_at = Some(now);
            ia.status = IaStatus::SolicitReplied;
            if let Some(address) = ia.netif_address() {
                netif.add_address(address);
            }
            info!(address = %assigned.address, "DHCPv6 address assigned");
            return Ok(());
        }

        Err(Error::NotFound)
    }

    /// After an accepted reply, move on to the next queued association, or
    /// stop when everything is served.
    fn advance(&mut self, now: Instant) {
        let Some(index) = self.current else {
            return;
        };
        if self.identity_associations[index].status != IaStatus::SolicitReplied {
            return;
        }
        self.current = None;
        if !self.process_next_identity_association(now) {
            self.stop();
        }
    }
}
