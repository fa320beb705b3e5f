//! DHCPv6 client for in-mesh address assignment.
//!
//! Border routers advertising a prefix with the DHCP flag run a DHCPv6
//! agent on the mesh. The [`client`] watches the partition network data
//! for such prefixes and runs a rapid commit Solicit/Reply exchange
//! against the agent for each, installing the committed addresses on the
//! thread interface. [`options`] holds the wire codec.

pub mod client;
pub mod options;

pub use self::client::{Client, Netif, NetifAddress, Transport, MAX_IDENTITY_ASSOCIATIONS};
pub use self::options::{TransactionId, DHCP6_CLIENT_PORT, DHCP6_SERVER_PORT};
