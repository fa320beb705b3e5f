//! Data plane components of an IEEE 802.15.4 based IPv6 mesh stack.
//!
//! The crate covers three closely coupled subsystems of a mesh router:
//!
//! * [`netdata`] parses and queries the partition's versioned, TLV encoded
//!   network data: on-mesh prefixes, external routes, 6LoWPAN contexts,
//!   commissioning data and DNS/SRP service records.
//! * [`dhcp6`] solicits addresses from in-mesh DHCPv6 agents for every
//!   DHCP flagged on-mesh prefix, driven by network data changes.
//! * [`indirect`] delivers queued messages to sleepy children on their
//!   data polls, with radio source matching and an optional CSL transmit
//!   scheduler.
//!
//! [`stack`] owns the subsystems and routes notifier events between them;
//! everything else in the crate is a synchronous state machine driven with
//! explicit time, so embedders with their own event loop can skip the
//! stack and drive the pieces directly.

pub mod child;
pub mod dhcp6;
mod error;
pub mod indirect;
pub mod mac;
pub mod message;
pub mod metrics;
pub mod netdata;
pub mod notifier;
pub mod rloc;
pub mod sequence_number;
pub mod stack;
pub mod subnet;
pub mod trickle;

pub use error::Error;
pub use stack::{Config, ExternalEvent, Stack};
