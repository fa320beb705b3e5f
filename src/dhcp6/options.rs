//! The DHCPv6 wire format
//! ([RFC 8415](https://datatracker.ietf.org/doc/html/rfc8415)), restricted
//! to the subset the client speaks: Solicit and Reply messages with the
//! rapid commit two message exchange.

use std::net::Ipv6Addr;

use bytes::BufMut;

/// UDP port the client binds to.
pub const DHCP6_CLIENT_PORT: u16 = 546;
/// UDP port agents listen on.
pub const DHCP6_SERVER_PORT: u16 = 547;

/// Realm-local all routers multicast address, the destination for
/// multicast solicits.
pub const REALM_LOCAL_ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff03, 0, 0, 0, 0, 0, 0, 2);

/// DHCPv6 message types used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A client soliciting addresses.
    Solicit = 1,
    /// A server's committed answer.
    Reply = 7,
}

impl MessageType {
    /// Decode a message type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Solicit),
            7 => Some(MessageType::Reply),
            _ => None,
        }
    }
}

/// Option codes.
pub const OPTION_CLIENT_ID: u16 = 1;
pub const OPTION_SERVER_ID: u16 = 2;
pub const OPTION_IA_NA: u16 = 3;
pub const OPTION_IA_ADDRESS: u16 = 5;
pub const OPTION_ELAPSED_TIME: u16 = 8;
pub const OPTION_STATUS_CODE: u16 = 13;
pub const OPTION_RAPID_COMMIT: u16 = 14;

/// DUID types.
const DUID_LINK_LAYER_ADDRESS_PLUS_TIME: u16 = 1;
const DUID_LINK_LAYER_ADDRESS: u16 = 3;

/// Hardware types.
const HARDWARE_TYPE_ETHERNET: u16 = 1;
const HARDWARE_TYPE_EUI64: u16 = 27;

/// The success status code.
const STATUS_SUCCESS: u16 = 0;

/// Size of the fixed message header: message type plus transaction id.
pub const HEADER_SIZE: usize = 4;

/// Wire size of an IA Address option value.
pub const IA_ADDRESS_SIZE: usize = 24;
/// Wire size of the fixed part of an IA_NA option value.
pub const IA_NA_HEADER_SIZE: usize = 12;
/// Wire size of a DUID-LL client id option value with an EUI-64.
const CLIENT_ID_SIZE: usize = 12;

/// A 3 byte DHCPv6 transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId([u8; 3]);

impl TransactionId {
    /// Generate a random transaction id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// The raw bytes.
    pub fn bytes(&self) -> &[u8; 3] {
        &self.0
    }
}

impl From<[u8; 3]> for TransactionId {
    fn from(value: [u8; 3]) -> Self {
        Self(value)
    }
}

/// Append the fixed message header.
pub fn write_header(dst: &mut impl BufMut, message_type: MessageType, transaction_id: TransactionId) {
    dst.put_u8(message_type as u8);
    dst.put_slice(transaction_id.bytes());
}

/// Append an Elapsed Time option carrying whole seconds since the first
/// transmission of the transaction.
pub fn write_elapsed_time(dst: &mut impl BufMut, elapsed_seconds: u16) {
    dst.put_u16(OPTION_ELAPSED_TIME);
    dst.put_u16(2);
    dst.put_u16(elapsed_seconds);
}

/// Append a Client Identifier option holding a DUID-LL with an EUI-64.
pub fn write_client_id(dst: &mut impl BufMut, eui64: &[u8; 8]) {
    dst.put_u16(OPTION_CLIENT_ID);
    dst.put_u16(CLIENT_ID_SIZE as u16);
    dst.put_u16(DUID_LINK_LAYER_ADDRESS);
    dst.put_u16(HARDWARE_TYPE_EUI64);
    dst.put_slice(eui64);
}

/// Append an IA_NA option header (IAID 0, T1 and T2 0) sized to cover
/// `address_count` IA Address options written directly after it.
pub fn write_ia_na_header(dst: &mut impl BufMut, address_count: usize) {
    let length = IA_NA_HEADER_SIZE + (IA_ADDRESS_SIZE + 4) * address_count;
    dst.put_u16(OPTION_IA_NA);
    dst.put_u16(length as u16);
    dst.put_u32(0); // IAID
    dst.put_u32(0); // T1
    dst.put_u32(0); // T2
}

/// Append an IA Address option.
pub fn write_ia_address(
    dst: &mut impl BufMut,
    address: Ipv6Addr,
    preferred_lifetime: u32,
    valid_lifetime: u32,
) {
    dst.put_u16(OPTION_IA_ADDRESS);
    dst.put_u16(IA_ADDRESS_SIZE as u16);
    dst.put_slice(&address.octets());
    dst.put_u32(preferred_lifetime);
    dst.put_u32(valid_lifetime);
}

/// Append an empty Rapid Commit option.
pub fn write_rapid_commit(dst: &mut impl BufMut) {
    dst.put_u16(OPTION_RAPID_COMMIT);
    dst.put_u16(0);
}

/// Iterator over the (code, value) pairs of a DHCPv6 option sequence. A
/// truncated trailing option ends iteration.
pub struct OptionIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> OptionIter<'a> {
    /// Create a new `OptionIter` over an option sequence.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 4 > self.bytes.len() {
            return None;
        }
        let code = u16::from_be_bytes([self.bytes[self.offset], self.bytes[self.offset + 1]]);
        let length =
            u16::from_be_bytes([self.bytes[self.offset + 2], self.bytes[self.offset + 3]]) as usize;
        let start = self.offset + 4;
        let end = start + length;
        if end > self.bytes.len() {
            return None;
        }
        self.offset = end;
        Some((code, &self.bytes[start..end]))
    }
}

/// The value of the first option with the given code, if any.
pub fn find_option(bytes: &[u8], code: u16) -> Option<&[u8]> {
    OptionIter::new(bytes).find(|(c, _)| *c == code).map(|(_, v)| v)
}

/// A parsed IA Address option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaAddress {
    /// The assigned address.
    pub address: Ipv6Addr,
    /// Preferred lifetime in seconds.
    pub preferred_lifetime: u32,
    /// Valid lifetime in seconds.
    pub valid_lifetime: u32,
}

/// Parse an IA Address option value. The value must be exactly the fixed
/// size, sub options are not produced by the agents the client talks to.
pub fn parse_ia_address(value: &[u8]) -> Option<IaAddress> {
    if value.len() != IA_ADDRESS_SIZE {
        return None;
    }
    let mut raw = [0; 16];
    raw.copy_from_slice(&value[..16]);
    Some(IaAddress {
        address: Ipv6Addr::from(raw),
        preferred_lifetime: u32::from_be_bytes([value[16], value[17], value[18], value[19]]),
        valid_lifetime: u32::from_be_bytes([value[20], value[21], value[22], value[23]]),
    })
}

/// Whether a Server Identifier option value is one the client accepts: a
/// DUID-LL plus time with an Ethernet address, or a DUID-LL with an
/// EUI-64.
pub fn server_id_valid(value: &[u8]) -> bool {
    if value.len() < 4 {
        return false;
    }
    let duid_type = u16::from_be_bytes([value[0], value[1]]);
    let hardware_type = u16::from_be_bytes([value[2], value[3]]);

    (duid_type == DUID_LINK_LAYER_ADDRESS_PLUS_TIME && hardware_type == HARDWARE_TYPE_ETHERNET)
        || (value.len() == CLIENT_ID_SIZE
            && duid_type == DUID_LINK_LAYER_ADDRESS
            && hardware_type == HARDWARE_TYPE_EUI64)
}

/// Whether a Client Identifier option value matches our own DUID-LL with
/// the given EUI-64.
pub fn client_id_matches(value: &[u8], eui64: &[u8; 8]) -> bool {
    value.len() == CLIENT_ID_SIZE
        && u16::from_be_bytes([value[0], value[1]]) == DUID_LINK_LAYER_ADDRESS
        && u16::from_be_bytes([value[2], value[3]]) == HARDWARE_TYPE_EUI64
        && &value[4..] == eui64
}

/// Whether a Status Code option value reports success.
pub fn status_is_success(value: &[u8]) -> bool {
    value.len() >= 2 && u16::from_be_bytes([value[0], value[1]]) == STATUS_SUCCESS
}
