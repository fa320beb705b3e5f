//! Wire format of the partition network data TLVs.
//!
//! Network data is a concatenation of TLVs. Each TLV starts with a type
//! byte whose upper 7 bits carry the type code and whose low bit marks the
//! entry as part of the stable network data, followed by a one byte length
//! and that many value bytes. Prefix and Service TLVs nest further sub TLVs
//! inside their value.
//!
//! All readers in this module are tolerant of malformed input. A TLV whose
//! declared length runs past the end of its buffer terminates iteration,
//! anything else that fails validation is skipped.

use crate::rloc::Rloc16;
use crate::subnet::Subnet;

/// The IANA enterprise number of the Thread Group, implied by the T flag in
/// a Service TLV.
pub const THREAD_ENTERPRISE_NUMBER: u32 = 44970;

/// Bit marking a TLV as part of the stable network data.
const STABLE_FLAG: u8 = 0x01;

/// Type codes of the recognized network data TLVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    /// External route entries, sub TLV of a Prefix TLV.
    HasRoute = 0,
    /// An IPv6 prefix and its sub TLVs.
    Prefix = 1,
    /// Border router entries, sub TLV of a Prefix TLV.
    BorderRouter = 2,
    /// A 6LoWPAN compression context, sub TLV of a Prefix TLV.
    Context = 3,
    /// The commissioning dataset of the partition.
    CommissioningData = 4,
    /// A service record and its Server sub TLVs.
    Service = 5,
    /// A server entry, sub TLV of a Service TLV.
    Server = 6,
}

impl TlvType {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TlvType::HasRoute),
            1 => Some(TlvType::Prefix),
            2 => Some(TlvType::BorderRouter),
            3 => Some(TlvType::Context),
            4 => Some(TlvType::CommissioningData),
            5 => Some(TlvType::Service),
            6 => Some(TlvType::Server),
            _ => None,
        }
    }

    /// The wire type byte for this TLV type with the given stable flag.
    pub fn wire_byte(self, stable: bool) -> u8 {
        ((self as u8) << 1) | u8::from(stable)
    }
}

/// Borrowed view of a single TLV.
#[derive(Debug, Clone, Copy)]
pub struct TlvView<'a> {
    /// The recognized TLV type, if any.
    pub tlv_type: Option<TlvType>,
    /// Whether the TLV is part of the stable network data.
    pub stable: bool,
    /// The value bytes.
    pub value: &'a [u8],
}

/// Forward reader over a TLV sequence.
///
/// The reader only yields TLVs which lie wholly within the buffer. A
/// truncated trailing TLV ends iteration, which also guarantees progress on
/// every call.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> TlvReader<'a> {
    /// Create a new `TlvReader` over the full buffer.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::from_offset(bytes, 0)
    }

    /// Create a new `TlvReader` starting at the given offset, typically one
    /// saved from an earlier iteration.
    pub fn from_offset(bytes: &'a [u8], offset: usize) -> Self {
        Self { bytes, offset }
    }

    /// The next TLV together with the offset it starts at, or `None` when
    /// the buffer is exhausted.
    pub fn next_tlv(&mut self) -> Option<(usize, TlvView<'a>)> {
        let offset = self.offset;
        if offset + 2 > self.bytes.len() {
            return None;
        }

        let type_byte = self.bytes[offset];
        let length = self.bytes[offset + 1] as usize;
        let end = offset + 2 + length;
        if end > self.bytes.len() {
            // The declared length runs past the buffer. There is no safe
            // way to resynchronize, so iteration ends here.
            return None;
        }

        self.offset = end;
        Some((
            offset,
            TlvView {
                tlv_type: TlvType::from_code(type_byte >> 1),
                stable: type_byte & STABLE_FLAG != 0,
                value: &self.bytes[offset + 2..end],
            },
        ))
    }
}

/// Route preference carried as a signed 2 bit field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preference {
    /// Low route preference.
    Low = -1,
    /// Medium route preference.
    #[default]
    Medium = 0,
    /// High route preference.
    High = 1,
}

impl Preference {
    /// Decode the 2 bit wire field. The reserved pattern `10` decodes as
    /// medium.
    pub fn from_wire(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => Preference::High,
            0b11 => Preference::Low,
            _ => Preference::Medium,
        }
    }

    /// The 2 bit wire encoding of this preference.
    pub fn to_wire(self) -> u8 {
        match self {
            Preference::High => 0b01,
            Preference::Medium => 0b00,
            Preference::Low => 0b11,
        }
    }
}

/// Typed view of a Prefix TLV value.
#[derive(Debug, Clone, Copy)]
pub struct PrefixTlv<'a> {
    /// The domain the prefix belongs to.
    pub domain_id: u8,
    /// Advertised prefix length in bits.
    pub prefix_len: u8,
    prefix_bytes: &'a [u8],
    sub_tlvs: &'a [u8],
    sub_tlvs_offset: usize,
}

impl<'a> PrefixTlv<'a> {
    /// Parse a Prefix TLV value. Returns `None` for prefixes longer than
    /// 128 bits or values too short to hold the advertised prefix.
    pub fn parse(value: &'a [u8]) -> Option<Self> {
        if value.len() < 2 {
            return None;
        }
        let domain_id = value[0];
        let prefix_len = value[1];
        if prefix_len > 128 {
            return None;
        }
        let prefix_byte_len = prefix_len.div_ceil(8) as usize;
        let sub_tlvs_offset = 2 + prefix_byte_len;
        if value.len() < sub_tlvs_offset {
            return None;
        }
        Some(Self {
            domain_id,
            prefix_len,
            prefix_bytes: &value[2..sub_tlvs_offset],
            sub_tlvs: &value[sub_tlvs_offset..],
            sub_tlvs_offset,
        })
    }

    /// The advertised prefix as a [`Subnet`].
    pub fn subnet(&self) -> Option<Subnet> {
        Subnet::from_wire_bits(self.prefix_bytes, self.prefix_len).ok()
    }

    /// The raw sub TLV bytes.
    pub fn sub_tlvs(&self) -> &'a [u8] {
        self.sub_tlvs
    }

    /// Offset of the sub TLV region within the TLV value.
    pub fn sub_tlvs_offset(&self) -> usize {
        self.sub_tlvs_offset
    }
}

/// Size in bytes of one border router entry.
pub const BORDER_ROUTER_ENTRY_SIZE: usize = 4;

/// Flag bits of a border router entry, high byte first on the wire.
const BR_PREFERENCE_OFFSET: u16 = 14;
const BR_PREFERRED: u16 = 1 << 13;
const BR_SLAAC: u16 = 1 << 12;
const BR_DHCP: u16 = 1 << 11;
const BR_CONFIGURE: u16 = 1 << 10;
const BR_DEFAULT_ROUTE: u16 = 1 << 9;
const BR_ON_MESH: u16 = 1 << 8;
const BR_ND_DNS: u16 = 1 << 7;
const BR_DOMAIN_PREFIX: u16 = 1 << 6;

/// One 4 byte entry of a BorderRouter sub TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorderRouterEntry {
    /// Locator of the border router announcing the entry.
    pub rloc16: Rloc16,
    flags: u16,
}

impl BorderRouterEntry {
    /// Parse one entry from the head of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < BORDER_ROUTER_ENTRY_SIZE {
            return None;
        }
        Some(Self {
            rloc16: Rloc16::new(u16::from_be_bytes([bytes[0], bytes[1]])),
            flags: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }

    /// The advertised route preference.
    pub fn preference(&self) -> Preference {
        Preference::from_wire((self.flags >> BR_PREFERENCE_OFFSET) as u8)
    }

    /// Whether the prefix is preferred.
    pub fn is_preferred(&self) -> bool {
        self.flags & BR_PREFERRED != 0
    }

    /// Whether the prefix can be used for stateless address configuration.
    pub fn is_slaac(&self) -> bool {
        self.flags & BR_SLAAC != 0
    }

    /// Whether the border router is a DHCPv6 agent for the prefix.
    pub fn is_dhcp(&self) -> bool {
        self.flags & BR_DHCP != 0
    }

    /// Whether the DHCPv6 agent supplies other configuration data.
    pub fn is_configure(&self) -> bool {
        self.flags & BR_CONFIGURE != 0
    }

    /// Whether the border router is a default router for the prefix.
    pub fn is_default_route(&self) -> bool {
        self.flags & BR_DEFAULT_ROUTE != 0
    }

    /// Whether the prefix is on-mesh.
    pub fn is_on_mesh(&self) -> bool {
        self.flags & BR_ON_MESH != 0
    }

    /// Whether the border router supplies DNS information via neighbor
    /// discovery.
    pub fn is_nd_dns(&self) -> bool {
        self.flags & BR_ND_DNS != 0
    }

    /// Whether the prefix is a domain prefix.
    pub fn is_domain_prefix(&self) -> bool {
        self.flags & BR_DOMAIN_PREFIX != 0
    }
}

/// Size in bytes of one external route entry.
pub const HAS_ROUTE_ENTRY_SIZE: usize = 3;

const HR_PREFERENCE_OFFSET: u8 = 6;
const HR_NAT64: u8 = 1 << 5;
const HR_ADV_PIO: u8 = 1 << 4;

/// One 3 byte entry of a HasRoute sub TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HasRouteEntry {
    /// Locator of the router announcing the route.
    pub rloc16: Rloc16,
    flags: u8,
}

impl HasRouteEntry {
    /// Parse one entry from the head of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HAS_ROUTE_ENTRY_SIZE {
            return None;
        }
        Some(Self {
            rloc16: Rloc16::new(u16::from_be_bytes([bytes[0], bytes[1]])),
            flags: bytes[2],
        })
    }

    /// The advertised route preference.
    pub fn preference(&self) -> Preference {
        Preference::from_wire(self.flags >> HR_PREFERENCE_OFFSET)
    }

    /// Whether the route is a NAT64 prefix.
    pub fn is_nat64(&self) -> bool {
        self.flags & HR_NAT64 != 0
    }

    /// Whether the router advertises the prefix in a PIO.
    pub fn is_adv_pio(&self) -> bool {
        self.flags & HR_ADV_PIO != 0
    }
}

const CONTEXT_COMPRESS: u8 = 1 << 4;
const CONTEXT_ID_MASK: u8 = 0x0f;

/// Typed view of a 6LoWPAN Context sub TLV value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextTlv {
    /// The 6LoWPAN context id.
    pub context_id: u8,
    /// Whether the context may be used for compression.
    pub compress: bool,
    /// Number of prefix bits covered by the context.
    pub context_length: u8,
}

impl ContextTlv {
    /// Parse a Context sub TLV value.
    pub fn parse(value: &[u8]) -> Option<Self> {
        if value.len() < 2 {
            return None;
        }
        Some(Self {
            context_id: value[0] & CONTEXT_ID_MASK,
            compress: value[0] & CONTEXT_COMPRESS != 0,
            context_length: value[1],
        })
    }
}

/// Flag marking a Service TLV as using the Thread enterprise number.
const SERVICE_THREAD_ENTERPRISE_FLAG: u8 = 0x80;
const SERVICE_ID_MASK: u8 = 0x0f;

/// Typed view of a Service TLV value.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTlv<'a> {
    /// The service id, used to derive anycast locators.
    pub service_id: u8,
    /// The IANA enterprise number the service data is scoped to.
    pub enterprise_number: u32,
    /// The service data bytes.
    pub service_data: &'a [u8],
    sub_tlvs: &'a [u8],
    sub_tlvs_offset: usize,
}

impl<'a> ServiceTlv<'a> {
    /// Parse a Service TLV value. The enterprise number is carried inline
    /// only when the T flag is clear, otherwise the Thread enterprise
    /// number is implied.
    pub fn parse(value: &'a [u8]) -> Option<Self> {
        let flags = *value.first()?;
        let service_id = flags & SERVICE_ID_MASK;

        let (enterprise_number, mut offset) = if flags & SERVICE_THREAD_ENTERPRISE_FLAG != 0 {
            (THREAD_ENTERPRISE_NUMBER, 1)
        } else {
            if value.len() < 5 {
                return None;
            }
            (
                u32::from_be_bytes([value[1], value[2], value[3], value[4]]),
                5,
            )
        };

        let service_data_len = *value.get(offset)? as usize;
        offset += 1;
        if value.len() < offset + service_data_len {
            return None;
        }
        let service_data = &value[offset..offset + service_data_len];
        offset += service_data_len;

        Some(Self {
            service_id,
            enterprise_number,
            service_data,
            sub_tlvs: &value[offset..],
            sub_tlvs_offset: offset,
        })
    }

    /// The raw sub TLV bytes.
    pub fn sub_tlvs(&self) -> &'a [u8] {
        self.sub_tlvs
    }

    /// Offset of the sub TLV region within the TLV value.
    pub fn sub_tlvs_offset(&self) -> usize {
        self.sub_tlvs_offset
    }
}

/// Typed view of a Server sub TLV value.
#[derive(Debug, Clone, Copy)]
pub struct ServerTlv<'a> {
    /// Locator of the server.
    pub rloc16: Rloc16,
    /// The server data bytes.
    pub server_data: &'a [u8],
}

impl<'a> ServerTlv<'a> {
    /// Parse a Server sub TLV value.
    pub fn parse(value: &'a [u8]) -> Option<Self> {
        if value.len() < 2 {
            return None;
        }
        Some(Self {
            rloc16: Rloc16::new(u16::from_be_bytes([value[0], value[1]])),
            server_data: &value[2..],
        })
    }
}
