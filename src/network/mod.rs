//! Network layer helpers
//!
//! The bridge never parses full IP headers; the stack does that. This module
//! only provides what the bridge needs to hand a raw frame over:
//! - IP version detection from the first nibble of a frame
//! - Network protocol numbers passed along with injected frames
//! - Transport protocol numbers registered with the stack

const IPV4_VERSION: u8 = 4;
const IPV6_VERSION: u8 = 6;

/// Network-layer protocol identifier attached to an injected frame
///
/// Values follow the EtherType numbering the stack expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkProtocolNumber(pub u16);

impl NetworkProtocolNumber {
    pub const IPV4: NetworkProtocolNumber = NetworkProtocolNumber(0x0800);
    pub const IPV6: NetworkProtocolNumber = NetworkProtocolNumber(0x86DD);
    /// Left for the stack to decide on
    pub const UNKNOWN: NetworkProtocolNumber = NetworkProtocolNumber(0);

    /// Select the protocol from the version nibble of a raw IP frame
    pub fn from_frame(frame: &[u8]) -> Self {
        match ip_version(frame) {
            Some(IPV4_VERSION) => Self::IPV4,
            Some(IPV6_VERSION) => Self::IPV6,
            _ => Self::UNKNOWN,
        }
    }

    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

/// Read the IP version nibble, `None` for an empty frame
pub fn ip_version(frame: &[u8]) -> Option<u8> {
    frame.first().map(|b| (b & 0xF0) >> 4)
}

/// Transport protocol constants
pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}
