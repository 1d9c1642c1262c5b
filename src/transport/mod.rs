//! Transport layer helpers
//!
//! This module contains the small pieces of transport-layer knowledge the
//! flow adapter needs on top of the stack:
//! - UDP: header parsing and the declared-length check
//! - TCP: endpoint states reported by the stack

pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use tcp::TcpState;
pub use udp::{UdpHeader, UDP_HEADER_LEN};
