//! A TUN device bridge for a user-space TCP/IP stack
//!
//! This library connects a kernel TUN interface to a user-space network
//! stack and turns the traffic into proxy flows:
//! - TUN device opening by name or inherited descriptor
//! - Frame pump between the device and the stack's link endpoint
//! - TCP connection acceptance and UDP datagram forwarding
//! - SOCKS5-style destination address encoding

pub mod adapter;
pub mod config;
pub mod device;
pub mod error;
pub mod flow;
pub mod inbound;
pub mod link;
pub mod network;
pub mod stack;
pub mod transport;

// Re-export commonly used types
pub use adapter::{DnsServer, TunAdapter};
pub use config::{Handoff, TunConfig};
pub use device::{DeviceKind, DeviceSpec, TunDevice};
pub use error::{Result, TunError};
pub use flow::{ProxyAddr, TunTcpConn, TunUdpPacket};
pub use inbound::{ConnKind, InboundConn, InboundPacket};
pub use link::ChannelEndpoint;
pub use stack::{NetworkStack, StackError};
