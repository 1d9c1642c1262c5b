//! Protocol engine boundary
//!
//! The bridge does not implement TCP/IP. It drives a user-space engine
//! through the traits in this module:
//! - `NetworkStack`: NIC creation, routing, handler registration
//! - `LinkEndpoint` / `NetworkDispatcher`: frame exchange with a NIC
//! - `ForwarderRequest` / `TcpEndpoint`: per-SYN acceptance
//!
//! Handlers registered with the engine may be invoked concurrently for
//! independent flows, so every callback type here is `Send + Sync`.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::network::NetworkProtocolNumber;
use crate::transport::TcpState;

#[cfg(test)]
pub(crate) mod mock;

/// Errors reported by the protocol engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("duplicate nic id {0}")]
    DuplicateNicId(u32),

    #[error("unknown nic id {0}")]
    UnknownNicId(u32),

    #[error("outbound queue full")]
    QueueFull,

    #[error("no route to {0}")]
    NoRoute(IpAddr),

    #[error("endpoint creation failed: {0}")]
    EndpointCreation(String),

    #[error("stack closed")]
    Closed,
}

/// Identifier of a NIC inside the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicId(pub u32);

/// An address prefix used as a route destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub address: IpAddr,
    pub prefix: u8,
}

impl Subnet {
    /// 0.0.0.0/0
    pub fn ipv4_empty() -> Self {
        Subnet {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    /// ::/0
    pub fn ipv6_empty() -> Self {
        Subnet {
            address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

/// A static route pointing a subnet at a NIC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Subnet,
    pub gateway: Option<IpAddr>,
    pub nic: NicId,
}

/// Stack-level flow identifier
///
/// `local_*` is the destination the tunnel client dialed, `remote_*` is the
/// client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportEndpointId {
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
}

impl TransportEndpointId {
    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }

    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }
}

/// A frame or datagram moving between the bridge and the stack
///
/// Inbound frames carry everything in `data`. Datagrams handed to the UDP
/// handler have the transport header split off into `transport_header`.
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    transport_header: Bytes,
    data: Bytes,
}

impl PacketBuffer {
    /// Wrap a whole frame
    pub fn from_payload(data: impl Into<Bytes>) -> Self {
        PacketBuffer {
            transport_header: Bytes::new(),
            data: data.into(),
        }
    }

    /// Build a datagram view with its transport header already parsed out
    pub fn with_transport_header(header: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        PacketBuffer {
            transport_header: header.into(),
            data: data.into(),
        }
    }

    pub fn transport_header(&self) -> &[u8] {
        &self.transport_header
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Total size of header and data
    pub fn size(&self) -> usize {
        self.transport_header.len() + self.data.len()
    }

    /// Flatten into one contiguous buffer, copying only when a header is present
    pub fn to_bytes(&self) -> Bytes {
        if self.transport_header.is_empty() {
            return self.data.clone();
        }
        let mut buf = BytesMut::with_capacity(self.size());
        buf.extend_from_slice(&self.transport_header);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }
}

/// Receives frames from a link endpoint
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(&self, protocol: NetworkProtocolNumber, pkt: PacketBuffer);
}

/// The link side of a NIC
pub trait LinkEndpoint: Send + Sync {
    fn mtu(&self) -> u32;

    /// Attach (or with `None`, detach) the stack's dispatcher
    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>);

    fn is_attached(&self) -> bool;

    /// Queue an outbound frame produced by the stack
    fn write_packet(&self, pkt: PacketBuffer) -> Result<(), StackError>;
}

/// An accepted TCP endpoint
pub trait TcpEndpoint: Read + Write + Send {
    /// Flow identifier of the accepted connection
    fn info(&self) -> TransportEndpointId;

    /// `None` when the endpoint never reached a connected state
    fn remote_addr(&self) -> Option<SocketAddr>;

    fn state(&self) -> TcpState;

    fn close(&mut self);
}

/// One pending SYN handed to the TCP forwarder
pub trait ForwarderRequest: Send {
    fn id(&self) -> TransportEndpointId;

    /// Materialize a connected endpoint for this SYN
    fn create_endpoint(&mut self) -> Result<Box<dyn TcpEndpoint>, StackError>;

    /// Finish the handshake, or answer it with a reset
    fn complete(&mut self, send_reset: bool);
}

/// Limits applied by the stack's TCP forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderConfig {
    pub receive_buffer_size: usize,
    /// Maximum half-open connections; further SYNs are refused by the stack
    pub max_in_flight: usize,
}

pub type TcpForwarderFn = Arc<dyn Fn(Box<dyn ForwarderRequest>) + Send + Sync>;

/// Returns whether the datagram was handled
pub type UdpHandlerFn = Arc<dyn Fn(TransportEndpointId, PacketBuffer) -> bool + Send + Sync>;

/// Protocols enabled when the stack is constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOptions {
    pub network_protocols: Vec<NetworkProtocolNumber>,
    pub transport_protocols: Vec<u8>,
}

/// UDP counters kept by the stack
#[derive(Debug, Default)]
pub struct UdpStats {
    pub malformed_packets_received: AtomicU64,
}

/// Counters kept by the stack
///
/// Relaxed ordering throughout; these are statistics only.
#[derive(Debug, Default)]
pub struct StackStats {
    pub udp: UdpStats,
}

impl StackStats {
    pub fn malformed_udp(&self) -> u64 {
        self.udp.malformed_packets_received.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_malformed_udp(&self) {
        self.udp
            .malformed_packets_received
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// A user-space TCP/IP engine
pub trait NetworkStack: Send + Sync {
    fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<(), StackError>;

    /// Accept packets for any destination address
    fn set_promiscuous_mode(&self, id: NicId, enable: bool) -> Result<(), StackError>;

    /// Allow sending from addresses the NIC does not own
    fn set_spoofing(&self, id: NicId, enable: bool) -> Result<(), StackError>;

    fn add_route(&self, route: Route);

    fn set_tcp_forwarder(&self, config: ForwarderConfig, handler: TcpForwarderFn);

    fn set_udp_handler(&self, handler: UdpHandlerFn);

    /// Build and route a UDP datagram from `from` to `to`
    fn send_udp(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<usize, StackError>;

    fn stats(&self) -> &StackStats;

    fn close(&self);
}
