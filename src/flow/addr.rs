//! Proxy address encoding
//!
//! Destinations are handed to the proxy in SOCKS5 address form:
//! one type byte, the raw address bytes, then the port in network order.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};

use crate::stack::TransportEndpointId;

/// Address type byte for a 4-byte IPv4 address
pub const ATYP_IPV4: u8 = 0x01;
/// Address type byte for a 16-byte IPv6 address
pub const ATYP_IPV6: u8 = 0x04;

/// Destination of a flow in the proxy's binary address format
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddr(Vec<u8>);

impl ProxyAddr {
    /// Encode an address and port
    pub fn new(addr: IpAddr, port: u16) -> Self {
        let mut buf = match addr {
            IpAddr::V4(v4) => {
                let mut buf = Vec::with_capacity(1 + 4 + 2);
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&v4.octets());
                buf
            }
            IpAddr::V6(v6) => {
                let mut buf = Vec::with_capacity(1 + 16 + 2);
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&v6.octets());
                buf
            }
        };
        let mut port_bytes = [0u8; 2];
        BigEndian::write_u16(&mut port_bytes, port);
        buf.extend_from_slice(&port_bytes);
        ProxyAddr(buf)
    }

    /// The address the tunnel client was dialing
    pub fn from_endpoint_id(id: &TransportEndpointId) -> Self {
        Self::new(id.local_address, id.local_port)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode back into a socket address
    pub fn to_socket_addr(&self) -> SocketAddr {
        let port_at = self.0.len() - 2;
        let port = BigEndian::read_u16(&self.0[port_at..]);
        let ip = match self.0[0] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.0[1..5]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            _ => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.0[1..17]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        SocketAddr::new(ip, port)
    }
}

impl From<SocketAddr> for ProxyAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl AsRef<[u8]> for ProxyAddr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl fmt::Debug for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyAddr({})", self.to_socket_addr())
    }
}
