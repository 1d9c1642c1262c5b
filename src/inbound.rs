//! Flows handed to the proxy dispatcher
//!
//! Accepted TCP connections and received UDP datagrams are sent to the
//! proxy over two channels, each tagged with where it came from.

use std::net::SocketAddr;

use crate::flow::{ProxyAddr, TunTcpConn, TunUdpPacket};

/// Origin marker of an inbound flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Tun,
}

/// An accepted TCP connection and the destination its client dialed
#[derive(Debug)]
pub struct InboundConn {
    pub target: ProxyAddr,
    pub conn: TunTcpConn,
    pub kind: ConnKind,
}

impl InboundConn {
    pub fn new(target: ProxyAddr, conn: TunTcpConn) -> Self {
        InboundConn {
            target,
            conn,
            kind: ConnKind::Tun,
        }
    }
}

/// One UDP datagram and the destination it was sent to
#[derive(Debug)]
pub struct InboundPacket {
    pub target: ProxyAddr,
    pub udp_addr: SocketAddr,
    pub packet: TunUdpPacket,
    pub kind: ConnKind,
}

impl InboundPacket {
    pub fn new(target: ProxyAddr, packet: TunUdpPacket) -> Self {
        InboundPacket {
            udp_addr: target.to_socket_addr(),
            target,
            packet,
            kind: ConnKind::Tun,
        }
    }
}
