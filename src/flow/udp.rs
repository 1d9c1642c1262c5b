//! UDP datagram forwarding
//!
//! No per-flow state is kept. Each datagram carries a reference to the
//! stack that delivered it, which is enough to address a reply.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::debug;

use super::addr::ProxyAddr;
use super::hand_off;
use crate::config::Handoff;
use crate::error::{Result, TunError};
use crate::inbound::InboundPacket;
use crate::stack::{NetworkStack, PacketBuffer, StackError, TransportEndpointId, UdpHandlerFn};
use crate::transport::UdpHeader;

/// One datagram received from the tunnel
pub struct TunUdpPacket {
    id: TransportEndpointId,
    payload: Bytes,
    stack: Arc<dyn NetworkStack>,
}

impl TunUdpPacket {
    pub(crate) fn new(id: TransportEndpointId, payload: Bytes, stack: Arc<dyn NetworkStack>) -> Self {
        TunUdpPacket { id, payload, stack }
    }

    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// The tunnel-side client that sent the datagram
    pub fn local_addr(&self) -> SocketAddr {
        self.id.remote()
    }

    /// The address the datagram was sent to
    pub fn destination(&self) -> SocketAddr {
        self.id.local()
    }

    /// Send a reply to the client
    ///
    /// The reply is sourced from `from`, or from the original destination
    /// when `None`.
    pub fn write_back(&self, payload: &[u8], from: Option<SocketAddr>) -> std::result::Result<usize, StackError> {
        let from = from.unwrap_or_else(|| self.id.local());
        self.stack.send_udp(from, self.id.remote(), payload)
    }

    /// Release the payload
    pub fn drop_packet(self) {}
}

impl fmt::Debug for TunUdpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunUdpPacket")
            .field("local", &self.id.remote())
            .field("destination", &self.id.local())
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Validate one datagram and hand it to the proxy
///
/// A datagram whose header is missing or declares more bytes than were
/// delivered is counted as malformed and not forwarded.
pub(crate) fn handle_datagram(
    stack: &Arc<dyn NetworkStack>,
    id: TransportEndpointId,
    pkt: PacketBuffer,
    udp_in: &Sender<InboundPacket>,
    handoff: Handoff,
) -> Result<()> {
    let actual = pkt.data().len();
    let header = match UdpHeader::from_bytes(pkt.transport_header()) {
        Some(header) if header.fits_payload(actual) => header,
        other => {
            stack.stats().increment_malformed_udp();
            return Err(TunError::MalformedPacket {
                declared: other.map_or(0, |h| h.length as usize),
                actual: actual + pkt.transport_header().len(),
            });
        }
    };

    debug!(
        "get udp packet {} -> {} ({} bytes, header length {})",
        id.remote(),
        id.local(),
        actual,
        header.length
    );
    let target = ProxyAddr::from_endpoint_id(&id);
    let packet = TunUdpPacket::new(id, pkt.data().clone(), Arc::clone(stack));
    hand_off(udp_in, InboundPacket::new(target, packet), handoff, "udp");
    Ok(())
}

/// The UDP handler registered with the stack
///
/// Holds the stack weakly; the stack owns the handler.
pub(crate) fn udp_handler(
    stack: Weak<dyn NetworkStack>,
    udp_in: Sender<InboundPacket>,
    handoff: Handoff,
) -> UdpHandlerFn {
    Arc::new(move |id, pkt| {
        let Some(stack) = stack.upgrade() else {
            return true;
        };
        if let Err(e) = handle_datagram(&stack, id, pkt, &udp_in, handoff) {
            debug!("{}", e);
        }
        true
    })
}
