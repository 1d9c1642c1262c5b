//! Flow adapter
//!
//! Turns stack-level events into proxy-level flows:
//! - TCP: each inbound SYN is accepted and forwarded as an `InboundConn`
//! - UDP: each inbound datagram is forwarded as an `InboundPacket`
//! - Addresses: flow identifiers become `ProxyAddr` destinations
//!
//! Handlers keep all per-flow state local to one invocation; the only shared
//! state is the consumer channels, which synchronize themselves.

pub mod addr;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tracing::debug;

use crate::config::{Handoff, TunConfig};
use crate::inbound::{InboundConn, InboundPacket};
use crate::stack::NetworkStack;

// Re-export commonly used items
pub use addr::{ProxyAddr, ATYP_IPV4, ATYP_IPV6};
pub use tcp::TunTcpConn;
pub use udp::TunUdpPacket;

/// Registers the TCP and UDP handlers on a stack
pub struct FlowAdapter {
    tcp_in: Sender<InboundConn>,
    udp_in: Sender<InboundPacket>,
    config: TunConfig,
}

impl FlowAdapter {
    pub fn new(tcp_in: Sender<InboundConn>, udp_in: Sender<InboundPacket>, config: TunConfig) -> Self {
        FlowAdapter {
            tcp_in,
            udp_in,
            config,
        }
    }

    /// Install the TCP forwarder and the UDP handler
    ///
    /// With `Handoff::Block`, a saturated consumer stalls the stack's
    /// dispatch path until it catches up.
    pub fn install(self, stack: &Arc<dyn NetworkStack>) {
        let handoff = self.config.handoff;
        stack.set_tcp_forwarder(
            self.config.forwarder(),
            tcp::forwarder(self.tcp_in, handoff),
        );
        stack.set_udp_handler(udp::udp_handler(Arc::downgrade(stack), self.udp_in, handoff));
    }
}

/// Send a flow to its consumer according to the handoff policy
///
/// Returns whether the consumer received it.
pub(crate) fn hand_off<T>(tx: &Sender<T>, item: T, policy: Handoff, what: &str) -> bool {
    match policy {
        Handoff::Block => {
            if tx.send(item).is_err() {
                debug!("{} consumer is gone, dropping", what);
                return false;
            }
            true
        }
        Handoff::DropNewest => match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("{} consumer is saturated, dropping", what);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("{} consumer is gone, dropping", what);
                false
            }
        },
    }
}
