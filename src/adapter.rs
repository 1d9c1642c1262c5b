//! Adapter facade
//!
//! Composes the device, the link bridge and the flow adapter into one
//! object the proxy process owns for the lifetime of the tunnel.

use std::sync::{Arc, Once};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::TunConfig;
use crate::device::TunDevice;
use crate::error::{Result, TunError};
use crate::flow::FlowAdapter;
use crate::inbound::{InboundConn, InboundPacket};
use crate::network::{protocol, NetworkProtocolNumber};
use crate::stack::{NetworkStack, NicId, Route, StackOptions, Subnet};

/// The NIC every adapter installs into its stack
pub const NIC_ID: NicId = NicId(1);

/// A DNS helper whose lifetime is tied to the adapter
pub trait DnsServer: Send {
    fn stop(&mut self);
}

/// The protocols the stack is built with
pub fn stack_options() -> StackOptions {
    StackOptions {
        network_protocols: vec![NetworkProtocolNumber::IPV4, NetworkProtocolNumber::IPV6],
        transport_protocols: vec![protocol::TCP, protocol::UDP],
    }
}

/// A TUN device wired into a user-space stack
pub struct TunAdapter {
    device: Arc<TunDevice>,
    stack: Arc<dyn NetworkStack>,
    dns: Mutex<Option<Box<dyn DnsServer>>>,
    close_once: Once,
}

impl TunAdapter {
    /// Open the device and wire it into a freshly built stack
    ///
    /// `build_stack` receives the protocols to enable. On any failure the
    /// device and the stack are closed before the error is returned.
    pub fn new<F>(
        device_url: &str,
        build_stack: F,
        tcp_in: Sender<InboundConn>,
        udp_in: Sender<InboundPacket>,
        config: TunConfig,
    ) -> Result<Self>
    where
        F: FnOnce(StackOptions) -> Arc<dyn NetworkStack>,
    {
        let device = TunDevice::open_with_config(device_url, &config)?;
        Self::with_device(device, build_stack, tcp_in, udp_in, config)
    }

    /// Wire an already opened device into a freshly built stack
    pub fn with_device<F>(
        device: Arc<TunDevice>,
        build_stack: F,
        tcp_in: Sender<InboundConn>,
        udp_in: Sender<InboundPacket>,
        config: TunConfig,
    ) -> Result<Self>
    where
        F: FnOnce(StackOptions) -> Arc<dyn NetworkStack>,
    {
        let stack = build_stack(stack_options());
        if let Err(e) = wire(&device, &stack, tcp_in, udp_in, config) {
            device.close();
            stack.close();
            return Err(e);
        }

        info!("Tun adapter have interface name: {}", device.name());
        Ok(TunAdapter {
            device,
            stack,
            dns: Mutex::new(None),
            close_once: Once::new(),
        })
    }

    /// Hand a DNS helper to the adapter; it is stopped on close
    pub fn set_dns_server(&self, dns: Box<dyn DnsServer>) {
        if let Some(mut previous) = self.dns.lock().replace(dns) {
            previous.stop();
        }
    }

    pub fn device(&self) -> &Arc<TunDevice> {
        &self.device
    }

    pub fn stack(&self) -> &Arc<dyn NetworkStack> {
        &self.stack
    }

    /// The specification string the device was opened from
    pub fn device_url(&self) -> &str {
        self.device.device_url()
    }

    /// Tear down the device, the DNS helper and the stack, in that order
    ///
    /// Only the first call has any effect. Does not wait for in-flight
    /// handlers; call `wait` for that.
    pub fn close(&self) {
        self.close_once.call_once(|| {
            self.device.close();
            if let Some(mut dns) = self.dns.lock().take() {
                dns.stop();
            }
            self.stack.close();
            debug!("tun adapter for {} closed", self.device_url());
        });
    }

    /// Block until the device's read task has exited
    pub fn wait(&self) {
        self.device.wait();
    }
}

impl Drop for TunAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

fn wire(
    device: &Arc<TunDevice>,
    stack: &Arc<dyn NetworkStack>,
    tcp_in: Sender<InboundConn>,
    udp_in: Sender<InboundPacket>,
    config: TunConfig,
) -> Result<()> {
    let link = device.link_endpoint()?;
    stack
        .create_nic(NIC_ID, link)
        .map_err(|e| TunError::stack("create nic", e))?;
    stack
        .set_promiscuous_mode(NIC_ID, true)
        .map_err(|e| TunError::stack("set promiscuous mode", e))?;
    stack
        .set_spoofing(NIC_ID, true)
        .map_err(|e| TunError::stack("set spoofing", e))?;

    for destination in [Subnet::ipv4_empty(), Subnet::ipv6_empty()] {
        stack.add_route(Route {
            destination,
            gateway: None,
            nic: NIC_ID,
        });
    }

    FlowAdapter::new(tcp_in, udp_in, config).install(stack);
    Ok(())
}
