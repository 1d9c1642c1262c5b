//! Frame pump between a `TunDevice` and its `ChannelEndpoint`
//!
//! Inbound: a dedicated thread reads MTU-sized frames from the device and
//! injects them while the endpoint is attached. Frames seen while detached
//! are dropped, never buffered. The thread holds the device weakly and exits
//! once the last owner drops it.
//!
//! Outbound: every queued frame triggers one `write_notify`, which drains
//! exactly one frame and writes it to the device. A failed write is logged
//! and the frame is dropped.

use std::sync::{Arc, Weak};
use std::thread;

use bytes::Bytes;
use tracing::{debug, error, trace};

use super::channel::{ChannelEndpoint, Notification, NotificationHandle};
use crate::device::TunDevice;
use crate::error::{Result, TunError};
use crate::network::NetworkProtocolNumber;
use crate::stack::{LinkEndpoint, PacketBuffer};

/// The running pump of one device
///
/// Built once by `TunDevice::link_endpoint` and cached there.
pub(crate) struct LinkBridge {
    endpoint: Arc<ChannelEndpoint>,
    notify: NotificationHandle,
}

impl LinkBridge {
    /// Create the endpoint, hook up outbound writes and start the read thread
    pub(crate) fn start(device: &Arc<TunDevice>) -> Result<Self> {
        let mtu = device.mtu()?;
        let endpoint = ChannelEndpoint::new(device.outbound_queue_len(), mtu);

        let writer = Arc::new(DeviceWriter {
            device: Arc::downgrade(device),
            endpoint: Arc::downgrade(&endpoint),
        });
        let notify = endpoint.add_notify(writer);

        device.read_task().begin();
        let spawned = thread::Builder::new()
            .name(format!("tun-read-{}", device.name()))
            .spawn({
                let name = device.name().to_string();
                let device = Arc::downgrade(device);
                let endpoint = Arc::clone(&endpoint);
                move || read_loop(device, name, endpoint, mtu as usize)
            });
        if let Err(e) = spawned {
            endpoint.remove_notify(notify);
            device.read_task().finish();
            return Err(TunError::open_failed("spawn read loop", e));
        }

        Ok(LinkBridge { endpoint, notify })
    }

    pub(crate) fn endpoint(&self) -> &Arc<ChannelEndpoint> {
        &self.endpoint
    }

    /// Stop receiving write notifications and release queued frames
    pub(crate) fn detach(&self) {
        self.endpoint.remove_notify(self.notify);
        let dropped = self.endpoint.drain();
        if dropped > 0 {
            debug!("dropped {} queued outbound frames", dropped);
        }
    }
}

fn read_loop(device: Weak<TunDevice>, name: String, endpoint: Arc<ChannelEndpoint>, mtu: usize) {
    let mut buf = vec![0u8; mtu];
    loop {
        // Only hold the device for one poll interval at a time.
        let Some(dev) = device.upgrade() else {
            debug!("{} dropped, stop read loop", name);
            return;
        };
        let n = match dev.read_slice(&mut buf) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(e) => {
                if !dev.is_closed() {
                    error!("{}", TunError::ReadFailure(e));
                }
                dev.close();
                dev.read_task().finish();
                debug!("{} stop read loop", name);
                return;
            }
        };

        let frame = &buf[..n];
        if endpoint.is_attached() {
            let protocol = NetworkProtocolNumber::from_frame(frame);
            if !protocol.is_known() {
                trace!("{} passing frame with unknown ip version to the stack", name);
            }
            endpoint.inject_inbound(protocol, PacketBuffer::from_payload(Bytes::copy_from_slice(frame)));
        } else {
            debug!(
                "received packet from tun when {} is not attached to any dispatcher",
                name
            );
        }
    }
}

/// Writes one queued frame to the device per notification
struct DeviceWriter {
    device: Weak<TunDevice>,
    endpoint: Weak<ChannelEndpoint>,
}

impl Notification for DeviceWriter {
    fn write_notify(&self) {
        let (Some(device), Some(endpoint)) = (self.device.upgrade(), self.endpoint.upgrade()) else {
            return;
        };
        let Some(pkt) = endpoint.read() else {
            return;
        };

        let frame = pkt.to_bytes();
        if let Err(e) = device.write(&frame) {
            if !device.is_closed() {
                error!("{}", TunError::WriteFailure(e));
            }
        }
    }
}
