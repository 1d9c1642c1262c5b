//! Channel link endpoint
//!
//! An in-memory NIC link: inbound frames are injected straight into the
//! attached dispatcher, outbound frames produced by the stack land in a
//! bounded queue and every registered `Notification` is told about them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::network::NetworkProtocolNumber;
use crate::stack::{LinkEndpoint, NetworkDispatcher, PacketBuffer, StackError};

/// Called each time the stack queues an outbound frame
pub trait Notification: Send + Sync {
    fn write_notify(&self);
}

/// Registration token returned by `ChannelEndpoint::add_notify`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle(u64);

/// Link endpoint backed by a bounded outbound queue
pub struct ChannelEndpoint {
    mtu: u32,
    capacity: usize,
    outbound: Mutex<VecDeque<PacketBuffer>>,
    dispatcher: RwLock<Option<Arc<dyn NetworkDispatcher>>>,
    notifiers: Mutex<Vec<(NotificationHandle, Arc<dyn Notification>)>>,
    next_handle: AtomicU64,
}

impl ChannelEndpoint {
    /// Create an endpoint holding at most `capacity` outbound frames
    pub fn new(capacity: usize, mtu: u32) -> Arc<Self> {
        Arc::new(ChannelEndpoint {
            mtu,
            capacity,
            outbound: Mutex::new(VecDeque::with_capacity(capacity)),
            dispatcher: RwLock::new(None),
            notifiers: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Hand an inbound frame to the attached dispatcher
    ///
    /// Frames injected while detached are dropped; returns whether the frame
    /// was delivered.
    pub fn inject_inbound(&self, protocol: NetworkProtocolNumber, pkt: PacketBuffer) -> bool {
        let dispatcher = self.dispatcher.read().clone();
        match dispatcher {
            Some(dispatcher) => {
                dispatcher.deliver_network_packet(protocol, pkt);
                true
            }
            None => false,
        }
    }

    /// Take the oldest outbound frame
    pub fn read(&self) -> Option<PacketBuffer> {
        self.outbound.lock().pop_front()
    }

    /// Number of outbound frames waiting
    pub fn num_queued(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Discard every queued outbound frame
    pub fn drain(&self) -> usize {
        let mut queue = self.outbound.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn add_notify(&self, notify: Arc<dyn Notification>) -> NotificationHandle {
        let handle = NotificationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.notifiers.lock().push((handle, notify));
        handle
    }

    pub fn remove_notify(&self, handle: NotificationHandle) {
        self.notifiers.lock().retain(|(h, _)| *h != handle);
    }

    fn notify_all(&self) {
        // Notifiers write to the device; never call them under our locks.
        let notifiers: Vec<Arc<dyn Notification>> = self
            .notifiers
            .lock()
            .iter()
            .map(|(_, n)| Arc::clone(n))
            .collect();
        for notify in notifiers {
            notify.write_notify();
        }
    }
}

impl LinkEndpoint for ChannelEndpoint {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        *self.dispatcher.write() = dispatcher;
    }

    fn is_attached(&self) -> bool {
        self.dispatcher.read().is_some()
    }

    fn write_packet(&self, pkt: PacketBuffer) -> Result<(), StackError> {
        {
            let mut queue = self.outbound.lock();
            if queue.len() >= self.capacity {
                trace!("outbound queue full, dropping {} byte frame", pkt.size());
                return Err(StackError::QueueFull);
            }
            queue.push_back(pkt);
        }
        self.notify_all();
        Ok(())
    }
}
