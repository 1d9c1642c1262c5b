//! Link layer between the TUN device and the stack
//!
//! This module provides:
//! - `ChannelEndpoint`: the NIC link the stack reads from and writes to
//! - `LinkBridge`: the pump moving frames between the device and that link

mod bridge;
pub mod channel;

// Re-export commonly used items
pub(crate) use bridge::LinkBridge;
pub use channel::{ChannelEndpoint, Notification, NotificationHandle};
