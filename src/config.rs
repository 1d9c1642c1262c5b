//! Adapter configuration
//!
//! Defaults match what the adapter uses when no configuration is given:
//! 20 KiB TCP receive buffers, at most 1024 half-open TCP handshakes and a
//! 512-frame outbound queue.

use serde::Deserialize;

use crate::stack::ForwarderConfig;

pub const DEFAULT_TCP_RECEIVE_BUFFER: usize = 20 * 1024;
pub const DEFAULT_TCP_MAX_IN_FLIGHT: usize = 1024;
pub const DEFAULT_OUTBOUND_QUEUE_LEN: usize = 512;

/// What to do when a consumer channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handoff {
    /// Wait for the consumer. Stalls the stack's dispatch path while the
    /// consumer is saturated.
    #[default]
    Block,
    /// Drop the new flow or datagram instead of waiting
    DropNewest,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TunConfig {
    pub tcp_receive_buffer: usize,
    pub tcp_max_in_flight: usize,
    pub outbound_queue_len: usize,
    pub handoff: Handoff,
}

impl Default for TunConfig {
    fn default() -> Self {
        TunConfig {
            tcp_receive_buffer: DEFAULT_TCP_RECEIVE_BUFFER,
            tcp_max_in_flight: DEFAULT_TCP_MAX_IN_FLIGHT,
            outbound_queue_len: DEFAULT_OUTBOUND_QUEUE_LEN,
            handoff: Handoff::Block,
        }
    }
}

impl TunConfig {
    pub fn forwarder(&self) -> ForwarderConfig {
        ForwarderConfig {
            receive_buffer_size: self.tcp_receive_buffer,
            max_in_flight: self.tcp_max_in_flight,
        }
    }
}
