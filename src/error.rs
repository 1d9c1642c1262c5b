//! Error types for the TUN bridge
//!
//! Construction-time failures (`InvalidDeviceUrl`, `UnsupportedDeviceKind`,
//! `DeviceOpenFailed`, `Stack`) are returned to the caller. The per-flow and
//! per-frame kinds (`MalformedPacket`, `HandshakeRejected`, `ReadFailure`,
//! `WriteFailure`) are produced by the internal handlers and only logged.

use std::io;

use thiserror::Error;

use crate::stack::StackError;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, TunError>;

/// Errors raised by the device, the link bridge and the flow adapter
#[derive(Error, Debug)]
pub enum TunError {
    /// The device specification string could not be parsed
    #[error("invalid tun device url `{url}`: {reason}")]
    InvalidDeviceUrl { url: String, reason: String },

    /// Unknown scheme, or an adopted descriptor that is not a no-PI TUN device
    #[error("unsupported device kind: {0}")]
    UnsupportedDeviceKind(String),

    /// A step of opening or configuring the device failed
    #[error("can't open tun: {step}: {source}")]
    DeviceOpenFailed {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// UDP length field larger than the delivered datagram
    #[error("malformed udp packet: declared length {declared}, received {actual}")]
    MalformedPacket { declared: usize, actual: usize },

    /// The engine could not materialize a connected endpoint for a SYN
    #[error("tcp handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("can not read from tun: {0}")]
    ReadFailure(#[source] io::Error),

    #[error("can not write to tun: {0}")]
    WriteFailure(#[source] io::Error),

    /// The protocol engine refused a configuration call
    #[error("{context}: {source}")]
    Stack {
        context: &'static str,
        #[source]
        source: StackError,
    },

    /// The device has already been closed
    #[error("tun device closed")]
    Closed,
}

impl TunError {
    pub(crate) fn open_failed(step: &'static str, source: io::Error) -> Self {
        TunError::DeviceOpenFailed { step, source }
    }

    pub(crate) fn stack(context: &'static str, source: StackError) -> Self {
        TunError::Stack { context, source }
    }
}
