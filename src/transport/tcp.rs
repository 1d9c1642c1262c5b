//! TCP endpoint state
//!
//! The stack owns the TCP state machine; the bridge only reads the state of
//! an accepted endpoint to decide whether it is usable and to log it.

use std::fmt;

/// TCP connection states as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
    /// Endpoint exists but never reached the handshake (e.g. reset in flight)
    Initial,
    /// Endpoint hit an error and is unusable
    Error,
}

impl TcpState {
    /// Check if connection is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, TcpState::Closed | TcpState::Error)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN-SENT",
            TcpState::SynRcvd => "SYN-RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN-WAIT1",
            TcpState::FinWait2 => "FIN-WAIT2",
            TcpState::CloseWait => "CLOSE-WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST-ACK",
            TcpState::TimeWait => "TIME-WAIT",
            TcpState::Closed => "CLOSED",
            TcpState::Initial => "INITIAL",
            TcpState::Error => "ERROR",
        };
        f.write_str(name)
    }
}
