//! TCP acceptance
//!
//! Each SYN the stack forwards becomes one `TunTcpConn`. The handshake is
//! completed before the connection is handed to the proxy, so the proxy
//! only ever sees connected endpoints.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use super::addr::ProxyAddr;
use super::hand_off;
use crate::config::Handoff;
use crate::error::{Result, TunError};
use crate::inbound::InboundConn;
use crate::stack::{ForwarderRequest, TcpEndpoint, TcpForwarderFn, TransportEndpointId};
use crate::transport::TcpState;

/// An accepted TCP connection from the tunnel
///
/// Bytes read are what the client sent; bytes written go back to it.
pub struct TunTcpConn {
    endpoint: Box<dyn TcpEndpoint>,
    closed: bool,
}

impl TunTcpConn {
    pub(crate) fn new(endpoint: Box<dyn TcpEndpoint>) -> Self {
        TunTcpConn {
            endpoint,
            closed: false,
        }
    }

    /// Flow identifier of the connection
    pub fn info(&self) -> TransportEndpointId {
        self.endpoint.info()
    }

    /// The destination the client dialed
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.info().local()
    }

    /// The client; `None` once the endpoint is no longer connected
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.endpoint.remote_addr()
    }

    pub fn state(&self) -> TcpState {
        self.endpoint.state()
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.endpoint.close();
        }
    }
}

impl Read for TunTcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.endpoint.read(buf)
    }
}

impl Write for TunTcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.endpoint.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.endpoint.flush()
    }
}

impl fmt::Debug for TunTcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.endpoint.info();
        f.debug_struct("TunTcpConn")
            .field("local", &id.local())
            .field("remote", &id.remote())
            .field("state", &self.endpoint.state())
            .finish()
    }
}

impl Drop for TunTcpConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accept one SYN and hand the connection to the proxy
///
/// Endpoint creation failure answers the SYN with a reset.
pub(crate) fn handle_request(
    mut req: Box<dyn ForwarderRequest>,
    tcp_in: &Sender<InboundConn>,
    handoff: Handoff,
) -> Result<()> {
    let id = req.id();
    debug!("get tcp syn {} -> {} in ipstack", id.remote(), id.local());

    let endpoint = match req.create_endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            req.complete(true);
            return Err(TunError::HandshakeRejected(format!(
                "can't create tcp endpoint for {} -> {}: {}",
                id.remote(),
                id.local(),
                e
            )));
        }
    };
    req.complete(false);

    let mut conn = TunTcpConn::new(endpoint);
    if conn.remote_addr().is_none() || conn.state().is_closed() {
        let state = conn.state();
        conn.close();
        return Err(TunError::HandshakeRejected(format!(
            "tcp endpoint for {} is not connected, current state: {}",
            id.local(),
            state
        )));
    }

    let target = ProxyAddr::from_endpoint_id(&conn.info());
    hand_off(tcp_in, InboundConn::new(target, conn), handoff, "tcp");
    Ok(())
}

/// The forwarder callback registered with the stack
pub(crate) fn forwarder(tcp_in: Sender<InboundConn>, handoff: Handoff) -> TcpForwarderFn {
    Arc::new(move |req| {
        if let Err(e) = handle_request(req, &tcp_in, handoff) {
            warn!("{}", e);
        }
    })
}
