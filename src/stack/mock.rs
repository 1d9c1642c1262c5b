//! In-memory stack used by tests
//!
//! Records every call the adapter makes and lets a test drive the
//! registered TCP forwarder and UDP handler directly.

use std::io::{self, Cursor, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::*;

#[derive(Default)]
pub(crate) struct Recorder {
    pub frames: Mutex<Vec<(NetworkProtocolNumber, Vec<u8>)>>,
}

impl NetworkDispatcher for Recorder {
    fn deliver_network_packet(&self, protocol: NetworkProtocolNumber, pkt: PacketBuffer) {
        self.frames.lock().push((protocol, pkt.to_bytes().to_vec()));
    }
}

#[derive(Default)]
pub(crate) struct MockStack {
    pub nics: Mutex<Vec<(NicId, Arc<dyn LinkEndpoint>)>>,
    pub promiscuous: Mutex<Vec<(NicId, bool)>>,
    pub spoofing: Mutex<Vec<(NicId, bool)>>,
    pub routes: Mutex<Vec<Route>>,
    pub forwarder_config: Mutex<Option<ForwarderConfig>>,
    forwarder: Mutex<Option<TcpForwarderFn>>,
    udp_handler: Mutex<Option<UdpHandlerFn>>,
    pub sent: Mutex<Vec<(SocketAddr, SocketAddr, Vec<u8>)>>,
    pub recorder: Arc<Recorder>,
    pub fail_nic: bool,
    pub closed: AtomicBool,
    stats: StackStats,
}

impl MockStack {
    pub fn new() -> Arc<Self> {
        Arc::new(MockStack::default())
    }

    /// A stack whose NIC creation always fails
    pub fn failing_nic() -> Arc<Self> {
        Arc::new(MockStack {
            fail_nic: true,
            ..MockStack::default()
        })
    }

    /// Deliver a SYN to the registered forwarder
    pub fn syn(&self, req: MockRequest) {
        let forwarder = self.forwarder.lock().clone();
        if let Some(forwarder) = forwarder {
            forwarder(Box::new(req));
        }
    }

    /// Deliver a datagram to the registered UDP handler
    pub fn datagram(&self, id: TransportEndpointId, pkt: PacketBuffer) -> Option<bool> {
        let handler = self.udp_handler.lock().clone();
        handler.map(|handler| handler(id, pkt))
    }

    pub fn has_handlers(&self) -> bool {
        self.forwarder.lock().is_some() && self.udp_handler.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NetworkStack for MockStack {
    fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<(), StackError> {
        if self.fail_nic {
            return Err(StackError::DuplicateNicId(id.0));
        }
        link.attach(Some(self.recorder.clone()));
        self.nics.lock().push((id, link));
        Ok(())
    }

    fn set_promiscuous_mode(&self, id: NicId, enable: bool) -> Result<(), StackError> {
        self.promiscuous.lock().push((id, enable));
        Ok(())
    }

    fn set_spoofing(&self, id: NicId, enable: bool) -> Result<(), StackError> {
        self.spoofing.lock().push((id, enable));
        Ok(())
    }

    fn add_route(&self, route: Route) {
        self.routes.lock().push(route);
    }

    fn set_tcp_forwarder(&self, config: ForwarderConfig, handler: TcpForwarderFn) {
        *self.forwarder_config.lock() = Some(config);
        *self.forwarder.lock() = Some(handler);
    }

    fn set_udp_handler(&self, handler: UdpHandlerFn) {
        *self.udp_handler.lock() = Some(handler);
    }

    fn send_udp(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<usize, StackError> {
        if self.is_closed() {
            return Err(StackError::Closed);
        }
        self.sent.lock().push((from, to, payload.to_vec()));
        Ok(payload.len())
    }

    fn stats(&self) -> &StackStats {
        &self.stats
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some((_, link)) = self.nics.lock().first() {
            link.attach(None);
        }
    }
}

/// Accepted endpoint backed by in-memory buffers
pub(crate) struct MockEndpoint {
    pub id: TransportEndpointId,
    pub connected: bool,
    pub closed: Arc<AtomicBool>,
    pub written: Arc<Mutex<Vec<u8>>>,
    rx: Cursor<Vec<u8>>,
}

impl MockEndpoint {
    pub fn new(id: TransportEndpointId, incoming: Vec<u8>) -> Self {
        MockEndpoint {
            id,
            connected: true,
            closed: Arc::new(AtomicBool::new(false)),
            written: Arc::new(Mutex::new(Vec::new())),
            rx: Cursor::new(incoming),
        }
    }
}

impl Read for MockEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

impl Write for MockEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TcpEndpoint for MockEndpoint {
    fn info(&self) -> TransportEndpointId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.connected.then(|| self.id.remote())
    }

    fn state(&self) -> TcpState {
        if self.closed.load(Ordering::SeqCst) {
            TcpState::Closed
        } else if self.connected {
            TcpState::Established
        } else {
            TcpState::SynRcvd
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A pending SYN; `endpoint: None` makes endpoint creation fail
pub(crate) struct MockRequest {
    pub id: TransportEndpointId,
    pub endpoint: Option<MockEndpoint>,
    pub completions: Arc<Mutex<Vec<bool>>>,
}

impl MockRequest {
    pub fn new(id: TransportEndpointId, endpoint: Option<MockEndpoint>) -> Self {
        MockRequest {
            id,
            endpoint,
            completions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ForwarderRequest for MockRequest {
    fn id(&self) -> TransportEndpointId {
        self.id
    }

    fn create_endpoint(&mut self) -> Result<Box<dyn TcpEndpoint>, StackError> {
        match self.endpoint.take() {
            Some(ep) => Ok(Box::new(ep)),
            None => Err(StackError::EndpointCreation("connection refused".into())),
        }
    }

    fn complete(&mut self, send_reset: bool) {
        self.completions.lock().push(send_reset);
    }
}

pub(crate) fn flow_id(local: &str, remote: &str) -> TransportEndpointId {
    let local: SocketAddr = local.parse().unwrap();
    let remote: SocketAddr = remote.parse().unwrap();
    TransportEndpointId {
        local_address: local.ip(),
        local_port: local.port(),
        remote_address: remote.ip(),
        remote_port: remote.port(),
    }
}
