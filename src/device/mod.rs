//! TUN device
//!
//! This module owns the kernel side of the bridge:
//! - Parsing of `scheme://host[?mtu=N]` device specifications
//! - Opening by interface name (`dev://tun0`) or by inherited descriptor (`fd://3`)
//! - Raw frame read/write without packet information prefix
//! - MTU lookup, one-shot close and a join on the background read task

mod linux;

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};
use tun_tap::{Iface, Mode};
use url::Url;

use crate::config::TunConfig;
use crate::error::{Result, TunError};
use crate::link::{ChannelEndpoint, LinkBridge};

#[cfg(test)]
pub(crate) use linux::seqpacket_pair;

/// How long a blocked read waits before re-checking for close
const READ_POLL_INTERVAL_MS: i32 = 100;

/// Largest MTU accepted as an override; no IP frame is bigger
pub const MAX_MTU: u32 = 65535;

/// Where the device comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// `dev://<name>`: create or attach a kernel TUN interface
    Name(String),
    /// `fd://<n>`: adopt an inherited, already configured descriptor
    Fd(RawFd),
}

/// A parsed device specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    url: String,
    kind: DeviceKind,
    mtu: i32,
}

impl DeviceSpec {
    /// Parse `scheme://host[?mtu=N]`
    ///
    /// An `mtu` that does not parse as a 32-bit integer is treated as absent.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: String| TunError::InvalidDeviceUrl {
            url: spec.to_string(),
            reason,
        };

        let url = Url::parse(spec).map_err(|e| invalid(e.to_string()))?;
        let mtu = url
            .query_pairs()
            .find(|(key, _)| key == "mtu")
            .and_then(|(_, value)| value.parse::<i32>().ok())
            .unwrap_or(0);
        let host = url.host_str().unwrap_or_default();

        let kind = match url.scheme() {
            "dev" => DeviceKind::Name(host.to_string()),
            "fd" => {
                let fd = host
                    .parse::<RawFd>()
                    .map_err(|e| invalid(format!("bad descriptor `{host}`: {e}")))?;
                DeviceKind::Fd(fd)
            }
            other => {
                return Err(TunError::UnsupportedDeviceKind(format!(
                    "unsupported device type `{other}`"
                )))
            }
        };

        Ok(DeviceSpec {
            url: spec.to_string(),
            kind,
            mtu,
        })
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// The override MTU, if one in `1..=MAX_MTU` was given
    pub fn mtu_override(&self) -> Option<u32> {
        u32::try_from(self.mtu)
            .ok()
            .filter(|mtu| (1..=MAX_MTU).contains(mtu))
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

/// The open descriptor behind a device
pub(crate) enum DeviceHandle {
    Named(Iface),
    Adopted(File),
}

impl DeviceHandle {
    fn raw_fd(&self) -> RawFd {
        match self {
            DeviceHandle::Named(iface) => iface.as_raw_fd(),
            DeviceHandle::Adopted(file) => file.as_raw_fd(),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DeviceHandle::Named(iface) => iface.recv(buf),
            DeviceHandle::Adopted(file) => Read::read(&mut &*file, buf),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DeviceHandle::Named(iface) => iface.send(buf),
            DeviceHandle::Adopted(file) => Write::write(&mut &*file, buf),
        }
    }
}

/// Completion signal of the background read task
#[derive(Default)]
pub(crate) struct ReadTask {
    state: Mutex<(bool, bool)>, // (started, finished)
    finished: Condvar,
}

impl ReadTask {
    pub(crate) fn begin(&self) {
        self.state.lock().0 = true;
    }

    pub(crate) fn finish(&self) {
        self.state.lock().1 = true;
        self.finished.notify_all();
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while state.0 && !state.1 {
            self.finished.wait(&mut state);
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tun device closed")
}

/// A kernel TUN interface
pub struct TunDevice {
    spec: DeviceSpec,
    name: String,
    outbound_queue_len: usize,
    handle: RwLock<Option<DeviceHandle>>,
    closed: AtomicBool,
    close_once: Once,
    bridge: OnceCell<LinkBridge>,
    read_task: ReadTask,
}

impl TunDevice {
    /// Open a device from its specification string with default settings
    pub fn open(spec: &str) -> Result<Arc<Self>> {
        Self::open_with_config(spec, &TunConfig::default())
    }

    /// Open a device from its specification string
    ///
    /// The scheme is checked before any kernel resource is touched.
    pub fn open_with_config(spec: &str, config: &TunConfig) -> Result<Arc<Self>> {
        let spec = DeviceSpec::parse(spec)?;
        let (name, handle) = match spec.kind() {
            DeviceKind::Name(name) => open_by_name(name)?,
            DeviceKind::Fd(fd) => open_by_fd(*fd)?,
        };
        info!("tun device {} opened from {}", name, spec.as_str());
        Ok(Self::from_parts(spec, name, handle, config.outbound_queue_len))
    }

    pub(crate) fn from_parts(
        spec: DeviceSpec,
        name: String,
        handle: DeviceHandle,
        outbound_queue_len: usize,
    ) -> Arc<Self> {
        Arc::new(TunDevice {
            spec,
            name,
            outbound_queue_len,
            handle: RwLock::new(Some(handle)),
            closed: AtomicBool::new(false),
            close_once: Once::new(),
            bridge: OnceCell::new(),
            read_task: ReadTask::default(),
        })
    }

    /// Resolved interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The specification string the device was opened from
    pub fn device_url(&self) -> &str {
        self.spec.as_str()
    }

    pub(crate) fn outbound_queue_len(&self) -> usize {
        self.outbound_queue_len
    }

    pub(crate) fn read_task(&self) -> &ReadTask {
        &self.read_task
    }

    /// The override MTU when positive, otherwise the kernel's value
    pub fn mtu(&self) -> Result<u32> {
        if let Some(mtu) = self.spec.mtu_override() {
            return Ok(mtu);
        }
        linux::interface_mtu(&self.name).map_err(|e| TunError::open_failed("query mtu", e))
    }

    /// The link endpoint feeding this device into the stack
    ///
    /// The first call starts the background read task; later calls return
    /// the same endpoint. A closed device has no endpoint.
    pub fn link_endpoint(self: &Arc<Self>) -> Result<Arc<ChannelEndpoint>> {
        if self.is_closed() {
            return Err(TunError::Closed);
        }
        let bridge = self.bridge.get_or_try_init(|| LinkBridge::start(self))?;
        // A close racing with the first call may not have seen the bridge.
        if self.is_closed() {
            bridge.detach();
            return Err(TunError::Closed);
        }
        Ok(Arc::clone(bridge.endpoint()))
    }

    /// Read one frame, blocking until one arrives or the device closes
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(n) = self.read_slice(buf)? {
                return Ok(n);
            }
        }
    }

    /// Wait at most one poll interval for a frame
    ///
    /// `Ok(None)` means nothing arrived yet.
    pub(crate) fn read_slice(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or_else(closed_error)?;
        if !linux::wait_readable(handle.raw_fd(), READ_POLL_INTERVAL_MS)? {
            return Ok(None);
        }
        match handle.recv(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tun device reached end of file",
            )),
            Ok(n) => Ok(Some(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    fn raw_fd(&self) -> Option<RawFd> {
        self.handle.read().as_ref().map(DeviceHandle::raw_fd)
    }

    /// Write one frame
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or_else(closed_error)?;
        handle.send(buf)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the device down; only the first call has any effect
    pub fn close(&self) {
        self.close_once.call_once(|| {
            self.closed.store(true, Ordering::SeqCst);
            // Stop outbound writes before the descriptor goes away.
            if let Some(bridge) = self.bridge.get() {
                bridge.detach();
            }
            let handle = self.handle.write().take();
            drop(handle);
            debug!("tun device {} closed", self.name);
        });
    }

    /// Block until the background read task has exited
    ///
    /// Returns immediately if the task was never started.
    pub fn wait(&self) {
        self.read_task.wait();
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_by_name(name: &str) -> Result<(String, DeviceHandle)> {
    if name.len() >= linux::IFNAMSIZ {
        return Err(TunError::open_failed(
            "check interface name",
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name `{name}` too long"),
            ),
        ));
    }

    let iface = Iface::without_packet_info(name, Mode::Tun)
        .map_err(|e| TunError::open_failed("create interface", e))?;
    linux::set_nonblocking(iface.as_raw_fd())
        .map_err(|e| TunError::open_failed("set non-blocking", e))?;

    let resolved = iface.name().to_string();
    Ok((resolved, DeviceHandle::Named(iface)))
}

fn open_by_fd(fd: RawFd) -> Result<(String, DeviceHandle)> {
    let owned = linux::dup(fd).map_err(|e| TunError::open_failed("duplicate descriptor", e))?;

    let info = linux::tun_info(owned.as_raw_fd()).map_err(|e| {
        TunError::UnsupportedDeviceKind(format!("descriptor {fd} is not a tun device: {e}"))
    })?;
    if !info.is_tun_no_pi() {
        return Err(TunError::UnsupportedDeviceKind(
            "only tun device and no pi mode supported".to_string(),
        ));
    }

    Ok((info.name, DeviceHandle::Adopted(File::from(owned))))
}

/// A device backed by one end of a `SOCK_SEQPACKET` pair
///
/// Returns the device and the peer end that plays the kernel.
#[cfg(test)]
pub(crate) fn test_device(spec: &str) -> (Arc<TunDevice>, File) {
    let (local, peer) = seqpacket_pair();
    let spec = DeviceSpec::parse(spec).unwrap();
    let device = TunDevice::from_parts(
        spec,
        "nosuchtun9".to_string(),
        DeviceHandle::Adopted(File::from(local)),
        8,
    );
    (device, File::from(peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkProtocolNumber;
    use crate::stack::{LinkEndpoint, NetworkDispatcher, PacketBuffer};
    use std::time::{Duration, Instant};

    struct Collect(Mutex<Vec<(NetworkProtocolNumber, Vec<u8>)>>);

    impl NetworkDispatcher for Collect {
        fn deliver_network_packet(&self, protocol: NetworkProtocolNumber, pkt: PacketBuffer) {
            self.0.lock().push((protocol, pkt.data().to_vec()));
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_parse_dev_spec() {
        let spec = DeviceSpec::parse("dev://utun9?mtu=1400").unwrap();
        assert_eq!(spec.kind(), &DeviceKind::Name("utun9".to_string()));
        assert_eq!(spec.mtu_override(), Some(1400));
        assert_eq!(spec.as_str(), "dev://utun9?mtu=1400");
    }

    #[test]
    fn test_parse_fd_spec() {
        let spec = DeviceSpec::parse("fd://7").unwrap();
        assert_eq!(spec.kind(), &DeviceKind::Fd(7));
        assert_eq!(spec.mtu_override(), None);

        let bad_mtu = DeviceSpec::parse("fd://7?mtu=abc").unwrap();
        assert_eq!(bad_mtu.mtu_override(), None);
        let negative = DeviceSpec::parse("fd://7?mtu=-5").unwrap();
        assert_eq!(negative.mtu_override(), None);
    }

    #[test]
    fn test_parse_bad_fd() {
        assert!(matches!(
            DeviceSpec::parse("fd://tun0"),
            Err(TunError::InvalidDeviceUrl { .. })
        ));
        assert!(matches!(
            DeviceSpec::parse("no scheme here"),
            Err(TunError::InvalidDeviceUrl { .. })
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        for spec in ["tap://tap0", "socks5://127.0.0.1:1080", "file://tmp"] {
            match TunDevice::open(spec) {
                Err(TunError::UnsupportedDeviceKind(msg)) => assert!(msg.contains("unsupported")),
                other => panic!("unexpected result for {spec}: {:?}", other.map(|d| d.name().to_string())),
            }
        }
    }

    #[test]
    fn test_name_too_long() {
        let name = "a".repeat(linux::IFNAMSIZ);
        let err = TunDevice::open(&format!("dev://{name}")).err().unwrap();
        match err {
            TunError::DeviceOpenFailed { step, .. } => assert_eq!(step, "check interface name"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fd_that_is_not_tun() {
        let (local, _peer) = seqpacket_pair();
        let err = TunDevice::open(&format!("fd://{}", local.as_raw_fd())).err().unwrap();
        assert!(matches!(err, TunError::UnsupportedDeviceKind(_)));
    }

    #[test]
    fn test_mtu_override_skips_kernel() {
        // The interface does not exist, so a kernel query would fail.
        let (device, _peer) = test_device("fd://3?mtu=1400");
        assert_eq!(device.mtu().unwrap(), 1400);

        let (device, _peer) = test_device("fd://3");
        assert!(matches!(
            device.mtu(),
            Err(TunError::DeviceOpenFailed { step: "query mtu", .. })
        ));
    }

    #[test]
    fn test_read_write_passthrough() {
        let (device, mut peer) = test_device("fd://3?mtu=1500");
        peer.write_all(&[0x45, 1, 2, 3]).unwrap();

        let mut buf = [0u8; 64];
        let n = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x45, 1, 2, 3]);

        device.write(&[0x60, 9]).unwrap();
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x60, 9]);
        assert_eq!(device.device_url(), "fd://3?mtu=1500");
    }

    #[test]
    fn test_mtu_bounds() {
        let mtu = |spec: &str| DeviceSpec::parse(spec).unwrap().mtu_override();
        assert_eq!(mtu("fd://3?mtu=1"), Some(1));
        assert_eq!(mtu("fd://3?mtu=65535"), Some(MAX_MTU));
        assert_eq!(mtu("fd://3?mtu=65536"), None);
        assert_eq!(mtu("fd://3?mtu=0"), None);
        assert_eq!(mtu("fd://3?mtu=2147483647"), None);
        assert_eq!(mtu("fd://3?mtu=2147483648"), None);
        assert_eq!(mtu("fd://3?mtu=3000000000"), None);
        assert_eq!(mtu("fd://3?mtu=4294967295"), None);
    }

    #[test]
    fn test_out_of_range_mtu_queries_kernel() {
        let (device, _peer) = test_device("fd://3?mtu=4294967295");
        assert!(matches!(
            device.mtu(),
            Err(TunError::DeviceOpenFailed { step: "query mtu", .. })
        ));
    }

    #[test]
    fn test_close_twice() {
        let (device, _peer) = test_device("fd://3?mtu=1500");
        let fd = device.raw_fd().unwrap();
        assert!(linux::is_open(fd));
        device.close();
        assert!(!linux::is_open(fd));
        assert_eq!(device.raw_fd(), None);
        device.close();
        assert!(device.is_closed());
        assert!(device.write(&[1]).is_err());
        assert!(device.read(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_concurrent_close() {
        let (device, _peer) = test_device("fd://3?mtu=1500");
        let fd = device.raw_fd().unwrap();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let device = Arc::clone(&device);
                std::thread::spawn(move || device.close())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(device.is_closed());
        assert!(!linux::is_open(fd));
        assert_eq!(device.raw_fd(), None);
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (device, _peer) = test_device("fd://3?mtu=1500");
        let reader = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || device.read(&mut [0u8; 64]))
        };
        std::thread::sleep(Duration::from_millis(50));
        device.close();
        assert!(reader.join().unwrap().is_err());
    }

    #[test]
    fn test_link_endpoint_is_cached() {
        let (device, _peer) = test_device("fd://3?mtu=1500");
        let first = device.link_endpoint().unwrap();
        let second = device.link_endpoint().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.mtu(), 1500);
        device.close();
        device.wait();
    }

    #[test]
    fn test_closed_device_has_no_endpoint() {
        let (device, _peer) = test_device("fd://3?mtu=1500");
        device.close();
        assert!(matches!(device.link_endpoint(), Err(TunError::Closed)));
        device.wait();
    }

    #[test]
    fn test_cached_endpoint_refused_after_close() {
        let (device, _peer) = test_device("fd://3?mtu=1500");
        let endpoint = device.link_endpoint().unwrap();
        device.close();
        device.wait();
        assert!(matches!(device.link_endpoint(), Err(TunError::Closed)));

        // The bridge no longer drains frames into the closed device.
        endpoint
            .write_packet(PacketBuffer::from_payload(vec![0x45]))
            .unwrap();
        assert_eq!(endpoint.num_queued(), 1);
    }

    #[test]
    fn test_dropping_last_owner_closes_device() {
        let (device, mut peer) = test_device("fd://3?mtu=1500");
        let endpoint = device.link_endpoint().unwrap();
        let weak = Arc::downgrade(&device);
        drop(device);

        // The read thread gives up its reference within one poll interval.
        assert!(wait_until(|| weak.upgrade().is_none()));
        // The descriptor is gone, so the peer sees a hangup.
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
        // The thread has exited and released its endpoint handle.
        assert!(wait_until(|| Arc::strong_count(&endpoint) == 1));
    }

    #[test]
    fn test_link_endpoint_needs_mtu() {
        let (device, _peer) = test_device("fd://3");
        assert!(device.link_endpoint().is_err());
        // No task was started, so this must not block.
        device.wait();
    }

    #[test]
    fn test_read_loop_injects_until_error() {
        let (device, mut peer) = test_device("fd://3?mtu=1500");
        let endpoint = device.link_endpoint().unwrap();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        endpoint.attach(Some(sink.clone()));

        peer.write_all(&[0x45, 0, 0, 1]).unwrap();
        peer.write_all(&[0x60, 0, 0, 2]).unwrap();
        peer.write_all(&[0x30, 0, 0, 3]).unwrap();
        assert!(wait_until(|| sink.0.lock().len() == 3));

        // Hanging up the peer makes the next read fail.
        drop(peer);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        {
            let device = Arc::clone(&device);
            std::thread::spawn(move || {
                device.wait();
                let _ = done_tx.send(());
            });
        }
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("read task did not exit");
        assert!(device.is_closed());

        let frames = sink.0.lock();
        assert_eq!(frames[0].0, NetworkProtocolNumber::IPV4);
        assert_eq!(frames[1].0, NetworkProtocolNumber::IPV6);
        assert_eq!(frames[2].0, NetworkProtocolNumber::UNKNOWN);
        assert_eq!(frames[2].1, vec![0x30, 0, 0, 3]);
    }

    #[test]
    fn test_outbound_frames_reach_device() {
        let (device, mut peer) = test_device("fd://3?mtu=1500");
        let endpoint = device.link_endpoint().unwrap();

        endpoint
            .write_packet(PacketBuffer::from_payload(vec![0x45, 7, 7]))
            .unwrap();
        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x45, 7, 7]);
        assert_eq!(endpoint.num_queued(), 0);

        device.close();
        device.wait();
    }

    #[test]
    fn test_close_stops_outbound_writes() {
        let (device, _peer) = test_device("fd://3?mtu=1500");
        let endpoint = device.link_endpoint().unwrap();
        device.close();
        device.wait();

        endpoint
            .write_packet(PacketBuffer::from_payload(vec![0x45]))
            .unwrap();
        // Nobody drains after close.
        assert_eq!(endpoint.num_queued(), 1);
    }
}
