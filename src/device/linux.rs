//! Linux control calls for TUN descriptors
//!
//! Thin wrappers over `ioctl`, `fcntl` and `poll`. Every descriptor opened
//! here is returned as an `OwnedFd` so it is closed on all error paths.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub(crate) const IFNAMSIZ: usize = libc::IFNAMSIZ;

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[cfg(any(
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc64"
))]
const TUNGETIFF: libc::c_ulong = 0x4004_54d2;
#[cfg(not(any(
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc64"
)))]
const TUNGETIFF: libc::c_ulong = 0x8004_54d2;

/// `struct ifreq` as used by TUNGETIFF
#[repr(C)]
struct IfReqFlags {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// `struct ifreq` as used by SIOCGIFMTU
#[repr(C)]
struct IfReqMtu {
    name: [u8; IFNAMSIZ],
    mtu: libc::c_int,
    _pad: [u8; 20],
}

/// Interface name and flags of a TUN descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TunInfo {
    pub name: String,
    flags: libc::c_short,
}

impl TunInfo {
    /// A layer 3 device without the 4-byte packet information prefix
    pub fn is_tun_no_pi(&self) -> bool {
        self.flags & IFF_TUN != 0 && self.flags & IFF_NO_PI != 0
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn name_from_bytes(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Duplicate a descriptor with close-on-exec set
pub(crate) fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    let new_fd = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })?;
    // SAFETY: fcntl just returned a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Query a descriptor with TUNGETIFF
pub(crate) fn tun_info(fd: RawFd) -> io::Result<TunInfo> {
    let mut ifr = IfReqFlags {
        name: [0; IFNAMSIZ],
        flags: 0,
        _pad: [0; 22],
    };
    cvt(unsafe { libc::ioctl(fd, TUNGETIFF as _, &mut ifr as *mut IfReqFlags) })?;
    Ok(TunInfo {
        name: name_from_bytes(&ifr.name),
        flags: ifr.flags,
    })
}

/// Query the configured MTU of an interface with SIOCGIFMTU
pub(crate) fn interface_mtu(name: &str) -> io::Result<u32> {
    let bytes = name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    let sock = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) })?;
    // SAFETY: socket just returned a fresh descriptor we own.
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };

    let mut ifr = IfReqMtu {
        name: [0; IFNAMSIZ],
        mtu: 0,
        _pad: [0; 20],
    };
    ifr.name[..bytes.len()].copy_from_slice(bytes);

    cvt(unsafe {
        libc::ioctl(
            sock.as_raw_fd(),
            libc::SIOCGIFMTU as _,
            &mut ifr as *mut IfReqMtu,
        )
    })?;
    Ok(ifr.mtu as u32)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

/// Wait up to `timeout_ms` for `fd` to become readable
///
/// Returns `true` when a read will not block (data, hangup or error).
pub(crate) fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    match unsafe { libc::poll(&mut pfd, 1, timeout_ms) } {
        -1 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

#[cfg(test)]
pub(crate) fn is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// A connected `SOCK_SEQPACKET` pair; keeps frame boundaries like a TUN fd
#[cfg(test)]
pub(crate) fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(ret, 0, "socketpair: {}", io::Error::last_os_error());
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}
