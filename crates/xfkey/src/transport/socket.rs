//! Blocking kernel sockets.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};

use super::{Connector, Protocol, Transport};
use crate::error::{Error, Result};
use crate::wire::NLMSG_HDRLEN;

/// PF_KEY protocol version passed to socket(2).
const PF_KEY_V2: libc::c_int = 2;

/// Size of `struct sadb_msg`.
const SADB_MSG_SIZE: usize = 16;

/// Wait until `fd` is readable. `Ok(false)` on timeout or EINTR.
fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as libc::c_int);
    // SAFETY: pfd is a valid pollfd for the duration of the call.
    let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::transport("poll", err));
    }
    Ok(ret > 0)
}

/// Make sure the descriptor is not inherited across exec.
fn ensure_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::transport("fcntl(F_GETFD)", io::Error::last_os_error()));
    }
    if flags & libc::FD_CLOEXEC == 0 {
        // SAFETY: as above.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        if ret < 0 {
            return Err(Error::transport("fcntl(F_SETFD)", io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// NETLINK_XFRM socket.
pub struct NetlinkSocket {
    socket: Socket,
    pid: u32,
    buffer_size: usize,
}

impl NetlinkSocket {
    /// Open and bind a socket subscribed to the `groups` bitmask.
    pub fn open(groups: u32, buffer_size: usize) -> Result<Self> {
        let mut socket = Socket::new(protocols::NETLINK_XFRM)
            .map_err(|e| Error::transport("socket(NETLINK_XFRM)", e))?;
        ensure_cloexec(socket.as_raw_fd())?;

        let mut addr = SocketAddr::new(0, groups);
        socket
            .bind(&addr)
            .map_err(|e| Error::transport("bind", e))?;
        socket
            .get_address(&mut addr)
            .map_err(|e| Error::transport("getsockname", e))?;
        let pid = addr.port_number();

        tracing::debug!(pid, groups, "opened xfrm socket");
        Ok(Self {
            socket,
            pid,
            buffer_size,
        })
    }
}

impl Transport for NetlinkSocket {
    fn send(&mut self, msg: &[u8]) -> Result<()> {
        loop {
            match self.socket.send(msg, 0) {
                Ok(n) if n == msg.len() => return Ok(()),
                Ok(n) => {
                    return Err(Error::PartialWrite {
                        written: n,
                        expected: msg.len(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport("send", e)),
            }
        }
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        if !wait_readable(self.socket.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        let mut buf = BytesMut::with_capacity(self.buffer_size);
        let (n, from) = match self.socket.recv_from(&mut buf, 0) {
            Ok(r) => r,
            Err(e) if is_transient(&e) => return Ok(None),
            Err(e) => return Err(Error::transport("recv", e)),
        };
        if from.port_number() != 0 {
            tracing::warn!(pid = from.port_number(), "dropping netlink message not sent by kernel");
            return Ok(None);
        }
        if n < NLMSG_HDRLEN {
            tracing::warn!(len = n, "dropping short netlink message");
            return Ok(None);
        }
        Ok(Some(buf.to_vec()))
    }

    fn port_id(&self) -> u32 {
        self.pid
    }
}

/// PF_KEY v2 socket.
pub struct PfkeySocket {
    fd: OwnedFd,
    pid: u32,
    buffer_size: usize,
}

impl PfkeySocket {
    /// Open a raw PF_KEY v2 socket.
    pub fn open(buffer_size: usize) -> Result<Self> {
        // SAFETY: socket(2) with constant arguments.
        let fd = unsafe { libc::socket(libc::PF_KEY, libc::SOCK_RAW | libc::SOCK_CLOEXEC, PF_KEY_V2) };
        if fd < 0 {
            return Err(Error::transport("socket(PF_KEY)", io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        ensure_cloexec(fd.as_raw_fd())?;

        Ok(Self {
            fd,
            pid: std::process::id(),
            buffer_size,
        })
    }
}

impl Transport for PfkeySocket {
    fn send(&mut self, msg: &[u8]) -> Result<()> {
        loop {
            // SAFETY: msg is a valid buffer of msg.len() bytes.
            let ret = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    msg.as_ptr() as *const libc::c_void,
                    msg.len(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::transport("write", err));
            }
            let written = ret as usize;
            if written != msg.len() {
                return Err(Error::PartialWrite {
                    written,
                    expected: msg.len(),
                });
            }
            return Ok(());
        }
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        if !wait_readable(self.fd.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.buffer_size];
        // SAFETY: buf is a writable buffer of buf.len() bytes.
        let ret = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                return Ok(None);
            }
            return Err(Error::transport("recv", err));
        }
        let n = ret as usize;
        if n < SADB_MSG_SIZE {
            tracing::warn!(len = n, "dropping short PF_KEY message");
            return Ok(None);
        }
        // sadb_msg_len counts 64-bit words.
        let declared = u16::from_ne_bytes([buf[4], buf[5]]) as usize * 8;
        if declared != n {
            tracing::warn!(len = n, declared, "dropping PF_KEY message with bad length");
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    fn port_id(&self) -> u32 {
        self.pid
    }
}

/// Opens real kernel sockets.
#[derive(Debug, Clone, Copy)]
pub struct KernelConnector {
    buffer_size: usize,
}

impl KernelConnector {
    /// Connector allocating `buffer_size` bytes per received datagram.
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl Default for KernelConnector {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Connector for KernelConnector {
    fn open(&self, protocol: Protocol, groups: u32) -> Result<Box<dyn Transport>> {
        Ok(match protocol {
            Protocol::Xfrm => Box::new(NetlinkSocket::open(groups, self.buffer_size)?),
            // PF_KEY has no groups; listeners register per SA type instead.
            Protocol::Pfkey => Box::new(PfkeySocket::open(self.buffer_size)?),
        })
    }
}
