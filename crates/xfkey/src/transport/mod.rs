//! Kernel socket transport.
//!
//! A [`Transport`] moves whole framed datagrams; it knows nothing about
//! SAs or policies. Synchronous requests check a control socket out of a
//! [`SocketPool`] for their exclusive use, and every socket of one
//! backend shares a [`SequenceCounter`].

mod socket;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use socket::{KernelConnector, NetlinkSocket, PfkeySocket};

use crate::error::Result;

/// Kernel key management protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// PF_KEY v2 (RFC 2367 with KAME extensions).
    Pfkey,
    /// NETLINK_XFRM.
    Xfrm,
}

impl Protocol {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Pfkey => "pfkey",
            Protocol::Xfrm => "xfrm",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pfkey" | "pf_key" => Ok(Protocol::Pfkey),
            "xfrm" | "netlink" => Ok(Protocol::Xfrm),
            other => Err(crate::Error::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// A datagram socket to the kernel key management subsystem.
pub trait Transport: Send {
    /// Write one fully framed message.
    ///
    /// Interrupted writes are retried; a short write is an error.
    fn send(&mut self, msg: &[u8]) -> Result<()>;

    /// Read one datagram, waiting at most `timeout` (`None` blocks).
    ///
    /// Returns `Ok(None)` on timeout, interruption, or when the datagram
    /// was dropped as too short or not originating from the kernel.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>>;

    /// Port id / process id the kernel addresses replies to.
    fn port_id(&self) -> u32 {
        0
    }
}

/// Opens kernel sockets. Real sockets come from [`KernelConnector`];
/// tests substitute a simulated kernel.
pub trait Connector: Send + Sync {
    /// Open a socket for `protocol`, subscribed to the multicast/broadcast
    /// `groups` mask (0 for a plain control socket).
    fn open(&self, protocol: Protocol, groups: u32) -> Result<Box<dyn Transport>>;
}

/// Sequence number source shared by all sockets of one backend.
///
/// Starts at 1; every call returns a distinct, strictly increasing value.
#[derive(Debug, Clone)]
pub struct SequenceCounter(Arc<AtomicU32>);

impl SequenceCounter {
    /// New counter starting at 1.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(1)))
    }

    /// Next sequence number.
    pub fn next(&self) -> u32 {
        let seq = self.0.fetch_add(1, Ordering::SeqCst);
        // 0 marks the end of a PF_KEY dump; never hand it out.
        if seq == 0 {
            self.0.fetch_add(1, Ordering::SeqCst)
        } else {
            seq
        }
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of control sockets, one checked out per in-flight request.
pub struct SocketPool {
    connector: Arc<dyn Connector>,
    protocol: Protocol,
    idle: Mutex<Vec<Box<dyn Transport>>>,
    max_idle: usize,
}

impl SocketPool {
    /// Create an empty pool; sockets are opened on demand.
    pub fn new(connector: Arc<dyn Connector>, protocol: Protocol, max_idle: usize) -> Self {
        Self {
            connector,
            protocol,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Protocol of the pooled sockets.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Connector the pool opens sockets with.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Take an idle socket or open a new one.
    pub fn checkout(&self) -> Result<PooledSocket<'_>> {
        let idle = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let socket = match idle {
            Some(socket) => socket,
            None => {
                tracing::debug!(protocol = %self.protocol, "opening control socket");
                self.connector.open(self.protocol, 0)?
            }
        };
        Ok(PooledSocket {
            pool: self,
            socket,
            broken: false,
        })
    }

    /// Number of idle sockets.
    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn give_back(&self, socket: Box<dyn Transport>) {
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < self.max_idle
        {
            idle.push(socket);
        }
    }
}

/// A control socket exclusively owned by one request.
///
/// Returned to the pool on drop unless a transport error marked it broken.
pub struct PooledSocket<'a> {
    pool: &'a SocketPool,
    socket: Box<dyn Transport>,
    broken: bool,
}

/// Placeholder left behind when a pooled socket is handed back.
struct Returned;

impl Transport for Returned {
    fn send(&mut self, _msg: &[u8]) -> Result<()> {
        Ok(())
    }

    fn recv(&mut self, _timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

impl PooledSocket<'_> {
    /// Close this socket instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledSocket<'_> {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.socket.as_ref()
    }
}

impl DerefMut for PooledSocket<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.socket.as_mut()
    }
}

impl Drop for PooledSocket<'_> {
    fn drop(&mut self) {
        if !self.broken {
            let socket = std::mem::replace(&mut self.socket, Box::new(Returned));
            self.pool.give_back(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn sequence_numbers_are_unique_and_increasing() {
        let counter = SequenceCounter::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || (0..500).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let seqs = handle.join().unwrap();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            for seq in seqs {
                assert!(all.insert(seq), "duplicate sequence {}", seq);
            }
        }
        assert_eq!(all.len(), 4000);
        assert_eq!(*all.iter().min().unwrap(), 1);
        assert_eq!(*all.iter().max().unwrap(), 4000);
    }

    struct Null;

    impl Transport for Null {
        fn send(&mut self, _msg: &[u8]) -> Result<()> {
            Ok(())
        }

        fn recv(&mut self, _timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Connector for Counting {
        fn open(&self, _protocol: Protocol, _groups: u32) -> Result<Box<dyn Transport>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Null))
        }
    }

    #[test]
    fn pool_reuses_and_caps_idle_sockets() {
        let connector = Arc::new(Counting::default());
        let pool = SocketPool::new(connector.clone(), Protocol::Xfrm, 1);
        {
            let _a = pool.checkout().unwrap();
            let _b = pool.checkout().unwrap();
        }
        assert_eq!(connector.0.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle(), 1);

        drop(pool.checkout().unwrap());
        assert_eq!(connector.0.load(Ordering::SeqCst), 2);

        let mut broken = pool.checkout().unwrap();
        broken.discard();
        drop(broken);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn protocol_from_str() {
        assert_eq!("xfrm".parse::<Protocol>().unwrap(), Protocol::Xfrm);
        assert_eq!("pfkey".parse::<Protocol>().unwrap(), Protocol::Pfkey);
        assert!("ipsec".parse::<Protocol>().unwrap_err().is_configuration());
    }
}
