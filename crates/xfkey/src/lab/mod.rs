//! In-memory simulated kernel for tests and demos.
//!
//! [`SimKernel`] implements [`Connector`]: every socket it opens answers
//! PF_KEY or NETLINK_XFRM requests from one shared SA and policy table,
//! the way the Linux kernel serves both interfaces from the same SAD and
//! SPD. Kernel-originated notifications ([`SimKernel::acquire`],
//! [`SimKernel::expire`]) are broadcast to every listening socket in the
//! socket's own protocol.
//!
//! ```ignore
//! use std::sync::Arc;
//! use xfkey::lab::SimKernel;
//! use xfkey::{ControllerConfig, IpsecController};
//!
//! let kernel = SimKernel::new();
//! let controller = IpsecController::new(ControllerConfig::new(), Arc::new(kernel.clone()))?;
//! ```

mod pfkey;
mod xfrm;

use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::model::{ChildSaParams, IpsecProtocol, Policy, SaEntry, SaId};
use crate::transport::{Connector, Protocol, Transport};

/// One SA in the simulated SAD.
#[derive(Debug, Clone)]
struct SimSa {
    id: SaId,
    reqid: u32,
    /// `None` while larval.
    params: Option<ChildSaParams>,
}

/// Replies to the requesting socket and copies for listeners.
#[derive(Debug, Default)]
struct Outcome {
    replies: Vec<Vec<u8>>,
    broadcast: Vec<Vec<u8>>,
}

impl Outcome {
    fn reply(data: Vec<u8>) -> Self {
        Self {
            replies: vec![data],
            broadcast: Vec::new(),
        }
    }
}

/// Receive queue of one simulated socket.
struct Inbox {
    protocol: Protocol,
    groups: u32,
    port: u32,
    registered: AtomicBool,
    closed: AtomicBool,
    queue: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

impl Inbox {
    fn new(protocol: Protocol, groups: u32, port: u32) -> Self {
        Self {
            protocol,
            groups,
            port,
            registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, data: Vec<u8>) {
        self.lock().push_back(data);
        self.ready.notify_all();
    }

    fn close(&self) {
        let _queue = self.lock();
        self.closed.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    /// Listening for ACQUIRE/EXPIRE.
    fn is_listener(&self) -> bool {
        match self.protocol {
            Protocol::Xfrm => self.groups != 0,
            Protocol::Pfkey => self.registered.load(Ordering::Acquire),
        }
    }
}

#[derive(Default)]
struct State {
    sas: Vec<SimSa>,
    policies: Vec<Policy>,
    index_gen: u32,
    spi_cursor: u64,
    /// Requests still to pass before one fails, and its errno.
    fail: Option<(usize, i32)>,
    sequences: Vec<u32>,
    acquire_seq: u32,
}

impl State {
    /// Errno the current request must fail with, if one is armed for it.
    fn take_failure(&mut self) -> Option<i32> {
        match self.fail.take()? {
            (0, errno) => Some(errno),
            (skip, errno) => {
                self.fail = Some((skip - 1, errno));
                None
            }
        }
    }

    fn find_sa(&self, dst: &IpAddr, protocol: IpsecProtocol, spi: u32) -> Option<usize> {
        self.sas
            .iter()
            .position(|s| s.id.dst == *dst && s.id.protocol == protocol && s.id.spi == spi)
    }

    /// First free SPI in `min..=max` for `dst`, scanning from a rotating
    /// cursor so consecutive allocations differ.
    fn allocate_spi(&mut self, min: u32, max: u32, dst: &IpAddr, protocol: IpsecProtocol) -> Option<u32> {
        if min > max || max < 256 {
            return None;
        }
        let min = min.max(256);
        let span = (max - min) as u64 + 1;
        for step in 0..span.min(1 << 16) {
            let spi = min + ((self.spi_cursor + step) % span) as u32;
            if self.find_sa(dst, protocol, spi).is_none() {
                self.spi_cursor = self.spi_cursor + step + 1;
                return Some(spi);
            }
        }
        None
    }

    fn insert_larval(&mut self, src: IpAddr, dst: IpAddr, protocol: IpsecProtocol, spi: u32, reqid: u32) {
        self.sas.push(SimSa {
            id: SaId::new(src, dst, protocol, spi),
            reqid,
            params: None,
        });
    }

    /// ADD (`update == false`) or UPDATE an SA; returns the errno.
    fn store_sa(&mut self, entry: SaEntry, update: bool) -> i32 {
        let existing = self.find_sa(&entry.id.dst, entry.id.protocol, entry.id.spi);
        let sa = SimSa {
            id: entry.id,
            reqid: entry.params.reqid,
            params: Some(entry.params),
        };
        match (existing, update) {
            (Some(_), false) => libc::EEXIST,
            (None, true) => libc::ESRCH,
            (Some(i), true) => {
                self.sas[i] = sa;
                0
            }
            (None, false) => {
                self.sas.push(sa);
                0
            }
        }
    }

    fn remove_sa(&mut self, dst: &IpAddr, protocol: IpsecProtocol, spi: u32) -> i32 {
        match self.find_sa(dst, protocol, spi) {
            Some(i) => {
                self.sas.remove(i);
                0
            }
            None => libc::ESRCH,
        }
    }

    fn find_policy(&self, key: &Policy) -> Option<usize> {
        self.policies.iter().position(|p| p.same_selector(key))
    }

    fn next_index(&mut self, policy: &Policy) -> u32 {
        self.index_gen += 8;
        self.index_gen | crate::xfrm::codec::dir_to_xfrm(policy.direction) as u32
    }

    /// NEWPOLICY/SPDADD (`update == false`) or UPDPOLICY/SPDUPDATE.
    /// Returns the stored policy or an errno.
    fn store_policy(&mut self, mut policy: Policy, update: bool) -> std::result::Result<Policy, i32> {
        match (self.find_policy(&policy), update) {
            (Some(_), false) => Err(libc::EEXIST),
            (Some(i), true) => {
                policy.id = self.policies[i].id;
                self.policies[i] = policy.clone();
                Ok(policy)
            }
            (None, _) => {
                policy.id = self.next_index(&policy);
                self.policies.push(policy.clone());
                Ok(policy)
            }
        }
    }

    fn remove_policy(&mut self, key: &Policy) -> i32 {
        match self.find_policy(key) {
            Some(i) => {
                self.policies.remove(i);
                0
            }
            None => libc::ENOENT,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    sockets: Mutex<Vec<Weak<Inbox>>>,
    next_port: AtomicU32,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn inboxes(&self) -> Vec<Arc<Inbox>> {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.retain(|w| w.strong_count() > 0);
        sockets.iter().filter_map(Weak::upgrade).collect()
    }

    fn listeners(&self, protocol: Protocol) -> Vec<Arc<Inbox>> {
        self.inboxes()
            .into_iter()
            .filter(|i| i.protocol == protocol && i.is_listener() && !i.closed.load(Ordering::Acquire))
            .collect()
    }
}

/// Simulated kernel shared by every socket it opens. Cloning is cheap and
/// yields a handle to the same kernel.
#[derive(Clone)]
pub struct SimKernel {
    shared: Arc<Shared>,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    /// Kernel with empty SA and policy tables.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                sockets: Mutex::new(Vec::new()),
                next_port: AtomicU32::new(4000),
            }),
        }
    }

    /// Mature SAs, in installation order.
    pub fn sas(&self) -> Vec<SaEntry> {
        self.shared
            .state()
            .sas
            .iter()
            .filter_map(|s| {
                s.params.clone().map(|params| SaEntry { id: s.id, params })
            })
            .collect()
    }

    /// Parameters of a mature SA.
    pub fn sa(&self, id: &SaId) -> Option<ChildSaParams> {
        let state = self.shared.state();
        state
            .find_sa(&id.dst, id.protocol, id.spi)
            .and_then(|i| state.sas[i].params.clone())
    }

    /// Check if `id` exists as a larval SA (SPI reserved, no keys).
    pub fn is_larval(&self, id: &SaId) -> bool {
        let state = self.shared.state();
        state
            .find_sa(&id.dst, id.protocol, id.spi)
            .is_some_and(|i| state.sas[i].params.is_none())
    }

    /// Number of SAs, larval ones included.
    pub fn sa_count(&self) -> usize {
        self.shared.state().sas.len()
    }

    /// Policy table in kernel order.
    pub fn policies(&self) -> Vec<Policy> {
        self.shared.state().policies.clone()
    }

    /// Install a policy behind the controller's back (another key
    /// manager, `ip xfrm policy add`). Returns the assigned id.
    pub fn install_policy(&self, policy: Policy) -> Result<u32> {
        self.shared
            .state()
            .store_policy(policy, false)
            .map(|p| p.id)
            .map_err(|errno| Error::from_errno_with_context(errno, "install policy"))
    }

    /// Fail the next request with `errno`.
    pub fn fail_next(&self, errno: i32) {
        self.fail_after(0, errno);
    }

    /// Let `skip` requests through, then fail the one after with `errno`.
    pub fn fail_after(&self, skip: usize, errno: i32) {
        self.shared.state().fail = Some((skip, errno));
    }

    /// Sequence numbers of every request received, in arrival order.
    pub fn sequences(&self) -> Vec<u32> {
        self.shared.state().sequences.clone()
    }

    /// Number of open listening sockets across both protocols.
    pub fn listeners(&self) -> usize {
        self.shared.listeners(Protocol::Xfrm).len() + self.shared.listeners(Protocol::Pfkey).len()
    }

    /// Break every listening socket; their next receive fails.
    pub fn disconnect_listeners(&self) {
        for protocol in [Protocol::Xfrm, Protocol::Pfkey] {
            for inbox in self.shared.listeners(protocol) {
                inbox.close();
            }
        }
    }

    /// Deliver raw bytes to every listener of `protocol`.
    pub fn inject(&self, protocol: Protocol, data: &[u8]) {
        for inbox in self.shared.listeners(protocol) {
            inbox.push(data.to_vec());
        }
    }

    /// Broadcast an ACQUIRE for installed policy `policy_id`, as if a
    /// packet `src_host -> dst_host` hit it.
    pub fn acquire(&self, policy_id: u32, src_host: &IpAddr, dst_host: &IpAddr) -> Result<()> {
        let policy = self
            .shared
            .state()
            .policies
            .iter()
            .find(|p| p.id == policy_id)
            .cloned()
            .ok_or(Error::PolicyNotFound { id: policy_id })?;
        self.acquire_for(&policy, src_host, dst_host);
        Ok(())
    }

    /// Broadcast an ACQUIRE naming `policy`, whether installed or not.
    pub fn acquire_for(&self, policy: &Policy, src_host: &IpAddr, dst_host: &IpAddr) {
        let seq = {
            let mut state = self.shared.state();
            state.acquire_seq += 1;
            state.acquire_seq
        };
        trace!(policy = policy.id, seq, "simulated acquire");
        self.inject(
            Protocol::Xfrm,
            &crate::xfrm::codec::kernel::encode_acquire(seq, policy, src_host, dst_host),
        );
        self.inject(
            Protocol::Pfkey,
            &crate::pfkey::codec::kernel::encode_acquire(seq, policy, src_host, dst_host),
        );
    }

    /// Broadcast an EXPIRE for `id`. A hard expire removes the SA.
    pub fn expire(&self, id: &SaId, hard: bool) -> Result<()> {
        let reqid = {
            let mut state = self.shared.state();
            let index = state
                .find_sa(&id.dst, id.protocol, id.spi)
                .ok_or_else(|| Error::from_errno_with_context(libc::ESRCH, format!("expire {}", id)))?;
            let reqid = state.sas[index].reqid;
            if hard {
                state.sas.remove(index);
            }
            reqid
        };
        trace!(sa = %id, hard, "simulated expire");
        self.inject(Protocol::Xfrm, &crate::xfrm::codec::kernel::encode_expire(id, reqid, hard));
        self.inject(Protocol::Pfkey, &crate::pfkey::codec::kernel::encode_expire(id, reqid, hard));
        Ok(())
    }
}

impl Connector for SimKernel {
    fn open(&self, protocol: Protocol, groups: u32) -> Result<Box<dyn Transport>> {
        let port = self.shared.next_port.fetch_add(1, Ordering::SeqCst);
        let inbox = Arc::new(Inbox::new(protocol, groups, port));
        self.shared
            .sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&inbox));
        Ok(Box::new(SimSocket {
            shared: self.shared.clone(),
            inbox,
        }))
    }
}

/// A socket opened on a [`SimKernel`].
struct SimSocket {
    shared: Arc<Shared>,
    inbox: Arc<Inbox>,
}

fn closed_error(operation: &'static str) -> Error {
    Error::transport(operation, io::Error::from(io::ErrorKind::ConnectionReset))
}

impl Transport for SimSocket {
    fn send(&mut self, msg: &[u8]) -> Result<()> {
        if self.inbox.closed.load(Ordering::Acquire) {
            return Err(closed_error("send"));
        }
        let outcome = {
            let mut state = self.shared.state();
            match self.inbox.protocol {
                Protocol::Xfrm => xfrm::handle(&mut state, msg),
                Protocol::Pfkey => pfkey::handle(&mut state, &self.inbox, msg),
            }
        };
        for reply in outcome.replies {
            self.inbox.push(reply);
        }
        if !outcome.broadcast.is_empty() {
            for inbox in self.shared.listeners(self.inbox.protocol) {
                if inbox.port == self.inbox.port {
                    continue;
                }
                for data in &outcome.broadcast {
                    inbox.push(data.clone());
                }
            }
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let mut queue = self.inbox.lock();
        loop {
            if self.inbox.closed.load(Ordering::Acquire) {
                return Err(closed_error("recv"));
            }
            if let Some(data) = queue.pop_front() {
                return Ok(Some(data));
            }
            match timeout {
                None => {
                    queue = self.inbox.ready.wait(queue).unwrap_or_else(|e| e.into_inner());
                }
                Some(timeout) => {
                    let (guard, result) = self
                        .inbox
                        .ready
                        .wait_timeout(queue, timeout)
                        .unwrap_or_else(|e| e.into_inner());
                    queue = guard;
                    if result.timed_out() && queue.is_empty() && !self.inbox.closed.load(Ordering::Acquire) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn port_id(&self) -> u32 {
        self.inbox.port
    }
}
