//! Kernel backends.
//!
//! Exactly one backend is selected when the controller is built. Both
//! expose the same blocking operations; each synchronous request checks a
//! control socket out of the backend's pool, so replies can never be read
//! by another thread's request.

mod pfkey;
mod xfrm;

use std::net::IpAddr;
use std::sync::Arc;

pub use pfkey::PfkeyBackend;
pub use xfrm::XfrmBackend;

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::event::KernelEvent;
use crate::model::{ChildSaParams, IpsecProtocol, Policy, SaId};
use crate::transport::{Connector, PooledSocket, Protocol, Transport};

/// The selected kernel backend.
pub enum Backend {
    /// PF_KEY v2.
    Pfkey(PfkeyBackend),
    /// NETLINK_XFRM.
    Xfrm(XfrmBackend),
}

impl Backend {
    /// Build the backend named by `config`.
    pub fn new(config: &ControllerConfig, connector: Arc<dyn Connector>) -> Self {
        match config.backend {
            Protocol::Pfkey => Backend::Pfkey(PfkeyBackend::new(config, connector)),
            Protocol::Xfrm => Backend::Xfrm(XfrmBackend::new(config, connector)),
        }
    }

    /// Protocol spoken by this backend.
    pub fn protocol(&self) -> Protocol {
        match self {
            Backend::Pfkey(_) => Protocol::Pfkey,
            Backend::Xfrm(_) => Protocol::Xfrm,
        }
    }

    /// Reserve an SPI, leaving a larval SA in the kernel.
    pub fn get_spi(&self, src: &IpAddr, dst: &IpAddr, protocol: IpsecProtocol, reqid: u32) -> Result<u32> {
        match self {
            Backend::Pfkey(b) => b.get_spi(src, dst, protocol, reqid),
            Backend::Xfrm(b) => b.get_spi(src, dst, protocol),
        }
    }

    /// Install an SA (`update` promotes a larval SA or replaces a mature one).
    pub fn add_sa(&self, src: &IpAddr, dst: &IpAddr, params: &ChildSaParams, update: bool) -> Result<()> {
        match self {
            Backend::Pfkey(b) => b.add_sa(src, dst, params, update),
            Backend::Xfrm(b) => b.add_sa(src, dst, params, update),
        }
    }

    /// Remove one SA.
    pub fn delete_sa(&self, sa: &SaId) -> Result<()> {
        match self {
            Backend::Pfkey(b) => b.delete_sa(sa),
            Backend::Xfrm(b) => b.delete_sa(sa),
        }
    }

    /// Install or replace a policy, returning its kernel id.
    pub fn add_policy(&self, policy: &Policy, update: bool) -> Result<u32> {
        match self {
            Backend::Pfkey(b) => b.add_policy(policy, update),
            Backend::Xfrm(b) => b.add_policy(policy, update),
        }
    }

    /// Remove the policy matching `policy`'s selector and direction.
    pub fn delete_policy(&self, policy: &Policy) -> Result<()> {
        match self {
            Backend::Pfkey(b) => b.delete_policy(policy),
            Backend::Xfrm(b) => b.delete_policy(policy),
        }
    }

    /// Dump the kernel policy table in kernel order.
    pub fn dump_policies(&self) -> Result<Vec<Policy>> {
        match self {
            Backend::Pfkey(b) => b.dump_policies(),
            Backend::Xfrm(b) => b.dump_policies(),
        }
    }

    /// Remove every policy.
    pub fn flush_policies(&self) -> Result<()> {
        match self {
            Backend::Pfkey(b) => b.flush_policies(),
            Backend::Xfrm(b) => b.flush_policies(),
        }
    }

    /// Remove every SA.
    pub fn flush_sas(&self) -> Result<()> {
        match self {
            Backend::Pfkey(b) => b.flush_sas(),
            Backend::Xfrm(b) => b.flush_sas(),
        }
    }

    /// Open the broadcast socket the dispatcher listens on.
    pub fn open_listener(&self) -> Result<Box<dyn Transport>> {
        match self {
            Backend::Pfkey(b) => b.open_listener(),
            Backend::Xfrm(b) => b.open_listener(),
        }
    }

    /// Decode every event carried by one broadcast datagram.
    ///
    /// Malformed messages yield an error item; messages carrying no
    /// event are skipped.
    pub fn decode_events(&self, datagram: &[u8]) -> Vec<Result<KernelEvent>> {
        match self {
            Backend::Pfkey(_) => pfkey::decode_events(datagram),
            Backend::Xfrm(_) => xfrm::decode_events(datagram),
        }
    }
}

/// Run `f` on a checked-out control socket; a transport failure closes
/// the socket instead of returning it to the pool.
fn with_socket<T>(mut sock: PooledSocket<'_>, f: impl FnOnce(&mut dyn Transport) -> Result<T>) -> Result<T> {
    let result = f(&mut *sock);
    if let Err(e) = &result
        && e.class() == crate::error::ErrorClass::Transport
    {
        sock.discard();
    }
    result
}
