//! Kernel notifications and the commands they turn into.

use std::net::IpAddr;

use serde::Serialize;

use crate::model::{Direction, IpsecMode, IpsecProtocol, PolicyType, SaId, TrafficSelector};

/// Decoded kernel ACQUIRE: traffic hit a policy without an SA.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Acquire {
    /// Triggering policy id, when the kernel reports one.
    pub policy_id: Option<u32>,
    /// Policy table of the triggering policy.
    pub policy_type: PolicyType,
    /// Direction of the triggering policy.
    pub direction: Direction,
    /// Outer source address (tunnel source or packet source).
    pub src: IpAddr,
    /// Outer destination address.
    pub dst: IpAddr,
    /// Selector of the triggering packet, source side.
    pub src_ts: TrafficSelector,
    /// Selector of the triggering packet, destination side.
    pub dst_ts: TrafficSelector,
    /// Requested protocol.
    pub protocol: IpsecProtocol,
    /// Kernel sequence number of the acquire.
    pub seq: u32,
}

/// Decoded kernel EXPIRE: an SA reached a lifetime limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Expire {
    /// The expiring SA.
    pub sa: SaId,
    /// Request id of the SA.
    pub reqid: u32,
    /// Hard limit (SA gone) rather than soft (rekey due).
    pub hard: bool,
}

/// A notification received on the listener socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum KernelEvent {
    /// SA acquisition request.
    Acquire(Acquire),
    /// SA lifetime expiry.
    Expire(Expire),
}

/// Command handed to the IKE core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IkeCommand {
    /// Negotiate a Child SA for the resolved policy.
    StartNegotiation {
        /// Policy that triggered the acquire.
        policy_id: u32,
        /// Initiator traffic selector.
        ts_i: TrafficSelector,
        /// Responder traffic selector.
        ts_r: TrafficSelector,
        /// Tunnel endpoints (tunnel mode), taken from the parent policy
        /// for sub-policies.
        tunnel: Option<(IpAddr, IpAddr)>,
        /// Encapsulation mode.
        mode: IpsecMode,
        /// IPsec protocol.
        protocol: IpsecProtocol,
        /// Request id of the policy template.
        reqid: u32,
    },
    /// Soft expire: rekey the Child SA.
    RekeyChildSa {
        /// The SA to rekey.
        sa: SaId,
        /// Request id of the SA.
        reqid: u32,
    },
    /// Hard expire: the SA is gone; tear down the Child SA.
    DeleteChildSa {
        /// The deleted SA.
        sa: SaId,
        /// Request id of the SA.
        reqid: u32,
    },
}

impl IkeCommand {
    /// Command for an expire notification.
    pub fn for_expire(expire: &Expire) -> Self {
        if expire.hard {
            IkeCommand::DeleteChildSa {
                sa: expire.sa,
                reqid: expire.reqid,
            }
        } else {
            IkeCommand::RekeyChildSa {
                sa: expire.sa,
                reqid: expire.reqid,
            }
        }
    }
}
