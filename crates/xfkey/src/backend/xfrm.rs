//! NETLINK_XFRM backend.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use super::with_socket;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::event::KernelEvent;
use crate::model::{ChildSaParams, IpsecProtocol, Policy, PolicyType, SaId};
use crate::transport::{Connector, Protocol, SequenceCounter, SocketPool, Transport};
use crate::wire::{Messages, NlMessage};
use crate::xfrm::codec::{XfrmCodec, decode_event, decode_policy, decode_sa};
use crate::xfrm::types::*;

/// Backend speaking NETLINK_XFRM.
pub struct XfrmBackend {
    pool: SocketPool,
    seq: SequenceCounter,
    codec: XfrmCodec,
}

/// What a request waits for after sending.
#[derive(Clone, Copy)]
enum Reply {
    /// An `NLMSG_ERROR` frame; 0 is success.
    Ack,
    /// One message of the given type, or an error frame.
    Message(u16),
}

impl XfrmBackend {
    /// Create the backend; sockets are opened on first use.
    pub fn new(config: &ControllerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            pool: SocketPool::new(connector, Protocol::Xfrm, config.pool_size),
            seq: SequenceCounter::new(),
            codec: XfrmCodec {
                spi_range: config.spi_range,
                soft_ratio: config.soft_ratio,
                replay_window: config.replay_window,
            },
        }
    }

    /// Send `msg` (already stamped with `seq`) and wait for its reply.
    ///
    /// Returns the reply message bytes for [`Reply::Message`].
    fn transact(&self, operation: &str, seq: u32, msg: &[u8], reply: Reply) -> Result<Vec<u8>> {
        debug!(operation, seq, "xfrm request");
        let sock = self.pool.checkout()?;
        with_socket(sock, |sock| {
            sock.send(msg)?;
            loop {
                let Some(data) = sock.recv(None)? else {
                    continue;
                };
                for item in Messages::new(&data) {
                    let m = item?;
                    if m.header.nlmsg_seq != seq {
                        continue;
                    }
                    if m.header.is_error() {
                        let code = m.error_code()?;
                        if code != 0 {
                            return Err(Error::from_errno_with_context(code, operation));
                        }
                        match reply {
                            Reply::Ack => return Ok(Vec::new()),
                            Reply::Message(_) => {
                                return Err(Error::ProtocolViolation(format!(
                                    "{}: ACK where a reply was expected",
                                    operation
                                )));
                            }
                        }
                    }
                    if let Reply::Message(kind) = reply
                        && m.header.nlmsg_type == kind
                    {
                        return Ok(frame(&m));
                    }
                }
            }
        })
    }

    pub(super) fn get_spi(&self, src: &IpAddr, dst: &IpAddr, protocol: IpsecProtocol) -> Result<u32> {
        let seq = self.seq.next();
        let msg = self.codec.encode_alloc_spi(seq, src, dst, protocol);
        let op = format!("XFRM_MSG_ALLOCSPI {} {} -> {}", protocol, src, dst);
        let reply = self.transact(&op, seq, &msg, Reply::Message(XFRM_MSG_NEWSA))?;
        let sa = decode_sa(&first_message(&reply)?)?;
        debug!(spi = format_args!("0x{:08x}", sa.id.spi), "allocated SPI");
        Ok(sa.id.spi)
    }

    pub(super) fn add_sa(&self, src: &IpAddr, dst: &IpAddr, params: &ChildSaParams, update: bool) -> Result<()> {
        let msg_type = if update { XFRM_MSG_UPDSA } else { XFRM_MSG_NEWSA };
        let seq = self.seq.next();
        let msg = self.codec.encode_sa(msg_type, seq, src, dst, params)?;
        let op = format!(
            "{} {} -> {} spi 0x{:08x}",
            if update { "XFRM_MSG_UPDSA" } else { "XFRM_MSG_NEWSA" },
            src,
            dst,
            params.spi
        );
        self.transact(&op, seq, &msg, Reply::Ack).map(|_| ())
    }

    pub(super) fn delete_sa(&self, sa: &SaId) -> Result<()> {
        let seq = self.seq.next();
        let msg = self.codec.encode_del_sa(seq, sa);
        self.transact(&format!("XFRM_MSG_DELSA {}", sa), seq, &msg, Reply::Ack)
            .map(|_| ())
    }

    pub(super) fn add_policy(&self, policy: &Policy, update: bool) -> Result<u32> {
        let msg_type = if update {
            XFRM_MSG_UPDPOLICY
        } else {
            XFRM_MSG_NEWPOLICY
        };
        let seq = self.seq.next();
        let name = if update { "XFRM_MSG_UPDPOLICY" } else { "XFRM_MSG_NEWPOLICY" };
        let msg = self.codec.encode_policy(msg_type, seq, policy);
        self.transact(&format!("{} {}", name, policy), seq, &msg, Reply::Ack)?;

        // The kernel assigns the index; read it back.
        let seq = self.seq.next();
        let msg = self.codec.encode_get_policy(seq, policy);
        let reply = self.transact(
            &format!("XFRM_MSG_GETPOLICY {}", policy),
            seq,
            &msg,
            Reply::Message(XFRM_MSG_NEWPOLICY),
        )?;
        let installed = decode_policy(&first_message(&reply)?)?;
        Ok(installed.id)
    }

    pub(super) fn delete_policy(&self, policy: &Policy) -> Result<()> {
        let seq = self.seq.next();
        let msg = self.codec.encode_del_policy(seq, policy);
        self.transact(&format!("XFRM_MSG_DELPOLICY {}", policy), seq, &msg, Reply::Ack)
            .map(|_| ())
    }

    pub(super) fn dump_policies(&self) -> Result<Vec<Policy>> {
        let seq = self.seq.next();
        let msg = self.codec.encode_policy_dump(seq);
        debug!(seq, "xfrm policy dump");
        let sock = self.pool.checkout()?;
        with_socket(sock, |sock| {
            sock.send(&msg)?;
            let mut policies = Vec::new();
            loop {
                let Some(data) = sock.recv(None)? else {
                    continue;
                };
                for item in Messages::new(&data) {
                    let m = item?;
                    if m.header.nlmsg_seq != seq {
                        continue;
                    }
                    if m.header.is_done() {
                        return Ok(policies);
                    }
                    if m.header.is_error() {
                        let code = m.error_code()?;
                        if code != 0 {
                            return Err(Error::from_errno_with_context(code, "XFRM_MSG_GETPOLICY dump"));
                        }
                        continue;
                    }
                    if m.header.nlmsg_type == XFRM_MSG_NEWPOLICY {
                        match decode_policy(&m) {
                            Ok(p) => policies.push(p),
                            Err(e) => warn!(error = %e, "dropping malformed policy in dump"),
                        }
                    }
                }
            }
        })
    }

    /// Flush the main table, then the sub-policy table.
    pub(super) fn flush_policies(&self) -> Result<()> {
        for policy_type in [PolicyType::Main, PolicyType::Sub] {
            let seq = self.seq.next();
            let msg = self.codec.encode_flush_policy(seq, policy_type);
            self.transact(&format!("XFRM_MSG_FLUSHPOLICY {:?}", policy_type), seq, &msg, Reply::Ack)?;
        }
        Ok(())
    }

    pub(super) fn flush_sas(&self) -> Result<()> {
        let seq = self.seq.next();
        let msg = self.codec.encode_flush_sa(seq);
        self.transact("XFRM_MSG_FLUSHSA", seq, &msg, Reply::Ack).map(|_| ())
    }

    pub(super) fn open_listener(&self) -> Result<Box<dyn Transport>> {
        let groups = group_mask(XFRMNLGRP_ACQUIRE) | group_mask(XFRMNLGRP_EXPIRE);
        self.pool.connector().open(Protocol::Xfrm, groups)
    }
}

/// Re-frame one message (header + payload) so it can outlive the datagram.
fn frame(m: &NlMessage<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(m.header.nlmsg_len as usize);
    out.extend_from_slice(m.header.as_bytes());
    out.extend_from_slice(m.payload);
    out
}

fn first_message(data: &[u8]) -> Result<NlMessage<'_>> {
    Messages::new(data)
        .next()
        .unwrap_or_else(|| Err(Error::ProtocolViolation("empty reply".into())))
}

pub(super) fn decode_events(datagram: &[u8]) -> Vec<Result<KernelEvent>> {
    let mut events = Vec::new();
    for item in Messages::new(datagram) {
        match item.and_then(|m| decode_event(&m)) {
            Ok(Some(event)) => events.push(Ok(event)),
            Ok(None) => {}
            Err(e) => events.push(Err(e)),
        }
    }
    events
}
