//! NETLINK_XFRM side of the simulated kernel.

use super::{Outcome, State};
use crate::error::Error;
use crate::model::{IpsecProtocol, Policy, PolicyType};
use crate::wire::message::{NLM_F_DUMP, NLM_F_MULTI, NLMSG_DONE};
use crate::wire::{Attrs, MessageBuilder, Messages, NlMessage};
use crate::xfrm::codec::kernel::encode_ack;
use crate::xfrm::codec::{XfrmCodec, decode_policy, decode_sa, dir_from_xfrm};
use crate::xfrm::types::*;

type Errno = i32;

fn invalid(_: Error) -> Errno {
    libc::EINVAL
}

fn ack(msg: &NlMessage<'_>, errno: Errno) -> Vec<Vec<u8>> {
    vec![encode_ack(&msg.header, errno)]
}

/// Answer every request packed in `data`.
pub(super) fn handle(state: &mut State, data: &[u8]) -> Outcome {
    let mut outcome = Outcome::default();
    for item in Messages::new(data) {
        let Ok(msg) = item else {
            break;
        };
        state.sequences.push(msg.header.nlmsg_seq);
        let replies = match state.take_failure() {
            Some(errno) => ack(&msg, errno),
            None => request(state, &msg).unwrap_or_else(|errno| ack(&msg, errno)),
        };
        outcome.replies.extend(replies);
    }
    outcome
}

fn protocol(proto: u8) -> Result<IpsecProtocol, Errno> {
    IpsecProtocol::from_number(proto).ok_or(libc::EPROTONOSUPPORT)
}

fn request(state: &mut State, msg: &NlMessage<'_>) -> Result<Vec<Vec<u8>>, Errno> {
    let seq = msg.header.nlmsg_seq;
    match msg.header.nlmsg_type {
        XFRM_MSG_ALLOCSPI => {
            let req: XfrmUserspiInfo = msg.cursor("xfrm_userspi_info").read().map_err(invalid)?;
            let mut info = req.info;
            let proto = protocol(info.id.proto)?;
            let src = info.saddr.to_ip(info.family).ok_or(libc::EAFNOSUPPORT)?;
            let dst = info.id.daddr.to_ip(info.family).ok_or(libc::EAFNOSUPPORT)?;
            let spi = state
                .allocate_spi(req.min, req.max, &dst, proto)
                .ok_or(libc::ENOENT)?;
            state.insert_larval(src, dst, proto, spi, info.reqid);
            info.id.spi = spi.to_be();
            let mut b = MessageBuilder::new(XFRM_MSG_NEWSA, 0);
            b.set_seq(seq);
            b.set_pid(msg.header.nlmsg_pid);
            b.append(&info);
            Ok(vec![b.finish()])
        }
        XFRM_MSG_NEWSA | XFRM_MSG_UPDSA => {
            let entry = decode_sa(msg).map_err(invalid)?;
            Ok(ack(msg, state.store_sa(entry, msg.header.nlmsg_type == XFRM_MSG_UPDSA)))
        }
        XFRM_MSG_DELSA => {
            let id: XfrmUsersaId = msg.cursor("xfrm_usersa_id").read().map_err(invalid)?;
            let dst = id.daddr.to_ip(id.family).ok_or(libc::EAFNOSUPPORT)?;
            Ok(ack(msg, state.remove_sa(&dst, protocol(id.proto)?, u32::from_be(id.spi))))
        }
        XFRM_MSG_NEWPOLICY | XFRM_MSG_UPDPOLICY => {
            let policy = decode_policy(msg).map_err(invalid)?;
            state.store_policy(policy, msg.header.nlmsg_type == XFRM_MSG_UPDPOLICY)?;
            Ok(ack(msg, 0))
        }
        XFRM_MSG_GETPOLICY if msg.header.nlmsg_flags & NLM_F_DUMP == NLM_F_DUMP => {
            let codec = XfrmCodec::default();
            let mut datagram = Vec::new();
            for policy in &state.policies {
                let mut entry = codec.encode_policy(XFRM_MSG_NEWPOLICY, seq, policy);
                entry[6..8].copy_from_slice(&NLM_F_MULTI.to_ne_bytes());
                datagram.extend_from_slice(&entry);
            }
            let mut done = MessageBuilder::new(NLMSG_DONE, NLM_F_MULTI);
            done.set_seq(seq);
            done.append_bytes(&0i32.to_ne_bytes());
            datagram.extend_from_slice(&done.finish());
            Ok(vec![datagram])
        }
        XFRM_MSG_GETPOLICY => {
            let key = policy_key(msg)?;
            let index = state.find_policy(&key).ok_or(libc::ENOENT)?;
            let reply = XfrmCodec::default().encode_policy(XFRM_MSG_NEWPOLICY, seq, &state.policies[index]);
            Ok(vec![reply])
        }
        XFRM_MSG_DELPOLICY => {
            let key = policy_key(msg)?;
            Ok(ack(msg, state.remove_policy(&key)))
        }
        XFRM_MSG_FLUSHSA => {
            let flush: XfrmUsersaFlush = msg.cursor("xfrm_usersa_flush").read().map_err(invalid)?;
            match IpsecProtocol::from_number(flush.proto) {
                Some(proto) => state.sas.retain(|s| s.id.protocol != proto),
                None => state.sas.clear(),
            }
            Ok(ack(msg, 0))
        }
        XFRM_MSG_FLUSHPOLICY => {
            let mut table = PolicyType::Main;
            for attr in Attrs::new(msg.cursor("xfrm_flushpolicy")) {
                let (kind, mut payload) = attr.map_err(invalid)?;
                if kind == XFRMA_POLICY_TYPE {
                    let upt: XfrmUserpolicyType = payload.read().map_err(invalid)?;
                    if upt.kind == XFRM_POLICY_TYPE_SUB {
                        table = PolicyType::Sub;
                    }
                }
            }
            state.policies.retain(|p| p.policy_type != table);
            Ok(ack(msg, 0))
        }
        _ => Err(libc::EOPNOTSUPP),
    }
}

/// Policy addressed by an `xfrm_userpolicy_id` request.
fn policy_key(msg: &NlMessage<'_>) -> Result<Policy, Errno> {
    let mut cur = msg.cursor("xfrm_userpolicy_id");
    let id: XfrmUserpolicyId = cur.read().map_err(invalid)?;
    let sel = id.sel;
    let src = sel.saddr.to_ip(sel.family).ok_or(libc::EAFNOSUPPORT)?;
    let dst = sel.daddr.to_ip(sel.family).ok_or(libc::EAFNOSUPPORT)?;
    let mut key = Policy::new(
        dir_from_xfrm(id.dir).map_err(invalid)?,
        (src, sel.prefixlen_s),
        (dst, sel.prefixlen_d),
    )
    .with_protocol(sel.proto, u16::from_be(sel.sport), u16::from_be(sel.dport));
    for attr in Attrs::new(cur) {
        let (kind, mut payload) = attr.map_err(invalid)?;
        if kind == XFRMA_POLICY_TYPE {
            let upt: XfrmUserpolicyType = payload.read().map_err(invalid)?;
            if upt.kind == XFRM_POLICY_TYPE_SUB {
                key.policy_type = PolicyType::Sub;
            }
        }
    }
    Ok(key)
}
