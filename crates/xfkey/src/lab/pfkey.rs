//! PF_KEY v2 side of the simulated kernel.

use std::sync::atomic::Ordering;

use super::{Inbox, Outcome, State};
use crate::error::{Error, Result};
use crate::model::{IpsecProtocol, PolicyType};
use crate::pfkey::codec::kernel::encode_reply;
use crate::pfkey::codec::{
    IPSEC_ULPROTO_ANY, PfkeyBuilder, PfkeyCodec, PfkeyMessage, decode_policy, decode_sa, full_prefix,
};
use crate::pfkey::types::*;
use crate::wire::Cursor;

type Errno = i32;

fn invalid(_: Error) -> Errno {
    libc::EINVAL
}

/// Reply to the requester, with a copy for registered sockets.
fn echo(reply: Vec<u8>) -> Outcome {
    Outcome {
        replies: vec![reply.clone()],
        broadcast: vec![reply],
    }
}

/// Answer one PF_KEY request.
pub(super) fn handle(state: &mut State, inbox: &Inbox, data: &[u8]) -> Outcome {
    let msg = match PfkeyMessage::parse(data) {
        Ok(msg) => msg,
        Err(_) => {
            // Unparsable body: answer EINVAL if at least the header reads.
            return match Cursor::new(data, "sadb_msg").read::<SadbMsg>() {
                Ok(header) => Outcome::reply(encode_reply(&header, libc::EINVAL)),
                Err(_) => Outcome::default(),
            };
        }
    };
    state.sequences.push(msg.header.seq);
    if let Some(errno) = state.take_failure() {
        return Outcome::reply(encode_reply(&msg.header, errno));
    }
    request(state, inbox, &msg).unwrap_or_else(|errno| Outcome::reply(encode_reply(&msg.header, errno)))
}

fn request(state: &mut State, inbox: &Inbox, msg: &PfkeyMessage<'_>) -> std::result::Result<Outcome, Errno> {
    let hdr = msg.header;
    let codec = PfkeyCodec::default();
    match hdr.msg_type {
        SADB_GETSPI => {
            let proto = msg.protocol().map_err(invalid)?;
            let (src, ..) = msg.address(SADB_EXT_ADDRESS_SRC).map_err(invalid)?;
            let (dst, ..) = msg.address(SADB_EXT_ADDRESS_DST).map_err(invalid)?;
            let (min, max) = match msg.ext(SADB_EXT_SPIRANGE) {
                Some(mut cur) => {
                    let range: SadbSpirange = cur.read().map_err(invalid)?;
                    (range.min, range.max)
                }
                None => (0x100, 0x0fff_ffff),
            };
            let reqid = match msg.ext(SADB_X_EXT_SA2) {
                Some(mut cur) => cur.read::<SadbXSa2>().map_err(invalid)?.reqid,
                None => 0,
            };
            let spi = state.allocate_spi(min, max, &dst, proto).ok_or(libc::ENOENT)?;
            state.insert_larval(src, dst, proto, spi, reqid);

            let mut b = PfkeyBuilder::new(SADB_GETSPI, hdr.satype, hdr.seq, hdr.pid);
            b.ext(
                &SadbSa {
                    exttype: SADB_EXT_SA,
                    spi: spi.to_be(),
                    state: SADB_SASTATE_LARVAL,
                    ..Default::default()
                },
                &[],
            );
            b.address(SADB_EXT_ADDRESS_SRC, &src, full_prefix(&src), IPSEC_ULPROTO_ANY, 0);
            b.address(SADB_EXT_ADDRESS_DST, &dst, full_prefix(&dst), IPSEC_ULPROTO_ANY, 0);
            Ok(Outcome::reply(b.finish()))
        }
        SADB_ADD | SADB_UPDATE => {
            let entry = decode_sa(msg).map_err(invalid)?;
            match state.store_sa(entry, hdr.msg_type == SADB_UPDATE) {
                0 => Ok(echo(encode_reply(&hdr, 0))),
                errno => Err(errno),
            }
        }
        SADB_DELETE => {
            let proto = msg.protocol().map_err(invalid)?;
            let (dst, ..) = msg.address(SADB_EXT_ADDRESS_DST).map_err(invalid)?;
            let spi = msg.spi().map_err(invalid)?;
            match state.remove_sa(&dst, proto, spi) {
                0 => Ok(echo(encode_reply(&hdr, 0))),
                errno => Err(errno),
            }
        }
        SADB_X_SPDADD | SADB_X_SPDUPDATE => {
            let policy = decode_policy(msg).map_err(invalid)?;
            let stored = state.store_policy(policy, hdr.msg_type == SADB_X_SPDUPDATE)?;
            let reply = codec
                .encode_policy(hdr.msg_type, hdr.seq, hdr.pid, &stored)
                .map_err(invalid)?;
            Ok(echo(reply))
        }
        SADB_X_SPDDELETE => {
            let key = decode_policy(msg).map_err(invalid)?;
            match state.remove_policy(&key) {
                0 => Ok(echo(encode_reply(&hdr, 0))),
                errno => Err(errno),
            }
        }
        SADB_X_SPDDUMP => {
            let entries: Vec<_> = state
                .policies
                .iter()
                .filter(|p| p.policy_type == PolicyType::Main)
                .collect();
            if entries.is_empty() {
                return Err(libc::ENOENT);
            }
            // Sequence numbers count down; the last entry carries 0.
            let last = entries.len() - 1;
            let replies = entries
                .iter()
                .enumerate()
                .map(|(i, p)| codec.encode_policy(SADB_X_SPDDUMP, (last - i) as u32, hdr.pid, p))
                .collect::<Result<Vec<_>>>()
                .map_err(invalid)?;
            Ok(Outcome {
                replies,
                broadcast: Vec::new(),
            })
        }
        SADB_FLUSH => {
            match msg.protocol() {
                Ok(proto) => state.sas.retain(|s| s.id.protocol != proto),
                Err(_) => state.sas.clear(),
            }
            Ok(echo(encode_reply(&hdr, 0)))
        }
        SADB_X_SPDFLUSH => {
            state.policies.clear();
            Ok(echo(encode_reply(&hdr, 0)))
        }
        SADB_REGISTER => {
            if hdr.satype != SADB_SATYPE_ESP && hdr.satype != SADB_SATYPE_AH {
                return Err(libc::EINVAL);
            }
            inbox.registered.store(true, Ordering::Release);
            Ok(Outcome::reply(encode_reply(&hdr, 0)))
        }
        _ => Err(libc::EOPNOTSUPP),
    }
}
