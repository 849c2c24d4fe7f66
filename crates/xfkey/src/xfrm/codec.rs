//! NETLINK_XFRM message encoding and decoding.

use std::net::IpAddr;

use super::types::*;
use crate::error::{Error, Result};
use crate::event::{Acquire, Expire, KernelEvent};
use crate::model::{
    ChildSaParams, Direction, EncryptionAlgorithm, IntegrityAlgorithm, IpsecLevel, IpsecMode,
    IpsecProtocol, Keyed, Lifetime, NatTraversal, Policy, PolicyAction, PolicyType, PortRange,
    SaEntry, SaId, SaRequest, TrafficSelector,
};
use crate::wire::attr::cstring;
use crate::wire::message::{NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST};
use crate::wire::{Attrs, Cursor, MessageBuilder, NlMessage};

/// Encoding parameters taken from the controller configuration.
#[derive(Debug, Clone, Copy)]
pub struct XfrmCodec {
    /// SPI allocation range for ALLOCSPI.
    pub spi_range: (u32, u32),
    /// Soft lifetime as a fraction of the hard lifetime.
    pub soft_ratio: f64,
    /// Replay window when the SA parameters carry none.
    pub replay_window: u8,
}

impl Default for XfrmCodec {
    fn default() -> Self {
        Self {
            spi_range: (0xc000_0000, 0xcfff_ffff),
            soft_ratio: 0.8,
            replay_window: 32,
        }
    }
}

fn request(msg_type: u16, seq: u32) -> MessageBuilder {
    let mut b = MessageBuilder::new(msg_type, NLM_F_REQUEST | NLM_F_ACK);
    b.set_seq(seq);
    b
}

pub(crate) fn dir_to_xfrm(dir: Direction) -> u8 {
    match dir {
        Direction::In => XFRM_POLICY_IN,
        Direction::Out => XFRM_POLICY_OUT,
        Direction::Forward => XFRM_POLICY_FWD,
    }
}

pub(crate) fn dir_from_xfrm(dir: u8) -> Result<Direction> {
    match dir {
        XFRM_POLICY_IN => Ok(Direction::In),
        XFRM_POLICY_OUT => Ok(Direction::Out),
        XFRM_POLICY_FWD => Ok(Direction::Forward),
        other => Err(Error::ProtocolViolation(format!(
            "unknown policy direction {}",
            other
        ))),
    }
}

fn proto_from_xfrm(proto: u8) -> Result<IpsecProtocol> {
    IpsecProtocol::from_number(proto)
        .ok_or_else(|| Error::ProtocolViolation(format!("unsupported IPsec protocol {}", proto)))
}

fn to_ip(addr: &XfrmAddress, family: u16) -> Result<IpAddr> {
    addr.to_ip(family)
        .ok_or_else(|| Error::ProtocolViolation(format!("unknown address family {}", family)))
}

fn port_mask(port: u16) -> u16 {
    if port == 0 { 0 } else { 0xffff }
}

/// Selector for a policy's addresses, protocol and ports.
pub fn policy_selector(policy: &Policy) -> XfrmSelector {
    let (sport, dport) = policy.ports().raw();
    XfrmSelector {
        daddr: XfrmAddress::from_ip(&policy.dst_addr),
        saddr: XfrmAddress::from_ip(&policy.src_addr),
        dport: dport.to_be(),
        dport_mask: port_mask(dport),
        sport: sport.to_be(),
        sport_mask: port_mask(sport),
        family: family_of(&policy.src_addr),
        prefixlen_d: policy.dst_prefix,
        prefixlen_s: policy.src_prefix,
        proto: policy.ip_protocol(),
        ..Default::default()
    }
}

fn single_port(range: &PortRange) -> u16 {
    if range.start == range.end { range.start } else { 0 }
}

/// Selector bound into an SA; wildcard for the family when the negotiated
/// selectors are not single CIDR blocks.
fn sa_selector(src: &IpAddr, params: &ChildSaParams) -> XfrmSelector {
    let family = family_of(src);
    let Some((ts_i, ts_r)) = &params.selectors else {
        return XfrmSelector {
            family,
            ..Default::default()
        };
    };
    match (ts_i.as_prefix(), ts_r.as_prefix()) {
        (Some((saddr, sp)), Some((daddr, dp))) => {
            let sport = single_port(&ts_i.ports);
            let dport = single_port(&ts_r.ports);
            XfrmSelector {
                daddr: XfrmAddress::from_ip(&daddr),
                saddr: XfrmAddress::from_ip(&saddr),
                dport: dport.to_be(),
                dport_mask: port_mask(dport),
                sport: sport.to_be(),
                sport_mask: port_mask(sport),
                family: family_of(&saddr),
                prefixlen_d: dp,
                prefixlen_s: sp,
                proto: ts_i.ip_protocol,
                ..Default::default()
            }
        }
        _ => XfrmSelector {
            family,
            ..Default::default()
        },
    }
}

fn selector_range(addr: IpAddr, prefix: u8, proto: u8, port: u16, mask: u16) -> TrafficSelector {
    let ports = if mask == 0 {
        PortRange::ANY
    } else {
        PortRange::single(u16::from_be(port))
    };
    TrafficSelector::from_prefix(addr, prefix, proto, ports)
}

/// Decode a kernel selector into (source, destination) traffic selectors.
pub fn decode_selector(sel: &XfrmSelector) -> Result<(TrafficSelector, TrafficSelector)> {
    let saddr = to_ip(&sel.saddr, sel.family)?;
    let daddr = to_ip(&sel.daddr, sel.family)?;
    Ok((
        selector_range(saddr, sel.prefixlen_s, sel.proto, sel.sport, sel.sport_mask),
        selector_range(daddr, sel.prefixlen_d, sel.proto, sel.dport, sel.dport_mask),
    ))
}

fn template(request: &SaRequest, selector_family: u16) -> XfrmUserTmpl {
    let mut tmpl = XfrmUserTmpl {
        id: XfrmId {
            proto: request.protocol.number(),
            ..Default::default()
        },
        family: selector_family,
        reqid: request.request_id,
        mode: XFRM_MODE_TRANSPORT,
        share: XFRM_SHARE_ANY,
        aalgos: u32::MAX,
        ealgos: u32::MAX,
        calgos: u32::MAX,
        ..Default::default()
    };
    if let Some(t) = request.tunnel_endpoints() {
        tmpl.id.daddr = XfrmAddress::from_ip(&t.dst);
        tmpl.saddr = XfrmAddress::from_ip(&t.src);
        tmpl.family = family_of(&t.dst);
        tmpl.mode = XFRM_MODE_TUNNEL;
    }
    match request.level {
        IpsecLevel::Use => tmpl.optional = 1,
        IpsecLevel::Unique => tmpl.share = XFRM_SHARE_UNIQUE,
        IpsecLevel::Default | IpsecLevel::Require => {}
    }
    tmpl
}

fn decode_template(tmpl: &XfrmUserTmpl) -> Result<SaRequest> {
    let protocol = proto_from_xfrm(tmpl.id.proto)?;
    let level = if tmpl.optional != 0 {
        IpsecLevel::Use
    } else if tmpl.share == XFRM_SHARE_UNIQUE {
        IpsecLevel::Unique
    } else {
        IpsecLevel::Require
    };
    Ok(match tmpl.mode {
        XFRM_MODE_TUNNEL => SaRequest::tunnel(
            protocol,
            level,
            tmpl.reqid,
            to_ip(&tmpl.saddr, tmpl.family)?,
            to_ip(&tmpl.id.daddr, tmpl.family)?,
        ),
        _ => SaRequest::transport(protocol, level, tmpl.reqid),
    })
}

fn policy_type_attr(policy_type: PolicyType) -> XfrmUserpolicyType {
    XfrmUserpolicyType {
        kind: match policy_type {
            PolicyType::Main => XFRM_POLICY_TYPE_MAIN,
            PolicyType::Sub => XFRM_POLICY_TYPE_SUB,
        },
        ..Default::default()
    }
}

fn decode_policy_type(mut cur: Cursor<'_>) -> Result<PolicyType> {
    let upt: XfrmUserpolicyType = cur.read()?;
    Ok(match upt.kind {
        XFRM_POLICY_TYPE_SUB => PolicyType::Sub,
        _ => PolicyType::Main,
    })
}

impl XfrmCodec {
    /// ALLOCSPI for an SA from `src` to `dst`.
    pub fn encode_alloc_spi(&self, seq: u32, src: &IpAddr, dst: &IpAddr, protocol: IpsecProtocol) -> Vec<u8> {
        let family = family_of(src);
        let spi = XfrmUserspiInfo {
            info: XfrmUsersaInfo {
                sel: XfrmSelector {
                    family,
                    ..Default::default()
                },
                id: XfrmId {
                    daddr: XfrmAddress::from_ip(dst),
                    proto: protocol.number(),
                    ..Default::default()
                },
                saddr: XfrmAddress::from_ip(src),
                lft: XfrmLifetimeCfg::infinite(),
                family,
                ..Default::default()
            },
            min: self.spi_range.0,
            max: self.spi_range.1,
        };
        let mut b = MessageBuilder::new(XFRM_MSG_ALLOCSPI, NLM_F_REQUEST);
        b.set_seq(seq);
        b.append(&spi);
        b.finish()
    }

    /// NEWSA or UPDSA carrying the full SA parameters.
    ///
    /// Algorithms are resolved before anything is encoded.
    pub fn encode_sa(
        &self,
        msg_type: u16,
        seq: u32,
        src: &IpAddr,
        dst: &IpAddr,
        params: &ChildSaParams,
    ) -> Result<Vec<u8>> {
        params.validate()?;
        let family = family_of(src);
        let (soft_secs, soft_bytes) = params.lifetime.derived_soft(self.soft_ratio);
        let bytes_or_inf = |v: u64| if v == 0 { XFRM_INF } else { v };

        let info = XfrmUsersaInfo {
            sel: sa_selector(src, params),
            id: XfrmId {
                daddr: XfrmAddress::from_ip(dst),
                spi: params.spi.to_be(),
                proto: params.protocol.number(),
                ..Default::default()
            },
            saddr: XfrmAddress::from_ip(src),
            lft: XfrmLifetimeCfg {
                soft_byte_limit: bytes_or_inf(soft_bytes),
                hard_byte_limit: bytes_or_inf(params.lifetime.hard_bytes),
                soft_packet_limit: XFRM_INF,
                hard_packet_limit: XFRM_INF,
                soft_add_expires_seconds: soft_secs,
                hard_add_expires_seconds: params.lifetime.hard_seconds,
                ..Default::default()
            },
            reqid: params.reqid,
            family,
            mode: match params.mode {
                IpsecMode::Transport => XFRM_MODE_TRANSPORT,
                IpsecMode::Tunnel => XFRM_MODE_TUNNEL,
            },
            replay_window: params.replay_window.unwrap_or(self.replay_window),
            ..Default::default()
        };

        let mut b = request(msg_type, seq);
        b.append(&info);

        if let Some(enc) = &params.encryption {
            let name = alg_name(enc.algorithm.xfrm_name());
            match enc.algorithm.icv_bits() {
                Some(icv) => {
                    let head = XfrmAlgoAead {
                        alg_name: name,
                        alg_key_len: enc.key_bits(),
                        alg_icv_len: icv,
                    };
                    b.append_attr_with(XFRMA_ALG_AEAD, &head, &enc.key);
                }
                None => {
                    let head = XfrmAlgo {
                        alg_name: name,
                        alg_key_len: enc.key_bits(),
                    };
                    b.append_attr_with(XFRMA_ALG_CRYPT, &head, &enc.key);
                }
            }
        }
        if let Some(integ) = &params.integrity {
            let head = XfrmAlgoAuth {
                alg_name: alg_name(integ.algorithm.xfrm_name()),
                alg_key_len: integ.key_bits(),
                alg_trunc_len: integ.algorithm.truncation_bits(),
            };
            b.append_attr_with(XFRMA_ALG_AUTH_TRUNC, &head, &integ.key);
        }
        if let Some(nat) = params.nat {
            let encap = XfrmEncapTmpl {
                encap_type: UDP_ENCAP_ESPINUDP,
                encap_sport: nat.sport.to_be(),
                encap_dport: nat.dport.to_be(),
                ..Default::default()
            };
            b.append_attr_struct(XFRMA_ENCAP, &encap);
        }
        Ok(b.finish())
    }

    /// DELSA for one SA.
    pub fn encode_del_sa(&self, seq: u32, sa: &SaId) -> Vec<u8> {
        let id = XfrmUsersaId {
            daddr: XfrmAddress::from_ip(&sa.dst),
            spi: sa.spi.to_be(),
            family: family_of(&sa.dst),
            proto: sa.protocol.number(),
            ..Default::default()
        };
        let mut b = request(XFRM_MSG_DELSA, seq);
        b.append(&id);
        b.append_attr_struct(XFRMA_SRCADDR, &XfrmAddress::from_ip(&sa.src));
        b.finish()
    }

    /// NEWPOLICY or UPDPOLICY.
    pub fn encode_policy(&self, msg_type: u16, seq: u32, policy: &Policy) -> Vec<u8> {
        let sel = policy_selector(policy);
        let info = XfrmUserpolicyInfo {
            sel,
            lft: XfrmLifetimeCfg::infinite(),
            priority: policy.priority,
            index: policy.id,
            dir: dir_to_xfrm(policy.direction),
            action: match policy.action {
                PolicyAction::Discard => XFRM_POLICY_BLOCK,
                PolicyAction::Protect | PolicyAction::Bypass => XFRM_POLICY_ALLOW,
            },
            ..Default::default()
        };
        let mut b = request(msg_type, seq);
        b.append(&info);
        if policy.action == PolicyAction::Protect
            && let Some(req) = &policy.sa_request
        {
            b.append_attr_struct(XFRMA_TMPL, &template(req, sel.family));
        }
        if policy.policy_type == PolicyType::Sub {
            b.append_attr_struct(XFRMA_POLICY_TYPE, &policy_type_attr(policy.policy_type));
        }
        b.finish()
    }

    fn policy_id_message(&self, msg_type: u16, flags: u16, seq: u32, policy: &Policy) -> Vec<u8> {
        let id = XfrmUserpolicyId {
            sel: policy_selector(policy),
            index: 0,
            dir: dir_to_xfrm(policy.direction),
            ..Default::default()
        };
        let mut b = MessageBuilder::new(msg_type, flags);
        b.set_seq(seq);
        b.append(&id);
        if policy.policy_type == PolicyType::Sub {
            b.append_attr_struct(XFRMA_POLICY_TYPE, &policy_type_attr(policy.policy_type));
        }
        b.finish()
    }

    /// DELPOLICY by selector and direction.
    pub fn encode_del_policy(&self, seq: u32, policy: &Policy) -> Vec<u8> {
        self.policy_id_message(XFRM_MSG_DELPOLICY, NLM_F_REQUEST | NLM_F_ACK, seq, policy)
    }

    /// GETPOLICY for the single policy matching selector and direction.
    pub fn encode_get_policy(&self, seq: u32, policy: &Policy) -> Vec<u8> {
        self.policy_id_message(XFRM_MSG_GETPOLICY, NLM_F_REQUEST, seq, policy)
    }

    /// GETPOLICY dump of every table.
    pub fn encode_policy_dump(&self, seq: u32) -> Vec<u8> {
        let mut b = MessageBuilder::new(XFRM_MSG_GETPOLICY, NLM_F_REQUEST | NLM_F_DUMP);
        b.set_seq(seq);
        b.finish()
    }

    /// FLUSHSA for every IPsec protocol.
    pub fn encode_flush_sa(&self, seq: u32) -> Vec<u8> {
        let mut b = request(XFRM_MSG_FLUSHSA, seq);
        // IPSEC_PROTO_ANY
        b.append(&XfrmUsersaFlush { proto: 255 });
        b.finish()
    }

    /// FLUSHPOLICY of one policy table. Without a type attribute the
    /// kernel flushes only the main table.
    pub fn encode_flush_policy(&self, seq: u32, policy_type: PolicyType) -> Vec<u8> {
        let mut b = request(XFRM_MSG_FLUSHPOLICY, seq);
        if policy_type == PolicyType::Sub {
            b.append_attr_struct(XFRMA_POLICY_TYPE, &policy_type_attr(policy_type));
        }
        b.finish()
    }
}

/// Decode a NEWPOLICY payload (dump entry, GETPOLICY reply or request).
pub fn decode_policy(msg: &NlMessage<'_>) -> Result<Policy> {
    let mut cur = msg.cursor("xfrm_userpolicy_info");
    let info: XfrmUserpolicyInfo = cur.read()?;
    let sel = info.sel;
    let src = to_ip(&sel.saddr, sel.family)?;
    let dst = to_ip(&sel.daddr, sel.family)?;

    let mut policy = Policy::new(
        dir_from_xfrm(info.dir)?,
        (src, sel.prefixlen_s),
        (dst, sel.prefixlen_d),
    )
    .with_protocol(sel.proto, u16::from_be(sel.sport), u16::from_be(sel.dport));
    policy.id = info.index;
    policy.priority = info.priority;
    policy.action = if info.action == XFRM_POLICY_BLOCK {
        PolicyAction::Discard
    } else {
        PolicyAction::Bypass
    };

    for attr in Attrs::new(cur) {
        let (kind, mut payload) = attr?;
        match kind {
            XFRMA_TMPL => {
                // Only the outermost template is mirrored.
                let tmpl: XfrmUserTmpl = payload.read()?;
                if policy.sa_request.is_none() && info.action != XFRM_POLICY_BLOCK {
                    policy = policy.with_request(decode_template(&tmpl)?);
                    policy.autogen = tmpl.share == XFRM_SHARE_UNIQUE;
                }
            }
            XFRMA_POLICY_TYPE => policy.policy_type = decode_policy_type(payload)?,
            _ => {}
        }
    }
    Ok(policy)
}

fn decode_key<'a>(cur: &mut Cursor<'a>, bits: u32) -> Result<&'a [u8]> {
    cur.take((bits as usize).div_ceil(8))
}

/// Decode a NEWSA/UPDSA payload.
pub fn decode_sa(msg: &NlMessage<'_>) -> Result<SaEntry> {
    let mut cur = msg.cursor("xfrm_usersa_info");
    let info: XfrmUsersaInfo = cur.read()?;
    let protocol = proto_from_xfrm(info.id.proto)?;
    let src = to_ip(&info.saddr, info.family)?;
    let dst = to_ip(&info.id.daddr, info.family)?;
    let spi = u32::from_be(info.id.spi);
    let finite = |v: u64| if v == XFRM_INF { 0 } else { v };

    let mut params = ChildSaParams::esp(spi);
    params.protocol = protocol;
    params.reqid = info.reqid;
    params.mode = if info.mode == XFRM_MODE_TUNNEL {
        IpsecMode::Tunnel
    } else {
        IpsecMode::Transport
    };
    params.replay_window = Some(info.replay_window);
    params.lifetime = Lifetime {
        hard_seconds: info.lft.hard_add_expires_seconds,
        soft_seconds: Some(info.lft.soft_add_expires_seconds),
        hard_bytes: finite(info.lft.hard_byte_limit),
        soft_bytes: Some(finite(info.lft.soft_byte_limit)),
    };
    if info.sel.prefixlen_s != 0 || info.sel.prefixlen_d != 0 {
        params.selectors = Some(decode_selector(&info.sel)?);
    }

    for attr in Attrs::new(cur) {
        let (kind, mut payload) = attr?;
        match kind {
            XFRMA_ALG_CRYPT => {
                let head: XfrmAlgo = payload.read()?;
                let name = cstring(&head.alg_name);
                let alg = EncryptionAlgorithm::from_xfrm_name(&name, None)
                    .ok_or_else(|| Error::ProtocolViolation(format!("unknown cipher {}", name)))?;
                params.encryption = Some(Keyed::new(alg, decode_key(&mut payload, head.alg_key_len)?));
            }
            XFRMA_ALG_AEAD => {
                let head: XfrmAlgoAead = payload.read()?;
                let name = cstring(&head.alg_name);
                let alg = EncryptionAlgorithm::from_xfrm_name(&name, Some(head.alg_icv_len))
                    .ok_or_else(|| Error::ProtocolViolation(format!("unknown AEAD {}", name)))?;
                params.encryption = Some(Keyed::new(alg, decode_key(&mut payload, head.alg_key_len)?));
            }
            XFRMA_ALG_AUTH_TRUNC => {
                let head: XfrmAlgoAuth = payload.read()?;
                let name = cstring(&head.alg_name);
                let alg = IntegrityAlgorithm::from_xfrm_name(&name)
                    .ok_or_else(|| Error::ProtocolViolation(format!("unknown integrity {}", name)))?;
                params.integrity = Some(Keyed::new(alg, decode_key(&mut payload, head.alg_key_len)?));
            }
            XFRMA_ENCAP => {
                let encap: XfrmEncapTmpl = payload.read()?;
                params.nat = Some(NatTraversal {
                    sport: u16::from_be(encap.encap_sport),
                    dport: u16::from_be(encap.encap_dport),
                });
            }
            _ => {}
        }
    }

    Ok(SaEntry {
        id: SaId::new(src, dst, protocol, spi),
        params,
    })
}

/// Decode a broadcast message. `Ok(None)` for messages that carry no event.
pub fn decode_event(msg: &NlMessage<'_>) -> Result<Option<KernelEvent>> {
    match msg.header.nlmsg_type {
        XFRM_MSG_ACQUIRE => decode_acquire(msg).map(|a| Some(KernelEvent::Acquire(a))),
        XFRM_MSG_EXPIRE => decode_expire(msg).map(|e| Some(KernelEvent::Expire(e))),
        XFRM_MSG_POLEXPIRE => {
            let mut cur = msg.cursor("xfrm_user_polexpire");
            let pe: XfrmUserPolexpire = cur.read()?;
            tracing::debug!(index = pe.pol.index, hard = pe.hard, "ignoring policy expire");
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn decode_acquire(msg: &NlMessage<'_>) -> Result<Acquire> {
    let mut cur = msg.cursor("xfrm_user_acquire");
    let acq: XfrmUserAcquire = cur.read()?;
    let mut outer_family = acq.sel.family;
    let mut policy_type = PolicyType::Main;
    for attr in Attrs::new(cur) {
        let (kind, mut payload) = attr?;
        match kind {
            XFRMA_TMPL => {
                let tmpl: XfrmUserTmpl = payload.read()?;
                outer_family = tmpl.family;
            }
            XFRMA_POLICY_TYPE => policy_type = decode_policy_type(payload)?,
            _ => {}
        }
    }
    let (src_ts, dst_ts) = decode_selector(&acq.sel)?;
    Ok(Acquire {
        policy_id: Some(acq.policy.index),
        policy_type,
        direction: dir_from_xfrm(acq.policy.dir)?,
        src: to_ip(&acq.saddr, outer_family)?,
        dst: to_ip(&acq.id.daddr, outer_family)?,
        src_ts,
        dst_ts,
        protocol: proto_from_xfrm(acq.id.proto)?,
        seq: acq.seq,
    })
}

fn decode_expire(msg: &NlMessage<'_>) -> Result<Expire> {
    let mut cur = msg.cursor("xfrm_user_expire");
    let exp: XfrmUserExpire = cur.read()?;
    let state = exp.state;
    let protocol = proto_from_xfrm(state.id.proto)?;
    Ok(Expire {
        sa: SaId::new(
            to_ip(&state.saddr, state.family)?,
            to_ip(&state.id.daddr, state.family)?,
            protocol,
            u32::from_be(state.id.spi),
        ),
        reqid: state.reqid,
        hard: exp.hard != 0,
    })
}

/// Kernel-side encoders used by the simulated kernel and tests.
#[cfg(any(test, feature = "lab"))]
pub mod kernel {
    use zerocopy::FromZeros;

    use super::*;
    use crate::wire::message::{NLMSG_ERROR, NlMsgHdr};

    /// Broadcast ACQUIRE for `policy` triggered by a packet `src_host -> dst_host`.
    pub fn encode_acquire(seq: u32, policy: &Policy, src_host: &IpAddr, dst_host: &IpAddr) -> Vec<u8> {
        let family = family_of(src_host);
        let mut acq = XfrmUserAcquire {
            sel: XfrmSelector {
                daddr: XfrmAddress::from_ip(dst_host),
                saddr: XfrmAddress::from_ip(src_host),
                family,
                prefixlen_d: if family == AF_INET { 32 } else { 128 },
                prefixlen_s: if family == AF_INET { 32 } else { 128 },
                proto: policy.ip_protocol(),
                ..Default::default()
            },
            policy: XfrmUserpolicyInfo {
                sel: policy_selector(policy),
                priority: policy.priority,
                index: policy.id,
                dir: dir_to_xfrm(policy.direction),
                ..Default::default()
            },
            seq,
            ..Default::default()
        };
        let tmpl = policy.sa_request.as_ref().map(|req| template(req, family));
        if let Some(req) = &policy.sa_request {
            acq.id.proto = req.protocol.number();
            let (outer_src, outer_dst) = match req.tunnel_endpoints() {
                Some(t) => (t.src, t.dst),
                None => (*src_host, *dst_host),
            };
            acq.id.daddr = XfrmAddress::from_ip(&outer_dst);
            acq.saddr = XfrmAddress::from_ip(&outer_src);
        }
        let mut b = MessageBuilder::new(XFRM_MSG_ACQUIRE, 0);
        b.append(&acq);
        if let Some(tmpl) = &tmpl {
            b.append_attr_struct(XFRMA_TMPL, tmpl);
        }
        b.append_attr_struct(XFRMA_POLICY_TYPE, &policy_type_attr(policy.policy_type));
        b.finish()
    }

    /// Broadcast EXPIRE for one SA.
    pub fn encode_expire(sa: &SaId, reqid: u32, hard: bool) -> Vec<u8> {
        let family = family_of(&sa.src);
        let exp = XfrmUserExpire {
            state: XfrmUsersaInfo {
                sel: XfrmSelector {
                    family,
                    ..Default::default()
                },
                id: XfrmId {
                    daddr: XfrmAddress::from_ip(&sa.dst),
                    spi: sa.spi.to_be(),
                    proto: sa.protocol.number(),
                    ..Default::default()
                },
                saddr: XfrmAddress::from_ip(&sa.src),
                reqid,
                family,
                ..Default::default()
            },
            hard: hard as u8,
            ..Default::default()
        };
        let mut b = MessageBuilder::new(XFRM_MSG_EXPIRE, 0);
        b.append(&exp);
        b.finish()
    }

    /// NLMSG_ERROR acknowledging `request` with `errno` (0 = success).
    pub fn encode_ack(request: &NlMsgHdr, errno: i32) -> Vec<u8> {
        let mut b = MessageBuilder::new(NLMSG_ERROR, 0);
        b.set_seq(request.nlmsg_seq);
        b.set_pid(request.nlmsg_pid);
        b.append_bytes(&(-errno.abs()).to_ne_bytes());
        b.append(request);
        b.finish()
    }

    /// Zeroed algorithm header, for building malformed attributes in tests.
    pub fn empty_algo() -> XfrmAlgo {
        XfrmAlgo::new_zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::kernel::*;
    use super::*;
    use crate::model::selector::{IPPROTO_ICMP, IPPROTO_TCP};
    use crate::wire::{Messages, NlMsgHdr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn first(data: &[u8]) -> NlMessage<'_> {
        Messages::new(data).next().unwrap().unwrap()
    }

    fn aes_sha1() -> ChildSaParams {
        ChildSaParams::esp(0xc000_1234)
            .encryption(EncryptionAlgorithm::AesCbc, vec![0x11; 16])
            .integrity(IntegrityAlgorithm::HmacSha1_96, vec![0x22; 20])
            .lifetime(Lifetime {
                hard_seconds: 3600,
                hard_bytes: 1 << 30,
                ..Lifetime::default()
            })
            .reqid(7)
    }

    #[test]
    fn sa_round_trip() {
        let codec = XfrmCodec::default();
        let params = aes_sha1().nat(4500, 4500);
        let msg = codec
            .encode_sa(XFRM_MSG_NEWSA, 9, &ip("10.0.0.1"), &ip("10.0.0.2"), &params)
            .unwrap();
        let nl = first(&msg);
        assert_eq!(nl.header.nlmsg_type, XFRM_MSG_NEWSA);
        assert_eq!(nl.header.nlmsg_seq, 9);

        let sa = decode_sa(&nl).unwrap();
        assert_eq!(sa.id, SaId::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp, 0xc000_1234));
        assert_eq!(sa.params.encryption, params.encryption);
        assert_eq!(sa.params.integrity, params.integrity);
        assert_eq!(sa.params.reqid, 7);
        assert_eq!(sa.params.mode, IpsecMode::Tunnel);
        assert_eq!(sa.params.replay_window, Some(32));
        assert_eq!(sa.params.nat, Some(NatTraversal { sport: 4500, dport: 4500 }));
        assert_eq!(sa.params.lifetime.hard_seconds, 3600);
        assert_eq!(sa.params.lifetime.soft_seconds, Some(2880));
        assert_eq!(sa.params.lifetime.hard_bytes, 1 << 30);
    }

    #[test]
    fn aead_round_trip() {
        let codec = XfrmCodec::default();
        let params = ChildSaParams::esp(0x42)
            .encryption(EncryptionAlgorithm::AesGcm16, vec![0x33; 36])
            .mode(IpsecMode::Transport);
        let msg = codec
            .encode_sa(XFRM_MSG_UPDSA, 1, &ip("2001:db8::1"), &ip("2001:db8::2"), &params)
            .unwrap();
        let sa = decode_sa(&first(&msg)).unwrap();
        assert_eq!(sa.params.encryption, params.encryption);
        assert!(sa.params.integrity.is_none());
        assert_eq!(sa.params.mode, IpsecMode::Transport);
        assert_eq!(sa.id.dst, ip("2001:db8::2"));
    }

    #[test]
    fn invalid_sa_is_rejected_before_encoding() {
        let codec = XfrmCodec::default();
        let params = ChildSaParams::esp(1).encryption(EncryptionAlgorithm::AesCbc, vec![0; 16]);
        let err = codec
            .encode_sa(XFRM_MSG_NEWSA, 1, &ip("10.0.0.1"), &ip("10.0.0.2"), &params)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn alloc_spi_layout() {
        let codec = XfrmCodec::default();
        let msg = codec.encode_alloc_spi(3, &ip("10.0.0.1"), &ip("10.0.0.2"), IpsecProtocol::Esp);
        let nl = first(&msg);
        let spi: XfrmUserspiInfo = nl.cursor("spi").read().unwrap();
        assert_eq!(spi.min, 0xc000_0000);
        assert_eq!(spi.max, 0xcfff_ffff);
        assert_eq!(spi.info.id.proto, 50);
        assert_eq!(spi.info.family, AF_INET);
    }

    fn tunnel_policy() -> Policy {
        let mut p = Policy::new(Direction::Out, (ip("10.0.0.0"), 24), (ip("10.0.1.0"), 24))
            .with_request(SaRequest::tunnel(
                IpsecProtocol::Esp,
                IpsecLevel::Require,
                5,
                ip("192.0.2.1"),
                ip("192.0.2.2"),
            ))
            .with_protocol(IPPROTO_TCP, 0, 443);
        p.priority = 1000;
        p
    }

    #[test]
    fn policy_round_trip() {
        let codec = XfrmCodec::default();
        let policy = tunnel_policy();
        let msg = codec.encode_policy(XFRM_MSG_NEWPOLICY, 4, &policy);
        let decoded = decode_policy(&first(&msg)).unwrap();
        assert_eq!(decoded, policy);
        assert_eq!(decoded.priority, 1000);
        assert_eq!(decoded.action, PolicyAction::Protect);
        assert_eq!(decoded.sa_request.as_ref().unwrap().request_id, 5);
    }

    #[test]
    fn sub_policy_and_icmp_round_trip() {
        let codec = XfrmCodec::default();
        let mut policy = tunnel_policy().with_protocol(IPPROTO_ICMP, 8, 0);
        policy.policy_type = PolicyType::Sub;
        let decoded = decode_policy(&first(&codec.encode_policy(XFRM_MSG_NEWPOLICY, 1, &policy))).unwrap();
        assert_eq!(decoded.policy_type, PolicyType::Sub);
        assert_eq!(decoded.icmp_type(), Some(8));
        assert_eq!(decoded, policy);
    }

    #[test]
    fn bypass_and_discard_policies() {
        let codec = XfrmCodec::default();
        let mut drop = Policy::new(Direction::In, (ip("0.0.0.0"), 0), (ip("10.9.0.0"), 16));
        drop.action = PolicyAction::Discard;
        let decoded = decode_policy(&first(&codec.encode_policy(XFRM_MSG_NEWPOLICY, 1, &drop))).unwrap();
        assert_eq!(decoded.action, PolicyAction::Discard);
        assert!(decoded.sa_request.is_none());

        let pass = Policy::new(Direction::Forward, (ip("10.0.0.0"), 8), (ip("10.0.0.0"), 8));
        let decoded = decode_policy(&first(&codec.encode_policy(XFRM_MSG_NEWPOLICY, 1, &pass))).unwrap();
        assert_eq!(decoded.action, PolicyAction::Bypass);
        assert_eq!(decoded.direction, Direction::Forward);
    }

    #[test]
    fn acquire_decodes_policy_index_and_tunnel() {
        let mut policy = tunnel_policy();
        policy.id = 0x1a9;
        let msg = encode_acquire(77, &policy, &ip("10.0.0.5"), &ip("10.0.1.9"));
        let Some(KernelEvent::Acquire(acq)) = decode_event(&first(&msg)).unwrap() else {
            panic!("expected acquire");
        };
        assert_eq!(acq.policy_id, Some(0x1a9));
        assert_eq!(acq.direction, Direction::Out);
        assert_eq!(acq.src, ip("192.0.2.1"));
        assert_eq!(acq.dst, ip("192.0.2.2"));
        assert_eq!(acq.src_ts, TrafficSelector::from_prefix(ip("10.0.0.5"), 32, IPPROTO_TCP, PortRange::ANY));
        assert_eq!(acq.protocol, IpsecProtocol::Esp);
        assert_eq!(acq.seq, 77);
    }

    #[test]
    fn expire_decodes_hard_flag() {
        let sa = SaId::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp, 0xc0000001);
        let msg = encode_expire(&sa, 3, true);
        assert_eq!(
            decode_event(&first(&msg)).unwrap(),
            Some(KernelEvent::Expire(Expire { sa, reqid: 3, hard: true }))
        );
    }

    #[test]
    fn truncated_event_is_violation() {
        let sa = SaId::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp, 1);
        let mut msg = encode_expire(&sa, 0, false);
        // Shrink the declared length so the payload no longer holds the struct.
        msg.truncate(100);
        msg[0..4].copy_from_slice(&100u32.to_ne_bytes());
        let err = decode_event(&first(&msg)).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn overrunning_algorithm_attribute_is_violation() {
        let mut b = MessageBuilder::new(XFRM_MSG_NEWSA, 0);
        b.append(&XfrmUsersaInfo {
            family: AF_INET,
            id: XfrmId {
                proto: 50,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut algo = empty_algo();
        algo.alg_name = alg_name("cbc(aes)");
        algo.alg_key_len = 256;
        // Key claims 32 bytes, only 4 follow.
        b.append_attr_with(XFRMA_ALG_CRYPT, &algo, &[0; 4]);
        let msg = b.finish();
        assert!(decode_sa(&first(&msg)).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn ack_echoes_request() {
        let req = NlMsgHdr {
            nlmsg_len: 16,
            nlmsg_type: XFRM_MSG_DELSA,
            nlmsg_flags: 5,
            nlmsg_seq: 42,
            nlmsg_pid: 0,
        };
        let ack = encode_ack(&req, libc::ESRCH);
        let nl = first(&ack);
        assert!(nl.header.is_error());
        assert_eq!(nl.header.nlmsg_seq, 42);
        assert_eq!(nl.error_code().unwrap(), -libc::ESRCH);
    }

    #[test]
    fn sub_table_flush_names_its_table() {
        let codec = XfrmCodec::default();
        let main = codec.encode_flush_policy(1, PolicyType::Main);
        assert!(first(&main).payload.is_empty());

        let sub = codec.encode_flush_policy(2, PolicyType::Sub);
        let nl = first(&sub);
        assert_eq!(nl.header.nlmsg_type, XFRM_MSG_FLUSHPOLICY);
        let (kind, payload) = Attrs::new(nl.cursor("flush")).next().unwrap().unwrap();
        assert_eq!(kind, XFRMA_POLICY_TYPE);
        assert_eq!(decode_policy_type(payload).unwrap(), PolicyType::Sub);
    }
}
