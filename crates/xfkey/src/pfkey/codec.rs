//! PF_KEY v2 message encoding and decoding.
//!
//! A message is a [`SadbMsg`] followed by extensions, each starting with
//! a length (in 64-bit words) and a type. Decoding walks the extensions
//! with bounded [`Cursor`]s; an extension overrunning the message is a
//! protocol violation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::{Immutable, IntoBytes};

use super::types::*;
use crate::error::{Error, Result};
use crate::event::{Acquire, Expire, KernelEvent};
use crate::model::selector::IPPROTO_ANY;
use crate::model::{
    ChildSaParams, Direction, EncryptionAlgorithm, IntegrityAlgorithm, IpsecLevel, IpsecMode,
    IpsecProtocol, Keyed, Lifetime, NatTraversal, Policy, PolicyAction, PolicyType, SaEntry, SaId,
    SaRequest, TrafficSelector,
};
use crate::wire::Cursor;

/// Upper-layer protocol wildcard in address extensions.
pub(crate) const IPSEC_ULPROTO_ANY: u8 = 255;

const AF_INET: u16 = libc::AF_INET as u16;
const AF_INET6: u16 = libc::AF_INET6 as u16;

/// Encoding parameters taken from the controller configuration.
#[derive(Debug, Clone, Copy)]
pub struct PfkeyCodec {
    /// SPI allocation range for GETSPI.
    pub spi_range: (u32, u32),
    /// Soft lifetime ratio used when upstream supplies no soft limit.
    pub soft_ratio: f64,
    /// Replay window when the SA parameters carry none.
    pub replay_window: u8,
}

impl Default for PfkeyCodec {
    fn default() -> Self {
        Self {
            spi_range: (0xc000_0000, 0xcfff_ffff),
            soft_ratio: 0.8,
            replay_window: 32,
        }
    }
}

/// Builder for one PF_KEY message.
#[derive(Debug, Clone)]
pub struct PfkeyBuilder {
    buf: Vec<u8>,
}

impl PfkeyBuilder {
    /// Start a message with the base header.
    pub fn new(msg_type: u8, satype: u8, seq: u32, pid: u32) -> Self {
        let header = SadbMsg {
            version: PF_KEY_V2,
            msg_type,
            satype,
            seq,
            pid,
            ..Default::default()
        };
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(header.as_bytes());
        Self { buf }
    }

    /// Set the errno field (kernel replies).
    pub fn errno(mut self, errno: u8) -> Self {
        self.buf[2] = errno;
        self
    }

    /// Append an extension: fixed header `head` followed by `tail`, padded
    /// to 64 bits. The length field is filled in.
    pub fn ext<T: IntoBytes + Immutable>(&mut self, head: &T, tail: &[u8]) -> &mut Self {
        let start = self.buf.len();
        self.buf.extend_from_slice(head.as_bytes());
        self.buf.extend_from_slice(tail);
        self.buf.resize(start + pfkey_align(self.buf.len() - start), 0);
        let words = ((self.buf.len() - start) / PFKEY_ALIGN) as u16;
        self.buf[start..start + 2].copy_from_slice(&words.to_ne_bytes());
        self
    }

    /// Append an address extension.
    pub fn address(&mut self, exttype: u16, addr: &IpAddr, prefixlen: u8, proto: u8, port: u16) -> &mut Self {
        let head = SadbAddress {
            exttype,
            proto,
            prefixlen,
            ..Default::default()
        };
        self.ext(&head, &sockaddr(addr, port))
    }

    /// Finish the message, filling in the total length.
    pub fn finish(mut self) -> Vec<u8> {
        let words = (self.buf.len() / PFKEY_ALIGN) as u16;
        self.buf[4..6].copy_from_slice(&words.to_ne_bytes());
        self.buf
    }
}

/// Encode a `sockaddr_in` / `sockaddr_in6`.
pub fn sockaddr(addr: &IpAddr, port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(28);
    match addr {
        IpAddr::V4(a) => {
            out.extend_from_slice(&AF_INET.to_ne_bytes());
            out.extend_from_slice(&port.to_be_bytes());
            out.extend_from_slice(&a.octets());
            out.extend_from_slice(&[0; 8]);
        }
        IpAddr::V6(a) => {
            out.extend_from_slice(&AF_INET6.to_ne_bytes());
            out.extend_from_slice(&port.to_be_bytes());
            out.extend_from_slice(&[0; 4]);
            out.extend_from_slice(&a.octets());
            out.extend_from_slice(&[0; 4]);
        }
    }
    out
}

/// Decode a sockaddr, returning the address and port.
pub fn decode_sockaddr(cur: &mut Cursor<'_>) -> Result<(IpAddr, u16)> {
    let family = cur.read_u16()?;
    let port_bytes = cur.take(2)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    match family {
        AF_INET => {
            let raw = cur.take(4)?;
            cur.skip(8)?;
            Ok((IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])), port))
        }
        AF_INET6 => {
            cur.skip(4)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(cur.take(16)?);
            cur.skip(4)?;
            Ok((IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::ProtocolViolation(format!(
            "unknown sockaddr family {}",
            other
        ))),
    }
}

pub(crate) fn full_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// SA type for an IPsec protocol.
pub fn satype(protocol: IpsecProtocol) -> u8 {
    match protocol {
        IpsecProtocol::Ah => SADB_SATYPE_AH,
        IpsecProtocol::Esp => SADB_SATYPE_ESP,
    }
}

fn protocol_from_satype(satype: u8) -> Result<IpsecProtocol> {
    match satype {
        SADB_SATYPE_AH => Ok(IpsecProtocol::Ah),
        SADB_SATYPE_ESP => Ok(IpsecProtocol::Esp),
        other => Err(Error::ProtocolViolation(format!("unsupported SA type {}", other))),
    }
}

fn mode_to_pfkey(mode: IpsecMode) -> u8 {
    match mode {
        IpsecMode::Transport => IPSEC_MODE_TRANSPORT,
        IpsecMode::Tunnel => IPSEC_MODE_TUNNEL,
    }
}

pub(crate) fn dir_to_pfkey(dir: Direction) -> u8 {
    match dir {
        Direction::In => IPSEC_DIR_INBOUND,
        Direction::Out => IPSEC_DIR_OUTBOUND,
        Direction::Forward => IPSEC_DIR_FWD,
    }
}

fn dir_from_pfkey(dir: u8) -> Result<Direction> {
    match dir {
        IPSEC_DIR_INBOUND => Ok(Direction::In),
        IPSEC_DIR_OUTBOUND => Ok(Direction::Out),
        IPSEC_DIR_FWD => Ok(Direction::Forward),
        other => Err(Error::ProtocolViolation(format!(
            "unknown policy direction {}",
            other
        ))),
    }
}

fn level_to_pfkey(level: IpsecLevel) -> u8 {
    match level {
        IpsecLevel::Default => IPSEC_LEVEL_DEFAULT,
        IpsecLevel::Use => IPSEC_LEVEL_USE,
        IpsecLevel::Require => IPSEC_LEVEL_REQUIRE,
        IpsecLevel::Unique => IPSEC_LEVEL_UNIQUE,
    }
}

fn level_from_pfkey(level: u8) -> IpsecLevel {
    match level {
        IPSEC_LEVEL_USE => IpsecLevel::Use,
        IPSEC_LEVEL_REQUIRE => IpsecLevel::Require,
        IPSEC_LEVEL_UNIQUE => IpsecLevel::Unique,
        _ => IpsecLevel::Default,
    }
}

fn key_tail(key: &[u8]) -> Vec<u8> {
    let mut tail = key.to_vec();
    tail.resize(pfkey_align(key.len()), 0);
    tail
}

fn lifetime_ext(exttype: u16, bytes: u64, seconds: u64) -> SadbLifetime {
    SadbLifetime {
        exttype,
        bytes,
        addtime: seconds,
        ..Default::default()
    }
}

fn ipsec_request(request: &SaRequest) -> (SadbXIpsecrequest, Vec<u8>) {
    let mut tail = Vec::new();
    if let Some(t) = request.tunnel_endpoints() {
        tail.extend_from_slice(&sockaddr(&t.src, 0));
        tail.extend_from_slice(&sockaddr(&t.dst, 0));
    }
    let len = pfkey_align(std::mem::size_of::<SadbXIpsecrequest>() + tail.len());
    tail.resize(len - std::mem::size_of::<SadbXIpsecrequest>(), 0);
    let head = SadbXIpsecrequest {
        len: len as u16,
        proto: request.protocol.number() as u16,
        mode: mode_to_pfkey(request.mode()),
        level: level_to_pfkey(request.level),
        reqid: request.request_id,
        ..Default::default()
    };
    (head, tail)
}

impl PfkeyCodec {
    /// GETSPI reserving an SPI from the configured range.
    pub fn encode_get_spi(
        &self,
        seq: u32,
        pid: u32,
        src: &IpAddr,
        dst: &IpAddr,
        protocol: IpsecProtocol,
        reqid: u32,
    ) -> Vec<u8> {
        let mut b = PfkeyBuilder::new(SADB_GETSPI, satype(protocol), seq, pid);
        b.ext(
            &SadbXSa2 {
                exttype: SADB_X_EXT_SA2,
                mode: IPSEC_MODE_ANY,
                reqid,
                ..Default::default()
            },
            &[],
        );
        b.address(SADB_EXT_ADDRESS_SRC, src, full_prefix(src), IPSEC_ULPROTO_ANY, 0);
        b.address(SADB_EXT_ADDRESS_DST, dst, full_prefix(dst), IPSEC_ULPROTO_ANY, 0);
        b.ext(
            &SadbSpirange {
                exttype: SADB_EXT_SPIRANGE,
                min: self.spi_range.0,
                max: self.spi_range.1,
                ..Default::default()
            },
            &[],
        );
        b.finish()
    }

    /// ADD or UPDATE carrying the full SA parameters.
    ///
    /// Algorithms are resolved to PF_KEY codes before anything is encoded.
    pub fn encode_sa(
        &self,
        msg_type: u8,
        seq: u32,
        pid: u32,
        src: &IpAddr,
        dst: &IpAddr,
        params: &ChildSaParams,
    ) -> Result<Vec<u8>> {
        params.validate()?;
        let encrypt = match &params.encryption {
            Some(enc) => enc.algorithm.pfkey_id()?,
            None => SADB_EALG_NONE,
        };
        let auth = match &params.integrity {
            Some(integ) => integ.algorithm.pfkey_id()?,
            None => SADB_AALG_NONE,
        };

        let mut b = PfkeyBuilder::new(msg_type, satype(params.protocol), seq, pid);
        b.ext(
            &SadbSa {
                exttype: SADB_EXT_SA,
                spi: params.spi.to_be(),
                replay: params.replay_window.unwrap_or(self.replay_window),
                state: SADB_SASTATE_MATURE,
                auth,
                encrypt,
                ..Default::default()
            },
            &[],
        );
        b.ext(
            &SadbXSa2 {
                exttype: SADB_X_EXT_SA2,
                mode: mode_to_pfkey(params.mode),
                reqid: params.reqid,
                ..Default::default()
            },
            &[],
        );
        let lt = &params.lifetime;
        b.ext(&lifetime_ext(SADB_EXT_LIFETIME_HARD, lt.hard_bytes, lt.hard_seconds), &[]);
        b.ext(
            &lifetime_ext(
                SADB_EXT_LIFETIME_SOFT,
                lt.soft_bytes_or(self.soft_ratio),
                lt.soft_seconds_or(self.soft_ratio),
            ),
            &[],
        );
        b.address(SADB_EXT_ADDRESS_SRC, src, full_prefix(src), IPSEC_ULPROTO_ANY, 0);
        b.address(SADB_EXT_ADDRESS_DST, dst, full_prefix(dst), IPSEC_ULPROTO_ANY, 0);
        if let Some(integ) = &params.integrity {
            b.ext(
                &SadbKey {
                    exttype: SADB_EXT_KEY_AUTH,
                    bits: integ.key_bits() as u16,
                    ..Default::default()
                },
                &key_tail(&integ.key),
            );
        }
        if let Some(enc) = &params.encryption {
            b.ext(
                &SadbKey {
                    exttype: SADB_EXT_KEY_ENCRYPT,
                    bits: enc.key_bits() as u16,
                    ..Default::default()
                },
                &key_tail(&enc.key),
            );
        }
        if let Some(nat) = params.nat {
            b.ext(
                &SadbXNatTType {
                    exttype: SADB_X_EXT_NAT_T_TYPE,
                    nat_t_type: UDP_ENCAP_ESPINUDP,
                    ..Default::default()
                },
                &[],
            );
            b.ext(
                &SadbXNatTPort {
                    exttype: SADB_X_EXT_NAT_T_SPORT,
                    port: nat.sport.to_be(),
                    ..Default::default()
                },
                &[],
            );
            b.ext(
                &SadbXNatTPort {
                    exttype: SADB_X_EXT_NAT_T_DPORT,
                    port: nat.dport.to_be(),
                    ..Default::default()
                },
                &[],
            );
        }
        Ok(b.finish())
    }

    /// DELETE for one SA.
    pub fn encode_delete(&self, seq: u32, pid: u32, sa: &SaId) -> Vec<u8> {
        let mut b = PfkeyBuilder::new(SADB_DELETE, satype(sa.protocol), seq, pid);
        b.ext(
            &SadbSa {
                exttype: SADB_EXT_SA,
                spi: sa.spi.to_be(),
                ..Default::default()
            },
            &[],
        );
        b.address(SADB_EXT_ADDRESS_SRC, &sa.src, full_prefix(&sa.src), IPSEC_ULPROTO_ANY, 0);
        b.address(SADB_EXT_ADDRESS_DST, &sa.dst, full_prefix(&sa.dst), IPSEC_ULPROTO_ANY, 0);
        b.finish()
    }

    fn policy_message(&self, msg_type: u8, seq: u32, pid: u32, policy: &Policy, with_requests: bool) -> Result<Vec<u8>> {
        if policy.policy_type == PolicyType::Sub {
            return Err(Error::Config("PF_KEY has no sub-policy table".into()));
        }
        let policy_type = match policy.action {
            PolicyAction::Protect => IPSEC_POLICY_IPSEC,
            PolicyAction::Bypass => IPSEC_POLICY_NONE,
            PolicyAction::Discard => IPSEC_POLICY_DISCARD,
        };
        let mut tail = Vec::new();
        if with_requests
            && policy.action == PolicyAction::Protect
            && let Some(req) = &policy.sa_request
        {
            let (head, rest) = ipsec_request(req);
            tail.extend_from_slice(head.as_bytes());
            tail.extend_from_slice(&rest);
        }

        let mut b = PfkeyBuilder::new(msg_type, SADB_SATYPE_UNSPEC, seq, pid);
        b.ext(
            &SadbXPolicy {
                exttype: SADB_X_EXT_POLICY,
                policy_type,
                dir: dir_to_pfkey(policy.direction),
                id: policy.id,
                priority: policy.priority,
                ..Default::default()
            },
            &tail,
        );
        let (sport, dport) = policy.ports().raw();
        let proto = match policy.ip_protocol() {
            IPPROTO_ANY => IPSEC_ULPROTO_ANY,
            p => p,
        };
        b.address(SADB_EXT_ADDRESS_SRC, &policy.src_addr, policy.src_prefix, proto, sport);
        b.address(SADB_EXT_ADDRESS_DST, &policy.dst_addr, policy.dst_prefix, proto, dport);
        Ok(b.finish())
    }

    /// X_SPDADD or X_SPDUPDATE.
    pub fn encode_policy(&self, msg_type: u8, seq: u32, pid: u32, policy: &Policy) -> Result<Vec<u8>> {
        self.policy_message(msg_type, seq, pid, policy, true)
    }

    /// X_SPDDELETE by selector and direction.
    pub fn encode_del_policy(&self, seq: u32, pid: u32, policy: &Policy) -> Result<Vec<u8>> {
        self.policy_message(SADB_X_SPDDELETE, seq, pid, policy, false)
    }

    /// X_SPDDUMP.
    pub fn encode_policy_dump(&self, seq: u32, pid: u32) -> Vec<u8> {
        PfkeyBuilder::new(SADB_X_SPDDUMP, SADB_SATYPE_UNSPEC, seq, pid).finish()
    }

    /// FLUSH of every SA.
    pub fn encode_flush_sa(&self, seq: u32, pid: u32) -> Vec<u8> {
        PfkeyBuilder::new(SADB_FLUSH, SADB_SATYPE_UNSPEC, seq, pid).finish()
    }

    /// X_SPDFLUSH.
    pub fn encode_flush_policy(&self, seq: u32, pid: u32) -> Vec<u8> {
        PfkeyBuilder::new(SADB_X_SPDFLUSH, SADB_SATYPE_UNSPEC, seq, pid).finish()
    }

    /// REGISTER, subscribing the socket to ACQUIRE/EXPIRE for `protocol`.
    pub fn encode_register(&self, seq: u32, pid: u32, protocol: IpsecProtocol) -> Vec<u8> {
        PfkeyBuilder::new(SADB_REGISTER, satype(protocol), seq, pid).finish()
    }
}

/// A parsed PF_KEY message with its extensions indexed by type.
#[derive(Debug, Clone)]
pub struct PfkeyMessage<'a> {
    /// Base header.
    pub header: SadbMsg,
    exts: Vec<Option<Cursor<'a>>>,
}

impl<'a> PfkeyMessage<'a> {
    /// Parse a datagram, validating every extension boundary.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut cur = Cursor::new(data, "sadb_msg");
        let header: SadbMsg = cur.read()?;
        let total = header.len as usize * PFKEY_ALIGN;
        if total < std::mem::size_of::<SadbMsg>() || total > data.len() {
            return Err(Error::Truncated {
                expected: total,
                actual: data.len(),
            });
        }
        let mut body = Cursor::new(&data[std::mem::size_of::<SadbMsg>()..total], "sadb_ext");
        let mut exts: Vec<Option<Cursor<'a>>> = vec![None; SADB_EXT_MAX as usize + 1];

        while !body.is_empty() {
            let words = body.peek_u16()? as usize;
            if words == 0 {
                return Err(Error::ProtocolViolation("zero-length extension".into()));
            }
            let ext = body.sub(words * PFKEY_ALIGN, "sadb_ext")?;
            let hdr: SadbExt = ext.clone().read()?;
            let slot = hdr.ext_type as usize;
            if slot == 0 {
                return Err(Error::ProtocolViolation("extension type 0".into()));
            }
            if let Some(entry) = exts.get_mut(slot) {
                if entry.is_some() {
                    return Err(Error::ProtocolViolation(format!(
                        "duplicate extension {}",
                        hdr.ext_type
                    )));
                }
                *entry = Some(ext);
            }
        }
        Ok(Self { header, exts })
    }

    /// Cursor over extension `ext_type` (header included), if present.
    pub fn ext(&self, ext_type: u16) -> Option<Cursor<'a>> {
        self.exts.get(ext_type as usize).and_then(|e| e.clone())
    }

    fn require(&self, ext_type: u16, what: &str) -> Result<Cursor<'a>> {
        self.ext(ext_type).ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "message type {} without {} extension",
                self.header.msg_type, what
            ))
        })
    }

    /// Decode an address extension: (address, prefix length, proto, port).
    pub fn address(&self, ext_type: u16) -> Result<(IpAddr, u8, u8, u16)> {
        let mut cur = self.require(ext_type, "address")?;
        let head: SadbAddress = cur.read()?;
        let (addr, port) = decode_sockaddr(&mut cur)?;
        Ok((addr, head.prefixlen, head.proto, port))
    }

    /// SPI of the SA extension.
    pub fn spi(&self) -> Result<u32> {
        let sa: SadbSa = self.require(SADB_EXT_SA, "SA")?.read()?;
        Ok(u32::from_be(sa.spi))
    }

    /// IPsec protocol from the SA type.
    pub fn protocol(&self) -> Result<IpsecProtocol> {
        protocol_from_satype(self.header.satype)
    }
}

fn decode_request(cur: &mut Cursor<'_>) -> Result<SaRequest> {
    let len = cur.peek_u16()? as usize;
    if len < std::mem::size_of::<SadbXIpsecrequest>() {
        return Err(Error::ProtocolViolation(format!(
            "ipsecrequest length {} shorter than header",
            len
        )));
    }
    let mut rq = cur.sub(len, "sadb_x_ipsecrequest")?;
    let head: SadbXIpsecrequest = rq.read()?;
    let protocol = IpsecProtocol::from_number(head.proto as u8).ok_or_else(|| {
        Error::ProtocolViolation(format!("unsupported request protocol {}", head.proto))
    })?;
    let level = level_from_pfkey(head.level);
    Ok(match head.mode {
        IPSEC_MODE_TUNNEL => {
            let (src, _) = decode_sockaddr(&mut rq)?;
            let (dst, _) = decode_sockaddr(&mut rq)?;
            SaRequest::tunnel(protocol, level, head.reqid, src, dst)
        }
        _ => SaRequest::transport(protocol, level, head.reqid),
    })
}

/// Decode a policy from an X_SPDDUMP / X_SPDADD message.
pub fn decode_policy(msg: &PfkeyMessage<'_>) -> Result<Policy> {
    let mut pol_cur = msg.require(SADB_X_EXT_POLICY, "policy")?;
    let pol: SadbXPolicy = pol_cur.read()?;
    let (src, src_prefix, proto, sport) = msg.address(SADB_EXT_ADDRESS_SRC)?;
    let (dst, dst_prefix, _, dport) = msg.address(SADB_EXT_ADDRESS_DST)?;
    let ip_protocol = if proto == IPSEC_ULPROTO_ANY { IPPROTO_ANY } else { proto };

    let mut policy = Policy::new(dir_from_pfkey(pol.dir)?, (src, src_prefix), (dst, dst_prefix))
        .with_protocol(ip_protocol, sport, dport);
    policy.id = pol.id;
    policy.priority = pol.priority;
    policy.action = match pol.policy_type {
        IPSEC_POLICY_DISCARD => PolicyAction::Discard,
        IPSEC_POLICY_IPSEC => PolicyAction::Protect,
        _ => PolicyAction::Bypass,
    };
    if policy.action == PolicyAction::Protect && pol_cur.remaining() >= std::mem::size_of::<SadbXIpsecrequest>() {
        // Only the outermost request is mirrored.
        let request = decode_request(&mut pol_cur)?;
        policy.autogen = request.level == IpsecLevel::Unique;
        policy = policy.with_request(request);
    }
    Ok(policy)
}

fn decode_key<'a>(msg: &PfkeyMessage<'a>, ext_type: u16) -> Result<Option<&'a [u8]>> {
    let Some(mut cur) = msg.ext(ext_type) else {
        return Ok(None);
    };
    let head: SadbKey = cur.read()?;
    Ok(Some(cur.take((head.bits as usize).div_ceil(8))?))
}

/// Decode an ADD/UPDATE message.
pub fn decode_sa(msg: &PfkeyMessage<'_>) -> Result<SaEntry> {
    let protocol = msg.protocol()?;
    let sa: SadbSa = msg.require(SADB_EXT_SA, "SA")?.read()?;
    let (src, ..) = msg.address(SADB_EXT_ADDRESS_SRC)?;
    let (dst, ..) = msg.address(SADB_EXT_ADDRESS_DST)?;
    let spi = u32::from_be(sa.spi);

    let mut params = ChildSaParams::esp(spi);
    params.protocol = protocol;
    params.replay_window = Some(sa.replay);
    if let Some(mut cur) = msg.ext(SADB_X_EXT_SA2) {
        let sa2: SadbXSa2 = cur.read()?;
        params.reqid = sa2.reqid;
        params.mode = if sa2.mode == IPSEC_MODE_TRANSPORT {
            IpsecMode::Transport
        } else {
            IpsecMode::Tunnel
        };
    }
    let mut lifetime = Lifetime::default();
    if let Some(mut cur) = msg.ext(SADB_EXT_LIFETIME_HARD) {
        let lt: SadbLifetime = cur.read()?;
        lifetime.hard_seconds = lt.addtime;
        lifetime.hard_bytes = lt.bytes;
    }
    if let Some(mut cur) = msg.ext(SADB_EXT_LIFETIME_SOFT) {
        let lt: SadbLifetime = cur.read()?;
        lifetime.soft_seconds = Some(lt.addtime);
        lifetime.soft_bytes = Some(lt.bytes);
    }
    params.lifetime = lifetime;

    if sa.encrypt != SADB_EALG_NONE {
        let alg = EncryptionAlgorithm::from_pfkey_id(sa.encrypt).ok_or_else(|| {
            Error::ProtocolViolation(format!("unknown encryption algorithm {}", sa.encrypt))
        })?;
        let key = decode_key(msg, SADB_EXT_KEY_ENCRYPT)?.unwrap_or_default();
        params.encryption = Some(Keyed::new(alg, key));
    }
    if sa.auth != SADB_AALG_NONE {
        let alg = IntegrityAlgorithm::from_pfkey_id(sa.auth).ok_or_else(|| {
            Error::ProtocolViolation(format!("unknown integrity algorithm {}", sa.auth))
        })?;
        let key = decode_key(msg, SADB_EXT_KEY_AUTH)?.unwrap_or_default();
        params.integrity = Some(Keyed::new(alg, key));
    }
    if msg.ext(SADB_X_EXT_NAT_T_TYPE).is_some() {
        let port = |ext| -> Result<u16> {
            Ok(match msg.ext(ext) {
                Some(mut cur) => u16::from_be(cur.read::<SadbXNatTPort>()?.port),
                None => 0,
            })
        };
        params.nat = Some(NatTraversal {
            sport: port(SADB_X_EXT_NAT_T_SPORT)?,
            dport: port(SADB_X_EXT_NAT_T_DPORT)?,
        });
    }

    Ok(SaEntry {
        id: SaId::new(src, dst, protocol, spi),
        params,
    })
}

/// Decode a broadcast message. `Ok(None)` for messages that carry no event.
pub fn decode_event(msg: &PfkeyMessage<'_>) -> Result<Option<KernelEvent>> {
    match msg.header.msg_type {
        SADB_ACQUIRE => decode_acquire(msg).map(|a| Some(KernelEvent::Acquire(a))),
        SADB_EXPIRE => decode_expire(msg).map(|e| Some(KernelEvent::Expire(e))),
        _ => Ok(None),
    }
}

fn decode_acquire(msg: &PfkeyMessage<'_>) -> Result<Acquire> {
    let protocol = msg.protocol()?;
    let (src, ..) = msg.address(SADB_EXT_ADDRESS_SRC)?;
    let (dst, ..) = msg.address(SADB_EXT_ADDRESS_DST)?;
    let (policy_id, direction) = match msg.ext(SADB_X_EXT_POLICY) {
        Some(mut cur) => {
            let pol: SadbXPolicy = cur.read()?;
            (Some(pol.id), dir_from_pfkey(pol.dir)?)
        }
        None => (None, Direction::Out),
    };
    Ok(Acquire {
        policy_id,
        policy_type: PolicyType::Main,
        direction,
        src,
        dst,
        // PF_KEY carries no packet selector; the policy supplies it.
        src_ts: TrafficSelector::host(src),
        dst_ts: TrafficSelector::host(dst),
        protocol,
        seq: msg.header.seq,
    })
}

fn decode_expire(msg: &PfkeyMessage<'_>) -> Result<Expire> {
    let protocol = msg.protocol()?;
    let spi = msg.spi()?;
    let (src, ..) = msg.address(SADB_EXT_ADDRESS_SRC)?;
    let (dst, ..) = msg.address(SADB_EXT_ADDRESS_DST)?;
    let reqid = match msg.ext(SADB_X_EXT_SA2) {
        Some(mut cur) => cur.read::<SadbXSa2>()?.reqid,
        None => 0,
    };
    Ok(Expire {
        sa: SaId::new(src, dst, protocol, spi),
        reqid,
        hard: msg.ext(SADB_EXT_LIFETIME_HARD).is_some(),
    })
}

/// Kernel-side encoders used by the simulated kernel and tests.
#[cfg(any(test, feature = "lab"))]
pub mod kernel {
    use super::*;

    /// Broadcast ACQUIRE for `policy` (outer addresses from its tunnel, or
    /// the packet addresses in transport mode).
    pub fn encode_acquire(seq: u32, policy: &Policy, src_host: &IpAddr, dst_host: &IpAddr) -> Vec<u8> {
        let (protocol, src, dst) = match &policy.sa_request {
            Some(req) => match req.tunnel_endpoints() {
                Some(t) => (req.protocol, t.src, t.dst),
                None => (req.protocol, *src_host, *dst_host),
            },
            None => (IpsecProtocol::Esp, *src_host, *dst_host),
        };
        let mut b = PfkeyBuilder::new(SADB_ACQUIRE, satype(protocol), seq, 0);
        b.address(SADB_EXT_ADDRESS_SRC, &src, full_prefix(&src), IPSEC_ULPROTO_ANY, 0);
        b.address(SADB_EXT_ADDRESS_DST, &dst, full_prefix(&dst), IPSEC_ULPROTO_ANY, 0);
        b.ext(
            &SadbXPolicy {
                exttype: SADB_X_EXT_POLICY,
                policy_type: IPSEC_POLICY_IPSEC,
                dir: dir_to_pfkey(policy.direction),
                id: policy.id,
                priority: policy.priority,
                ..Default::default()
            },
            &[],
        );
        b.finish()
    }

    /// Broadcast ACQUIRE without a policy extension.
    pub fn encode_bare_acquire(seq: u32, protocol: IpsecProtocol, src: &IpAddr, dst: &IpAddr) -> Vec<u8> {
        let mut b = PfkeyBuilder::new(SADB_ACQUIRE, satype(protocol), seq, 0);
        b.address(SADB_EXT_ADDRESS_SRC, src, full_prefix(src), IPSEC_ULPROTO_ANY, 0);
        b.address(SADB_EXT_ADDRESS_DST, dst, full_prefix(dst), IPSEC_ULPROTO_ANY, 0);
        b.finish()
    }

    /// Broadcast EXPIRE for one SA.
    pub fn encode_expire(sa: &SaId, reqid: u32, hard: bool) -> Vec<u8> {
        let mut b = PfkeyBuilder::new(SADB_EXPIRE, satype(sa.protocol), 0, 0);
        b.ext(
            &SadbSa {
                exttype: SADB_EXT_SA,
                spi: sa.spi.to_be(),
                state: SADB_SASTATE_MATURE,
                ..Default::default()
            },
            &[],
        );
        b.ext(
            &SadbXSa2 {
                exttype: SADB_X_EXT_SA2,
                reqid,
                ..Default::default()
            },
            &[],
        );
        b.ext(&lifetime_ext(SADB_EXT_LIFETIME_CURRENT, 0, 0), &[]);
        let exttype = if hard {
            SADB_EXT_LIFETIME_HARD
        } else {
            SADB_EXT_LIFETIME_SOFT
        };
        b.ext(&lifetime_ext(exttype, 0, 0), &[]);
        b.address(SADB_EXT_ADDRESS_SRC, &sa.src, full_prefix(&sa.src), IPSEC_ULPROTO_ANY, 0);
        b.address(SADB_EXT_ADDRESS_DST, &sa.dst, full_prefix(&sa.dst), IPSEC_ULPROTO_ANY, 0);
        b.finish()
    }

    /// Reply to `request` carrying only the header and `errno`.
    pub fn encode_reply(request: &SadbMsg, errno: i32) -> Vec<u8> {
        PfkeyBuilder::new(request.msg_type, request.satype, request.seq, request.pid)
            .errno(errno.unsigned_abs().min(255) as u8)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::kernel::*;
    use super::*;
    use crate::model::selector::{IPPROTO_ICMP, IPPROTO_UDP};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn aes_sha1() -> ChildSaParams {
        ChildSaParams::esp(0xc000_0042)
            .encryption(EncryptionAlgorithm::AesCbc, vec![0x11; 16])
            .integrity(IntegrityAlgorithm::HmacSha1_96, vec![0x22; 20])
            .lifetime(Lifetime::seconds(3600))
            .reqid(9)
    }

    #[test]
    fn sa_round_trip() {
        let codec = PfkeyCodec::default();
        let params = aes_sha1().nat(4500, 4501);
        let msg = codec
            .encode_sa(SADB_ADD, 5, 100, &ip("10.0.0.1"), &ip("10.0.0.2"), &params)
            .unwrap();
        assert_eq!(msg.len() % 8, 0);

        let parsed = PfkeyMessage::parse(&msg).unwrap();
        assert_eq!(parsed.header.msg_type, SADB_ADD);
        assert_eq!(parsed.header.seq, 5);
        assert_eq!(parsed.header.pid, 100);
        assert_eq!(parsed.header.len as usize * 8, msg.len());

        let sa = decode_sa(&parsed).unwrap();
        assert_eq!(sa.id, SaId::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp, 0xc000_0042));
        assert_eq!(sa.params.encryption, params.encryption);
        assert_eq!(sa.params.integrity, params.integrity);
        assert_eq!(sa.params.reqid, 9);
        assert_eq!(sa.params.mode, IpsecMode::Tunnel);
        assert_eq!(sa.params.lifetime.hard_seconds, 3600);
        assert_eq!(sa.params.lifetime.soft_seconds, Some(2880));
        assert_eq!(sa.params.nat, Some(NatTraversal { sport: 4500, dport: 4501 }));
    }

    #[test]
    fn upstream_soft_lifetime_passes_through() {
        let codec = PfkeyCodec::default();
        let params = aes_sha1().lifetime(Lifetime {
            soft_seconds: Some(3000),
            ..Lifetime::seconds(3600)
        });
        let msg = codec
            .encode_sa(SADB_UPDATE, 1, 1, &ip("10.0.0.1"), &ip("10.0.0.2"), &params)
            .unwrap();
        let sa = decode_sa(&PfkeyMessage::parse(&msg).unwrap()).unwrap();
        assert_eq!(sa.params.lifetime.soft_seconds, Some(3000));
    }

    #[test]
    fn ipv6_addresses_are_padded() {
        let codec = PfkeyCodec::default();
        let msg = codec.encode_get_spi(1, 1, &ip("2001:db8::1"), &ip("2001:db8::2"), IpsecProtocol::Esp, 0);
        let parsed = PfkeyMessage::parse(&msg).unwrap();
        let (dst, prefix, ..) = parsed.address(SADB_EXT_ADDRESS_DST).unwrap();
        assert_eq!(dst, ip("2001:db8::2"));
        assert_eq!(prefix, 128);
        // sadb_address (8) + sockaddr_in6 (28) padded to 40
        assert_eq!(parsed.ext(SADB_EXT_ADDRESS_SRC).unwrap().remaining(), 40);
        let range: SadbSpirange = parsed.ext(SADB_EXT_SPIRANGE).unwrap().read().unwrap();
        assert_eq!((range.min, range.max), (0xc000_0000, 0xcfff_ffff));
    }

    #[test]
    fn unsupported_algorithm_fails_before_encoding() {
        let codec = PfkeyCodec::default();
        let params = ChildSaParams::esp(1).encryption(EncryptionAlgorithm::ChaCha20Poly1305, vec![0; 36]);
        let err = codec
            .encode_sa(SADB_ADD, 1, 1, &ip("10.0.0.1"), &ip("10.0.0.2"), &params)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    fn tunnel_policy() -> Policy {
        Policy::new(Direction::Out, (ip("10.0.0.0"), 24), (ip("10.0.1.0"), 24)).with_request(SaRequest::tunnel(
            IpsecProtocol::Esp,
            IpsecLevel::Require,
            4,
            ip("192.0.2.1"),
            ip("192.0.2.2"),
        ))
    }

    #[test]
    fn policy_round_trip() {
        let codec = PfkeyCodec::default();
        let policy = tunnel_policy().with_protocol(IPPROTO_UDP, 0, 53);
        let msg = codec.encode_policy(SADB_X_SPDADD, 2, 3, &policy).unwrap();
        let decoded = decode_policy(&PfkeyMessage::parse(&msg).unwrap()).unwrap();
        assert_eq!(decoded, policy);
        assert_eq!(decoded.action, PolicyAction::Protect);
        assert_eq!(decoded.sa_request.unwrap().request_id, 4);
    }

    #[test]
    fn any_protocol_and_icmp_policies() {
        let codec = PfkeyCodec::default();
        let policy = tunnel_policy();
        let msg = codec.encode_policy(SADB_X_SPDADD, 1, 1, &policy).unwrap();
        let parsed = PfkeyMessage::parse(&msg).unwrap();
        assert_eq!(parsed.address(SADB_EXT_ADDRESS_SRC).unwrap().2, 255);
        assert_eq!(decode_policy(&parsed).unwrap().ip_protocol(), IPPROTO_ANY);

        let icmp = tunnel_policy().with_protocol(IPPROTO_ICMP, 3, 1);
        let msg = codec.encode_policy(SADB_X_SPDADD, 1, 1, &icmp).unwrap();
        let decoded = decode_policy(&PfkeyMessage::parse(&msg).unwrap()).unwrap();
        assert_eq!(decoded.icmp_type(), Some(3));
        assert_eq!(decoded.icmp_code(), Some(1));
    }

    #[test]
    fn sub_policies_are_rejected() {
        let mut policy = tunnel_policy();
        policy.policy_type = PolicyType::Sub;
        let err = PfkeyCodec::default()
            .encode_policy(SADB_X_SPDADD, 1, 1, &policy)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn acquire_and_expire_events() {
        let mut policy = tunnel_policy();
        policy.id = 17;
        let msg = encode_acquire(3, &policy, &ip("10.0.0.1"), &ip("10.0.1.1"));
        let Some(KernelEvent::Acquire(acq)) = decode_event(&PfkeyMessage::parse(&msg).unwrap()).unwrap() else {
            panic!("expected acquire");
        };
        assert_eq!(acq.policy_id, Some(17));
        assert_eq!(acq.direction, Direction::Out);
        assert_eq!(acq.src, ip("192.0.2.1"));

        let sa = SaId::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp, 0xc0000003);
        for hard in [true, false] {
            let msg = encode_expire(&sa, 8, hard);
            assert_eq!(
                decode_event(&PfkeyMessage::parse(&msg).unwrap()).unwrap(),
                Some(KernelEvent::Expire(Expire { sa, reqid: 8, hard }))
            );
        }
    }

    #[test]
    fn overrunning_extension_is_violation() {
        let sa = SaId::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp, 1);
        let mut msg = encode_expire(&sa, 0, true);
        // First extension (SA) claims 64 words.
        msg[16..18].copy_from_slice(&64u16.to_ne_bytes());
        let err = PfkeyMessage::parse(&msg).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn declared_length_beyond_datagram_is_violation() {
        let mut msg = PfkeyCodec::default().encode_flush_sa(1, 1);
        msg[4..6].copy_from_slice(&9u16.to_ne_bytes());
        assert!(PfkeyMessage::parse(&msg).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn reply_carries_errno() {
        let req = PfkeyMessage::parse(&PfkeyCodec::default().encode_flush_sa(7, 9))
            .unwrap()
            .header;
        let reply = encode_reply(&req, -libc::ENOENT);
        let parsed = PfkeyMessage::parse(&reply).unwrap();
        assert_eq!(parsed.header.errno as i32, libc::ENOENT);
        assert_eq!(parsed.header.seq, 7);
        assert_eq!(parsed.header.pid, 9);
    }
}
