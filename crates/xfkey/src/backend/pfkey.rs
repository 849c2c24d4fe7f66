//! PF_KEY v2 backend.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::with_socket;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::event::KernelEvent;
use crate::model::{ChildSaParams, IpsecProtocol, Policy, SaId};
use crate::pfkey::codec::{PfkeyCodec, PfkeyMessage, decode_event, decode_policy};
use crate::pfkey::types::*;
use crate::transport::{Connector, Protocol, SequenceCounter, SocketPool, Transport};
use crate::wire::Cursor;

/// Backend speaking PF_KEY v2.
pub struct PfkeyBackend {
    pool: SocketPool,
    seq: SequenceCounter,
    codec: PfkeyCodec,
    receive_timeout: Duration,
}

fn header(data: &[u8]) -> Result<SadbMsg> {
    Cursor::new(data, "sadb_msg").read()
}

/// Wait for the reply to (`msg_type`, `seq`, `pid`) and check its errno.
fn wait_reply(
    sock: &mut dyn Transport,
    operation: &str,
    msg_type: u8,
    seq: u32,
    pid: u32,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    loop {
        let Some(data) = sock.recv(timeout)? else {
            if timeout.is_some() {
                return Err(Error::transport(
                    "pfkey reply",
                    std::io::Error::from(std::io::ErrorKind::TimedOut),
                ));
            }
            continue;
        };
        let hdr = header(&data)?;
        if hdr.msg_type != msg_type || hdr.seq != seq || hdr.pid != pid {
            continue;
        }
        if hdr.errno != 0 {
            return Err(Error::from_errno_with_context(hdr.errno as i32, operation));
        }
        return Ok(data);
    }
}

impl PfkeyBackend {
    /// Create the backend; sockets are opened on first use.
    pub fn new(config: &ControllerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            pool: SocketPool::new(connector, Protocol::Pfkey, config.pool_size),
            seq: SequenceCounter::new(),
            codec: PfkeyCodec {
                spi_range: config.spi_range,
                soft_ratio: config.soft_ratio,
                replay_window: config.replay_window,
            },
            receive_timeout: config.timeout(),
        }
    }

    /// Encode with the next sequence number and the socket's pid, send,
    /// and return the matching reply.
    fn transact(
        &self,
        operation: &str,
        msg_type: u8,
        encode: impl FnOnce(u32, u32) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let sock = self.pool.checkout()?;
        with_socket(sock, |sock| {
            let seq = self.seq.next();
            let pid = sock.port_id();
            let msg = encode(seq, pid)?;
            debug!(operation, seq, "pfkey request");
            sock.send(&msg)?;
            wait_reply(sock, operation, msg_type, seq, pid, None)
        })
    }

    pub(super) fn get_spi(&self, src: &IpAddr, dst: &IpAddr, protocol: IpsecProtocol, reqid: u32) -> Result<u32> {
        let op = format!("SADB_GETSPI {} {} -> {}", protocol, src, dst);
        let reply = self.transact(&op, SADB_GETSPI, |seq, pid| {
            Ok(self.codec.encode_get_spi(seq, pid, src, dst, protocol, reqid))
        })?;
        let spi = PfkeyMessage::parse(&reply)?.spi()?;
        debug!(spi = format_args!("0x{:08x}", spi), "allocated SPI");
        Ok(spi)
    }

    pub(super) fn add_sa(&self, src: &IpAddr, dst: &IpAddr, params: &ChildSaParams, update: bool) -> Result<()> {
        let (msg_type, name) = if update {
            (SADB_UPDATE, "SADB_UPDATE")
        } else {
            (SADB_ADD, "SADB_ADD")
        };
        let op = format!("{} {} -> {} spi 0x{:08x}", name, src, dst, params.spi);
        self.transact(&op, msg_type, |seq, pid| {
            self.codec.encode_sa(msg_type, seq, pid, src, dst, params)
        })
        .map(|_| ())
    }

    pub(super) fn delete_sa(&self, sa: &SaId) -> Result<()> {
        self.transact(&format!("SADB_DELETE {}", sa), SADB_DELETE, |seq, pid| {
            Ok(self.codec.encode_delete(seq, pid, sa))
        })
        .map(|_| ())
    }

    pub(super) fn add_policy(&self, policy: &Policy, update: bool) -> Result<u32> {
        let (msg_type, name) = if update {
            (SADB_X_SPDUPDATE, "SADB_X_SPDUPDATE")
        } else {
            (SADB_X_SPDADD, "SADB_X_SPDADD")
        };
        let reply = self.transact(&format!("{} {}", name, policy), msg_type, |seq, pid| {
            self.codec.encode_policy(msg_type, seq, pid, policy)
        })?;
        // The reply echoes the policy with its kernel-assigned id.
        let installed = decode_policy(&PfkeyMessage::parse(&reply)?)?;
        Ok(installed.id)
    }

    pub(super) fn delete_policy(&self, policy: &Policy) -> Result<()> {
        self.transact(
            &format!("SADB_X_SPDDELETE {}", policy),
            SADB_X_SPDDELETE,
            |seq, pid| self.codec.encode_del_policy(seq, pid, policy),
        )
        .map(|_| ())
    }

    pub(super) fn dump_policies(&self) -> Result<Vec<Policy>> {
        let sock = self.pool.checkout()?;
        with_socket(sock, |sock| {
            let seq = self.seq.next();
            let pid = sock.port_id();
            debug!(seq, "pfkey policy dump");
            sock.send(&self.codec.encode_policy_dump(seq, pid))?;
            let mut policies = Vec::new();
            loop {
                let Some(data) = sock.recv(None)? else {
                    continue;
                };
                let hdr = header(&data)?;
                if hdr.msg_type != SADB_X_SPDDUMP || hdr.pid != pid {
                    continue;
                }
                match hdr.errno as i32 {
                    0 => {}
                    libc::ENOENT => return Ok(policies),
                    errno => return Err(Error::from_errno_with_context(errno, "SADB_X_SPDDUMP")),
                }
                match PfkeyMessage::parse(&data).and_then(|m| decode_policy(&m)) {
                    Ok(p) => policies.push(p),
                    Err(e) => warn!(error = %e, "dropping malformed policy in dump"),
                }
                // The last entry of a dump carries sequence number 0.
                if hdr.seq == 0 {
                    return Ok(policies);
                }
            }
        })
    }

    pub(super) fn flush_policies(&self) -> Result<()> {
        self.transact("SADB_X_SPDFLUSH", SADB_X_SPDFLUSH, |seq, pid| {
            Ok(self.codec.encode_flush_policy(seq, pid))
        })
        .map(|_| ())
    }

    pub(super) fn flush_sas(&self) -> Result<()> {
        self.transact("SADB_FLUSH", SADB_FLUSH, |seq, pid| {
            Ok(self.codec.encode_flush_sa(seq, pid))
        })
        .map(|_| ())
    }

    /// Open a socket registered for ESP and AH, so ACQUIRE and EXPIRE
    /// messages are delivered to it.
    pub(super) fn open_listener(&self) -> Result<Box<dyn Transport>> {
        let mut sock = self.pool.connector().open(Protocol::Pfkey, 0)?;
        let pid = sock.port_id();
        for protocol in [IpsecProtocol::Esp, IpsecProtocol::Ah] {
            let seq = self.seq.next();
            sock.send(&self.codec.encode_register(seq, pid, protocol))?;
            wait_reply(
                sock.as_mut(),
                "SADB_REGISTER",
                SADB_REGISTER,
                seq,
                pid,
                Some(self.receive_timeout),
            )?;
        }
        Ok(sock)
    }
}

pub(super) fn decode_events(datagram: &[u8]) -> Vec<Result<KernelEvent>> {
    match PfkeyMessage::parse(datagram).and_then(|m| decode_event(&m)) {
        Ok(Some(event)) => vec![Ok(event)],
        Ok(None) => Vec::new(),
        Err(e) => vec![Err(e)],
    }
}
