//! Security association parameters handed in by the IKE core.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use super::algorithm::{EncryptionAlgorithm, IntegrityAlgorithm};
use super::policy::{IpsecMode, IpsecProtocol};
use super::selector::TrafficSelector;
use crate::error::{Error, Result};

/// Identity of one kernel SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SaId {
    /// Outer source address.
    pub src: IpAddr,
    /// Outer destination address.
    pub dst: IpAddr,
    /// IPsec protocol.
    pub protocol: IpsecProtocol,
    /// Security parameter index (host order).
    pub spi: u32,
}

impl SaId {
    /// Create an SA identity.
    pub fn new(src: IpAddr, dst: IpAddr, protocol: IpsecProtocol, spi: u32) -> Self {
        Self {
            src,
            dst,
            protocol,
            spi,
        }
    }
}

impl fmt::Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} spi 0x{:08x}",
            self.protocol, self.src, self.dst, self.spi
        )
    }
}

/// An algorithm together with its key material.
#[derive(Clone, PartialEq, Eq)]
pub struct Keyed<A> {
    /// Algorithm.
    pub algorithm: A,
    /// Key (including any salt/nonce the kernel expects appended).
    pub key: Vec<u8>,
}

impl<A> Keyed<A> {
    /// Pair an algorithm with its key.
    pub fn new(algorithm: A, key: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm,
            key: key.into(),
        }
    }

    /// Key length in bits.
    pub fn key_bits(&self) -> u32 {
        (self.key.len() * 8) as u32
    }
}

// Keys never appear in logs.
impl<A: fmt::Debug> fmt::Debug for Keyed<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyed")
            .field("algorithm", &self.algorithm)
            .field("key_bits", &self.key_bits())
            .finish()
    }
}

/// SA lifetime limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Lifetime {
    /// Hard limit in seconds since installation.
    pub hard_seconds: u64,
    /// Soft limit in seconds; derived from the hard limit when absent.
    pub soft_seconds: Option<u64>,
    /// Hard limit in bytes.
    pub hard_bytes: u64,
    /// Soft limit in bytes; derived from the hard limit when absent.
    pub soft_bytes: Option<u64>,
}

impl Lifetime {
    /// Time-based lifetime with derived soft limit.
    pub fn seconds(hard: u64) -> Self {
        Self {
            hard_seconds: hard,
            ..Self::default()
        }
    }

    /// Soft limit in seconds, deriving `hard * ratio` when none was supplied.
    pub fn soft_seconds_or(&self, ratio: f64) -> u64 {
        self.soft_seconds
            .unwrap_or_else(|| derive_soft(self.hard_seconds, ratio))
    }

    /// Soft limit in bytes, deriving `hard * ratio` when none was supplied.
    pub fn soft_bytes_or(&self, ratio: f64) -> u64 {
        self.soft_bytes
            .unwrap_or_else(|| derive_soft(self.hard_bytes, ratio))
    }

    /// Soft limits computed locally: `hard * ratio` regardless of what
    /// upstream supplied, bounded by the upstream soft value when lower.
    pub fn derived_soft(&self, ratio: f64) -> (u64, u64) {
        let secs = derive_soft(self.hard_seconds, ratio);
        let bytes = derive_soft(self.hard_bytes, ratio);
        (
            self.soft_seconds.map_or(secs, |s| s.min(secs)),
            self.soft_bytes.map_or(bytes, |b| b.min(bytes)),
        )
    }
}

fn derive_soft(hard: u64, ratio: f64) -> u64 {
    if hard == 0 {
        0
    } else {
        ((hard as f64) * ratio) as u64
    }
}

/// UDP encapsulation ports for NAT traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NatTraversal {
    /// Source port (usually 4500).
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
}

/// Parameters of a negotiated Child SA, as produced by the IKE core.
#[derive(Debug, Clone)]
pub struct ChildSaParams {
    /// SPI; zero only before allocation.
    pub spi: u32,
    /// IPsec protocol.
    pub protocol: IpsecProtocol,
    /// Encapsulation mode.
    pub mode: IpsecMode,
    /// Request id binding the SA to a policy template.
    pub reqid: u32,
    /// Encryption (ESP only).
    pub encryption: Option<Keyed<EncryptionAlgorithm>>,
    /// Integrity (absent with AEAD ciphers).
    pub integrity: Option<Keyed<IntegrityAlgorithm>>,
    /// Lifetime limits.
    pub lifetime: Lifetime,
    /// Anti-replay window; the controller default applies when absent.
    pub replay_window: Option<u8>,
    /// NAT-T encapsulation.
    pub nat: Option<NatTraversal>,
    /// Negotiated selectors (initiator, responder) bound into the SA.
    pub selectors: Option<(TrafficSelector, TrafficSelector)>,
}

impl ChildSaParams {
    /// ESP tunnel-mode parameters with the given SPI.
    pub fn esp(spi: u32) -> Self {
        Self {
            spi,
            protocol: IpsecProtocol::Esp,
            mode: IpsecMode::Tunnel,
            reqid: 0,
            encryption: None,
            integrity: None,
            lifetime: Lifetime::default(),
            replay_window: None,
            nat: None,
            selectors: None,
        }
    }

    /// Set the encryption algorithm and key.
    pub fn encryption(mut self, algorithm: EncryptionAlgorithm, key: impl Into<Vec<u8>>) -> Self {
        self.encryption = Some(Keyed::new(algorithm, key));
        self
    }

    /// Set the integrity algorithm and key.
    pub fn integrity(mut self, algorithm: IntegrityAlgorithm, key: impl Into<Vec<u8>>) -> Self {
        self.integrity = Some(Keyed::new(algorithm, key));
        self
    }

    /// Set the lifetime limits.
    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the encapsulation mode.
    pub fn mode(mut self, mode: IpsecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the request id.
    pub fn reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    /// Enable UDP encapsulation.
    pub fn nat(mut self, sport: u16, dport: u16) -> Self {
        self.nat = Some(NatTraversal { sport, dport });
        self
    }

    /// Reject combinations no backend can express.
    pub fn validate(&self) -> Result<()> {
        if self.spi == 0 {
            return Err(Error::Config("SA parameters without SPI".into()));
        }
        match self.protocol {
            IpsecProtocol::Esp => {
                let enc = self
                    .encryption
                    .as_ref()
                    .ok_or_else(|| Error::Config("ESP SA without encryption algorithm".into()))?;
                if !enc.algorithm.is_aead() && self.integrity.is_none() {
                    return Err(Error::Config(format!(
                        "{} requires an integrity algorithm",
                        enc.algorithm
                    )));
                }
                if enc.algorithm.is_aead() && self.integrity.is_some() {
                    return Err(Error::Config(format!(
                        "{} is combined mode and takes no integrity algorithm",
                        enc.algorithm
                    )));
                }
            }
            IpsecProtocol::Ah => {
                if self.integrity.is_none() {
                    return Err(Error::Config("AH SA without integrity algorithm".into()));
                }
                if self.encryption.is_some() {
                    return Err(Error::Config("AH SA cannot carry encryption".into()));
                }
            }
        }
        if let (Some(soft), hard) = (self.lifetime.soft_seconds, self.lifetime.hard_seconds)
            && hard != 0
            && soft > hard
        {
            return Err(Error::Config(format!(
                "soft lifetime {}s exceeds hard lifetime {}s",
                soft, hard
            )));
        }
        Ok(())
    }
}

/// An SA as carried in kernel add/update messages.
#[derive(Debug, Clone)]
pub struct SaEntry {
    /// SA identity.
    pub id: SaId,
    /// Algorithms, keys, lifetimes and mode.
    pub params: ChildSaParams,
}
