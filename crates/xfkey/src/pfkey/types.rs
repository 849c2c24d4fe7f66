//! PF_KEY v2 kernel structures and constants (linux/pfkeyv2.h, linux/ipsec.h).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const PF_KEY_V2: u8 = 2;

// Message types
pub const SADB_GETSPI: u8 = 1;
pub const SADB_UPDATE: u8 = 2;
pub const SADB_ADD: u8 = 3;
pub const SADB_DELETE: u8 = 4;
pub const SADB_ACQUIRE: u8 = 6;
pub const SADB_REGISTER: u8 = 7;
pub const SADB_EXPIRE: u8 = 8;
pub const SADB_FLUSH: u8 = 9;
pub const SADB_X_SPDUPDATE: u8 = 13;
pub const SADB_X_SPDADD: u8 = 14;
pub const SADB_X_SPDDELETE: u8 = 15;
pub const SADB_X_SPDDUMP: u8 = 18;
pub const SADB_X_SPDFLUSH: u8 = 19;

// Extension types
pub const SADB_EXT_SA: u16 = 1;
pub const SADB_EXT_LIFETIME_CURRENT: u16 = 2;
pub const SADB_EXT_LIFETIME_HARD: u16 = 3;
pub const SADB_EXT_LIFETIME_SOFT: u16 = 4;
pub const SADB_EXT_ADDRESS_SRC: u16 = 5;
pub const SADB_EXT_ADDRESS_DST: u16 = 6;
pub const SADB_EXT_KEY_AUTH: u16 = 8;
pub const SADB_EXT_KEY_ENCRYPT: u16 = 9;
pub const SADB_EXT_SPIRANGE: u16 = 16;
pub const SADB_X_EXT_POLICY: u16 = 18;
pub const SADB_X_EXT_SA2: u16 = 19;
pub const SADB_X_EXT_NAT_T_TYPE: u16 = 20;
pub const SADB_X_EXT_NAT_T_SPORT: u16 = 21;
pub const SADB_X_EXT_NAT_T_DPORT: u16 = 22;
pub const SADB_EXT_MAX: u16 = 26;

// SA types
pub const SADB_SATYPE_UNSPEC: u8 = 0;
pub const SADB_SATYPE_AH: u8 = 2;
pub const SADB_SATYPE_ESP: u8 = 3;

pub const SADB_SASTATE_LARVAL: u8 = 0;
pub const SADB_SASTATE_MATURE: u8 = 1;
pub const SADB_AALG_NONE: u8 = 0;
pub const SADB_EALG_NONE: u8 = 0;

// linux/ipsec.h
pub const IPSEC_MODE_ANY: u8 = 0;
pub const IPSEC_MODE_TRANSPORT: u8 = 1;
pub const IPSEC_MODE_TUNNEL: u8 = 2;

pub const IPSEC_DIR_INBOUND: u8 = 1;
pub const IPSEC_DIR_OUTBOUND: u8 = 2;
pub const IPSEC_DIR_FWD: u8 = 3;

pub const IPSEC_POLICY_DISCARD: u16 = 0;
pub const IPSEC_POLICY_NONE: u16 = 1;
pub const IPSEC_POLICY_IPSEC: u16 = 2;
pub const IPSEC_POLICY_BYPASS: u16 = 4;

pub const IPSEC_LEVEL_DEFAULT: u8 = 0;
pub const IPSEC_LEVEL_USE: u8 = 1;
pub const IPSEC_LEVEL_REQUIRE: u8 = 2;
pub const IPSEC_LEVEL_UNIQUE: u8 = 3;

/// ESP-in-UDP encapsulation (RFC 3948).
pub const UDP_ENCAP_ESPINUDP: u8 = 2;

/// Extension lengths are counted in 64-bit words.
pub const PFKEY_ALIGN: usize = 8;

/// Round `len` up to the PF_KEY alignment.
pub const fn pfkey_align(len: usize) -> usize {
    (len + PFKEY_ALIGN - 1) & !(PFKEY_ALIGN - 1)
}

/// `struct sadb_msg`: base header of every message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbMsg {
    pub version: u8,
    pub msg_type: u8,
    pub errno: u8,
    pub satype: u8,
    /// Total length in 64-bit words.
    pub len: u16,
    pub reserved: u16,
    pub seq: u32,
    pub pid: u32,
}

/// `struct sadb_ext`: common extension header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbExt {
    /// Length in 64-bit words, header included.
    pub len: u16,
    pub ext_type: u16,
}

/// `struct sadb_sa`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSa {
    pub len: u16,
    pub exttype: u16,
    /// SPI (network byte order).
    pub spi: u32,
    pub replay: u8,
    pub state: u8,
    pub auth: u8,
    pub encrypt: u8,
    pub flags: u32,
}

/// `struct sadb_lifetime`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbLifetime {
    pub len: u16,
    pub exttype: u16,
    pub allocations: u32,
    pub bytes: u64,
    pub addtime: u64,
    pub usetime: u64,
}

/// `struct sadb_address`; a sockaddr padded to 8 bytes follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbAddress {
    pub len: u16,
    pub exttype: u16,
    pub proto: u8,
    pub prefixlen: u8,
    pub reserved: u16,
}

/// `struct sadb_key`; key bits padded to 8 bytes follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbKey {
    pub len: u16,
    pub exttype: u16,
    pub bits: u16,
    pub reserved: u16,
}

/// `struct sadb_spirange`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbSpirange {
    pub len: u16,
    pub exttype: u16,
    pub min: u32,
    pub max: u32,
    pub reserved: u32,
}

/// `struct sadb_x_sa2`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXSa2 {
    pub len: u16,
    pub exttype: u16,
    pub mode: u8,
    pub reserved1: u8,
    pub reserved2: u16,
    pub sequence: u32,
    pub reqid: u32,
}

/// `struct sadb_x_policy`; IPsec requests follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXPolicy {
    pub len: u16,
    pub exttype: u16,
    pub policy_type: u16,
    pub dir: u8,
    pub reserved: u8,
    pub id: u32,
    pub priority: u32,
}

/// `struct sadb_x_ipsecrequest`; tunnel sockaddrs follow in tunnel mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXIpsecrequest {
    /// Length in bytes, not words.
    pub len: u16,
    pub proto: u16,
    pub mode: u8,
    pub level: u8,
    pub reserved1: u16,
    pub reqid: u32,
    pub reserved2: u32,
}

/// `struct sadb_x_nat_t_type`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXNatTType {
    pub len: u16,
    pub exttype: u16,
    pub nat_t_type: u8,
    pub reserved: [u8; 3],
}

/// `struct sadb_x_nat_t_port`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SadbXNatTPort {
    pub len: u16,
    pub exttype: u16,
    /// Port (network byte order).
    pub port: u16,
    pub reserved: u16,
}
