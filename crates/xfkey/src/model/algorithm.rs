//! Negotiated algorithm identifiers and their kernel encodings.
//!
//! IKEv2 transform ids are translated to PF_KEY numeric codes or XFRM
//! crypto API names. A transform with no encoding on a backend is
//! rejected with [`Error::UnsupportedAlgorithm`] before any request is
//! built.

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Encryption transforms (IKEv2 transform type 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EncryptionAlgorithm {
    DesCbc,
    TripleDesCbc,
    Null,
    AesCbc,
    AesCtr,
    AesGcm8,
    AesGcm12,
    AesGcm16,
    CamelliaCbc,
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    /// Parse an IKEv2 transform id.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            2 => Some(Self::DesCbc),
            3 => Some(Self::TripleDesCbc),
            11 => Some(Self::Null),
            12 => Some(Self::AesCbc),
            13 => Some(Self::AesCtr),
            18 => Some(Self::AesGcm8),
            19 => Some(Self::AesGcm12),
            20 => Some(Self::AesGcm16),
            23 => Some(Self::CamelliaCbc),
            28 => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// IKEv2 transform id.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::DesCbc => 2,
            Self::TripleDesCbc => 3,
            Self::Null => 11,
            Self::AesCbc => 12,
            Self::AesCtr => 13,
            Self::AesGcm8 => 18,
            Self::AesGcm12 => 19,
            Self::AesGcm16 => 20,
            Self::CamelliaCbc => 23,
            Self::ChaCha20Poly1305 => 28,
        }
    }

    /// Check if this transform also provides integrity.
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            Self::AesGcm8 | Self::AesGcm12 | Self::AesGcm16 | Self::ChaCha20Poly1305
        )
    }

    /// ICV length in bits for AEAD transforms.
    pub fn icv_bits(self) -> Option<u32> {
        match self {
            Self::AesGcm8 => Some(64),
            Self::AesGcm12 => Some(96),
            Self::AesGcm16 | Self::ChaCha20Poly1305 => Some(128),
            _ => None,
        }
    }

    /// PF_KEY `SADB_EALG_*` / `SADB_X_EALG_*` code.
    pub fn pfkey_id(self) -> Result<u8> {
        match self {
            Self::DesCbc => Ok(2),
            Self::TripleDesCbc => Ok(3),
            Self::Null => Ok(11),
            Self::AesCbc => Ok(12),
            Self::AesCtr => Ok(13),
            Self::AesGcm8 => Ok(18),
            Self::AesGcm12 => Ok(19),
            Self::AesGcm16 => Ok(20),
            Self::CamelliaCbc => Ok(22),
            Self::ChaCha20Poly1305 => Err(Error::UnsupportedAlgorithm {
                backend: "pfkey",
                algorithm: self.to_string(),
            }),
        }
    }

    /// Inverse of [`pfkey_id`](Self::pfkey_id).
    pub fn from_pfkey_id(id: u8) -> Option<Self> {
        match id {
            22 => Some(Self::CamelliaCbc),
            23 | 28 => None,
            other => Self::from_u16(other as u16),
        }
    }

    /// XFRM crypto API name.
    pub fn xfrm_name(self) -> &'static str {
        match self {
            Self::DesCbc => "cbc(des)",
            Self::TripleDesCbc => "cbc(des3_ede)",
            Self::Null => "ecb(cipher_null)",
            Self::AesCbc => "cbc(aes)",
            Self::AesCtr => "rfc3686(ctr(aes))",
            Self::AesGcm8 | Self::AesGcm12 | Self::AesGcm16 => "rfc4106(gcm(aes))",
            Self::CamelliaCbc => "cbc(camellia)",
            Self::ChaCha20Poly1305 => "rfc7539esp(chacha20,poly1305)",
        }
    }

    /// Inverse of [`xfrm_name`](Self::xfrm_name); AEAD names need the ICV length.
    pub fn from_xfrm_name(name: &str, icv_bits: Option<u32>) -> Option<Self> {
        match (name, icv_bits) {
            ("cbc(des)", _) => Some(Self::DesCbc),
            ("cbc(des3_ede)", _) => Some(Self::TripleDesCbc),
            ("ecb(cipher_null)", _) => Some(Self::Null),
            ("cbc(aes)", _) => Some(Self::AesCbc),
            ("rfc3686(ctr(aes))", _) => Some(Self::AesCtr),
            ("rfc4106(gcm(aes))", Some(64)) => Some(Self::AesGcm8),
            ("rfc4106(gcm(aes))", Some(96)) => Some(Self::AesGcm12),
            ("rfc4106(gcm(aes))", Some(128)) => Some(Self::AesGcm16),
            ("cbc(camellia)", _) => Some(Self::CamelliaCbc),
            ("rfc7539esp(chacha20,poly1305)", _) => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DesCbc => "DES_CBC",
            Self::TripleDesCbc => "3DES_CBC",
            Self::Null => "NULL",
            Self::AesCbc => "AES_CBC",
            Self::AesCtr => "AES_CTR",
            Self::AesGcm8 => "AES_GCM_8",
            Self::AesGcm12 => "AES_GCM_12",
            Self::AesGcm16 => "AES_GCM_16",
            Self::CamelliaCbc => "CAMELLIA_CBC",
            Self::ChaCha20Poly1305 => "CHACHA20_POLY1305",
        })
    }
}

/// Integrity transforms (IKEv2 transform type 3).
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IntegrityAlgorithm {
    HmacMd5_96,
    HmacSha1_96,
    AesXcbc96,
    HmacSha256_128,
    HmacSha384_192,
    HmacSha512_256,
}

impl IntegrityAlgorithm {
    /// Parse an IKEv2 transform id.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::HmacMd5_96),
            2 => Some(Self::HmacSha1_96),
            5 => Some(Self::AesXcbc96),
            12 => Some(Self::HmacSha256_128),
            13 => Some(Self::HmacSha384_192),
            14 => Some(Self::HmacSha512_256),
            _ => None,
        }
    }

    /// IKEv2 transform id.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::HmacMd5_96 => 1,
            Self::HmacSha1_96 => 2,
            Self::AesXcbc96 => 5,
            Self::HmacSha256_128 => 12,
            Self::HmacSha384_192 => 13,
            Self::HmacSha512_256 => 14,
        }
    }

    /// PF_KEY `SADB_AALG_*` code.
    pub fn pfkey_id(self) -> Result<u8> {
        Ok(match self {
            Self::HmacMd5_96 => 2,
            Self::HmacSha1_96 => 3,
            Self::AesXcbc96 => 9,
            Self::HmacSha256_128 => 5,
            Self::HmacSha384_192 => 6,
            Self::HmacSha512_256 => 7,
        })
    }

    /// Inverse of [`pfkey_id`](Self::pfkey_id).
    pub fn from_pfkey_id(id: u8) -> Option<Self> {
        match id {
            2 => Some(Self::HmacMd5_96),
            3 => Some(Self::HmacSha1_96),
            9 => Some(Self::AesXcbc96),
            5 => Some(Self::HmacSha256_128),
            6 => Some(Self::HmacSha384_192),
            7 => Some(Self::HmacSha512_256),
            _ => None,
        }
    }

    /// XFRM crypto API name.
    pub fn xfrm_name(self) -> &'static str {
        match self {
            Self::HmacMd5_96 => "hmac(md5)",
            Self::HmacSha1_96 => "hmac(sha1)",
            Self::AesXcbc96 => "xcbc(aes)",
            Self::HmacSha256_128 => "hmac(sha256)",
            Self::HmacSha384_192 => "hmac(sha384)",
            Self::HmacSha512_256 => "hmac(sha512)",
        }
    }

    /// Inverse of [`xfrm_name`](Self::xfrm_name).
    pub fn from_xfrm_name(name: &str) -> Option<Self> {
        [
            Self::HmacMd5_96,
            Self::HmacSha1_96,
            Self::AesXcbc96,
            Self::HmacSha256_128,
            Self::HmacSha384_192,
            Self::HmacSha512_256,
        ]
        .into_iter()
        .find(|a| a.xfrm_name() == name)
    }

    /// Truncated ICV length in bits.
    pub fn truncation_bits(self) -> u32 {
        match self {
            Self::HmacMd5_96 | Self::HmacSha1_96 | Self::AesXcbc96 => 96,
            Self::HmacSha256_128 => 128,
            Self::HmacSha384_192 => 192,
            Self::HmacSha512_256 => 256,
        }
    }
}

impl fmt::Display for IntegrityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HmacMd5_96 => "HMAC_MD5_96",
            Self::HmacSha1_96 => "HMAC_SHA1_96",
            Self::AesXcbc96 => "AES_XCBC_96",
            Self::HmacSha256_128 => "HMAC_SHA2_256_128",
            Self::HmacSha384_192 => "HMAC_SHA2_384_192",
            Self::HmacSha512_256 => "HMAC_SHA2_512_256",
        })
    }
}
