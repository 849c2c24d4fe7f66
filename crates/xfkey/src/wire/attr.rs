//! Netlink attribute (nlattr) handling.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::cursor::Cursor;
use crate::error::{Error, Result};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Netlink attribute header (mirrors struct nlattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

impl NlAttr {
    /// Create a new attribute header.
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Get the attribute type without flags.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }
}

/// Iterator over the attributes following a fixed message structure.
///
/// Unlike a lenient walk that stops at the first bad header, an attribute
/// whose declared length is shorter than its header or overruns the
/// message yields [`Error::ProtocolViolation`] and ends the iteration.
pub struct Attrs<'a> {
    cur: Cursor<'a>,
    failed: bool,
}

impl<'a> Attrs<'a> {
    /// Walk the attributes in `cur` until it is exhausted.
    pub fn new(cur: Cursor<'a>) -> Self {
        Self { cur, failed: false }
    }

    fn next_attr(&mut self) -> Result<(u16, Cursor<'a>)> {
        let len = self.cur.peek_u16()? as usize;
        if len < NLA_HDRLEN {
            return Err(Error::ProtocolViolation(format!(
                "nla_len {} shorter than attribute header",
                len
            )));
        }
        let mut attr = self.cur.sub(len, "nlattr")?;
        self.cur.align_to(NLA_ALIGNTO);
        let hdr: NlAttr = attr.read()?;
        Ok((hdr.kind(), attr))
    }
}

impl<'a> Iterator for Attrs<'a> {
    /// Returns (attribute type, payload cursor).
    type Item = Result<(u16, Cursor<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cur.is_empty() {
            return None;
        }
        let item = self.next_attr();
        self.failed = item.is_err();
        Some(item)
    }
}

/// Extract a NUL-terminated string from a fixed-size buffer.
pub fn cstring(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}
