//! Bounded byte cursor for decoding kernel messages.
//!
//! Both wire protocols nest variable-length blocks (netlink attributes,
//! PF_KEY extensions) inside a message whose total length is declared in a
//! header. A [`Cursor`] tracks how many bytes remain inside the current
//! block; [`Cursor::sub`] carves out a child cursor bounded by a declared
//! length, and every read past a bound is a protocol violation instead of a
//! silent short read.
//!
//! ```ignore
//! let mut cur = Cursor::new(payload, "sadb_msg");
//! let hdr: SadbMsg = cur.read()?;
//! while !cur.is_empty() {
//!     let len = cur.peek_u16()? as usize * 8;
//!     let mut ext = cur.sub(len)?;
//!     // ...
//! }
//! ```

use winnow::binary::{Endianness, u8 as nu8, u16 as nu16, u32 as nu32};
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::take;
use zerocopy::FromBytes;

use crate::error::{Error, Result};

/// Result type for winnow parsers.
type PResult<T> = core::result::Result<T, winnow::error::ErrMode<ContextError>>;

fn take_bytes<'a>(n: usize, input: &mut &'a [u8]) -> PResult<&'a [u8]> {
    take(n).parse_next(input)
}

fn parse_u8(input: &mut &[u8]) -> PResult<u8> {
    nu8.parse_next(input)
}

fn parse_u16(input: &mut &[u8]) -> PResult<u16> {
    nu16(Endianness::Native).parse_next(input)
}

fn parse_u32(input: &mut &[u8]) -> PResult<u32> {
    nu32(Endianness::Native).parse_next(input)
}

/// A read cursor bounded to one message, extension or attribute.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    consumed: usize,
    context: &'static str,
}

impl<'a> Cursor<'a> {
    /// Create a cursor over `data`. `context` names the enclosing structure
    /// in error messages.
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            consumed: 0,
            context,
        }
    }

    /// Bytes left before the bound.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Check if the cursor is exhausted.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.consumed
    }

    /// Unread bytes, without consuming them.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    fn overrun(&self, wanted: usize) -> Error {
        Error::ProtocolViolation(format!(
            "{}: read of {} bytes at offset {} overruns boundary ({} left)",
            self.context,
            wanted,
            self.consumed,
            self.data.len()
        ))
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if n > self.data.len() {
            return Err(self.overrun(n));
        }
        Ok(())
    }

    /// Consume exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let out = take_bytes(n, &mut self.data).map_err(|_| self.overrun(n))?;
        self.consumed += n;
        Ok(out)
    }

    /// Skip exactly `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Skip padding up to the next multiple of `align`, or to the end of
    /// the cursor if fewer bytes remain (trailing padding may be elided).
    pub fn align_to(&mut self, align: usize) {
        let pad = (align - self.consumed % align) % align;
        let pad = pad.min(self.data.len());
        self.data = &self.data[pad..];
        self.consumed += pad;
    }

    /// Read a u8.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let v = parse_u8(&mut self.data).map_err(|_| self.overrun(1))?;
        self.consumed += 1;
        Ok(v)
    }

    /// Read a native-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        let v = parse_u16(&mut self.data).map_err(|_| self.overrun(2))?;
        self.consumed += 2;
        Ok(v)
    }

    /// Read a native-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let v = parse_u32(&mut self.data).map_err(|_| self.overrun(4))?;
        self.consumed += 4;
        Ok(v)
    }

    /// Peek a native-endian u16 without consuming it.
    pub fn peek_u16(&self) -> Result<u16> {
        let mut ahead = self.data;
        self.ensure(2)?;
        parse_u16(&mut ahead).map_err(|_| self.overrun(2))
    }

    /// Read a fixed-layout kernel structure. The buffer need not be aligned.
    pub fn read<T: FromBytes>(&mut self) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let bytes = self.take(size)?;
        T::read_from_bytes(bytes).map_err(|_| Error::Truncated {
            expected: size,
            actual: bytes.len(),
        })
    }

    /// Carve out a child cursor over the next `len` bytes.
    ///
    /// The parent advances past the child's bytes immediately; a `len`
    /// larger than what remains is a protocol violation.
    pub fn sub(&mut self, len: usize, context: &'static str) -> Result<Cursor<'a>> {
        let bytes = self.take(len)?;
        Ok(Cursor::new(bytes, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::{Immutable, IntoBytes, KnownLayout};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
    struct Pair {
        a: u16,
        b: u16,
    }

    #[test]
    fn reads_advance_position() {
        let data = [1u8, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut cur = Cursor::new(&data, "test");
        assert_eq!(cur.read_u8().unwrap(), 1);
        assert_eq!(cur.read_u16().unwrap(), u16::from_ne_bytes([0x34, 0x12]));
        assert_eq!(
            cur.read_u32().unwrap(),
            u32::from_ne_bytes([0x78, 0x56, 0x34, 0x12])
        );
        assert!(cur.is_empty());
        assert_eq!(cur.position(), 7);
    }

    #[test]
    fn overrun_is_protocol_violation() {
        let data = [0u8; 3];
        let mut cur = Cursor::new(&data, "ext");
        let err = cur.read_u32().unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(err.to_string().contains("ext"));
        // Failed read does not consume.
        assert_eq!(cur.remaining(), 3);
    }

    #[test]
    fn sub_cursor_is_bounded() {
        let data = [1u8, 0, 2, 0, 3, 0, 4, 0];
        let mut cur = Cursor::new(&data, "msg");
        let mut child = cur.sub(4, "attr").unwrap();
        let pair: Pair = child.read().unwrap();
        assert_eq!(pair, Pair { a: 1, b: 2 });
        assert!(child.read_u8().unwrap_err().is_protocol_violation());
        assert_eq!(cur.remaining(), 4);
        assert!(cur.sub(5, "attr").unwrap_err().is_protocol_violation());
    }

    #[test]
    fn align_skips_padding() {
        let data = [9u8, 0, 0, 0, 7];
        let mut cur = Cursor::new(&data, "msg");
        cur.read_u8().unwrap();
        cur.align_to(4);
        assert_eq!(cur.read_u8().unwrap(), 7);
        // Alignment at the end never overruns.
        cur.align_to(8);
        assert!(cur.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let data = 0x0203u16.to_ne_bytes();
        let cur = Cursor::new(&data, "msg");
        assert_eq!(cur.peek_u16().unwrap(), 0x0203);
        assert_eq!(cur.remaining(), 2);
    }
}
