//! Netlink message header and framing.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::cursor::Cursor;
use crate::error::{Error, Result};

/// Netlink message header alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to NLMSG_ALIGNTO boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Netlink message header (mirrors struct nlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Create a new message header.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// Check if this is an error or ACK message.
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NLMSG_ERROR
    }

    /// Check if this is a done message.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NLMSG_DONE
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(h, _)| h)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// No operation, message must be discarded.
pub const NLMSG_NOOP: u16 = 1;
/// Error message or ACK.
pub const NLMSG_ERROR: u16 = 2;
/// End of multipart message.
pub const NLMSG_DONE: u16 = 3;
/// Data lost, request resend.
pub const NLMSG_OVERRUN: u16 = 4;

/// Netlink message flags.
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;

// Modifiers to GET request
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Modifiers to NEW request
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

/// Netlink error message payload (struct nlmsgerr).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Error code (negative errno or 0 for ACK).
    pub error: i32,
    /// Original message header that caused the error.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Check if this is an ACK (no error).
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }
}

/// One netlink message split out of a datagram.
#[derive(Debug, Clone, Copy)]
pub struct NlMessage<'a> {
    /// The message header.
    pub header: NlMsgHdr,
    /// Payload following the header, bounded by `nlmsg_len`.
    pub payload: &'a [u8],
}

impl<'a> NlMessage<'a> {
    /// Payload cursor bounded by this message.
    pub fn cursor(&self, context: &'static str) -> Cursor<'a> {
        Cursor::new(self.payload, context)
    }

    /// Decode the error code of an `NLMSG_ERROR` frame (0 = ACK).
    pub fn error_code(&self) -> Result<i32> {
        let mut cur = self.cursor("nlmsgerr");
        // Only the error field is required; the echoed header may be capped.
        let code = cur.read_u32()? as i32;
        Ok(code)
    }
}

/// Iterator over netlink messages packed in one datagram.
///
/// Yields an error and stops when a declared length overruns the datagram.
pub struct Messages<'a> {
    cur: Cursor<'a>,
    failed: bool,
}

impl<'a> Messages<'a> {
    /// Iterate the messages in `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(data, "nlmsghdr"),
            failed: false,
        }
    }

    fn next_message(&mut self) -> Result<NlMessage<'a>> {
        let header: NlMsgHdr = NlMsgHdr::parse(self.cur.rest())?;
        let len = header.nlmsg_len as usize;
        if len < NLMSG_HDRLEN {
            return Err(Error::ProtocolViolation(format!(
                "nlmsg_len {} shorter than header",
                len
            )));
        }
        let mut msg = self.cur.sub(len, "nlmsg")?;
        self.cur.align_to(NLMSG_ALIGNTO);
        msg.skip(NLMSG_HDRLEN)?;
        Ok(NlMessage {
            header,
            payload: msg.rest(),
        })
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<NlMessage<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cur.remaining() < NLMSG_HDRLEN {
            return None;
        }
        let item = self.next_message();
        self.failed = item.is_err();
        Some(item)
    }
}
