//! Wire-level framing shared by both kernel protocols.
//!
//! - [`cursor`]: bounded decoding primitive used by both codecs
//! - [`message`], [`attr`], [`builder`]: netlink framing for the XFRM codec

pub mod attr;
pub mod builder;
pub mod cursor;
pub mod message;

pub use attr::{Attrs, NlAttr};
pub use builder::MessageBuilder;
pub use cursor::Cursor;
pub use message::{Messages, NLMSG_HDRLEN, NlMessage, NlMsgHdr};
