//! NETLINK_XFRM wire protocol.

pub mod codec;
pub mod types;

pub use codec::{XfrmCodec, decode_event, decode_policy, decode_sa};
