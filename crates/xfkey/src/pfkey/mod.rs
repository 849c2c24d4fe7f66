//! PF_KEY v2 wire protocol (RFC 2367 with the Linux `SADB_X_*` extensions).

pub mod codec;
pub mod types;

pub use codec::{PfkeyCodec, PfkeyMessage, decode_event, decode_policy, decode_sa};
