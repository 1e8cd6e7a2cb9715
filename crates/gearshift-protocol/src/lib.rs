//! `gearshift-protocol`: the Gearman binary protocol as a `tokio-util` codec.
//!
//! Every packet is a 12-byte header (`\0REQ` or `\0RES`, type, body size)
//! followed by NUL-separated arguments. See [`packet::PacketType::arity`] for
//! how many arguments each type carries.

pub mod codec;
pub mod error;
pub mod packet;

pub use codec::GearmanCodec;
pub use error::ProtocolError;
pub use packet::{Magic, Packet, PacketType};
