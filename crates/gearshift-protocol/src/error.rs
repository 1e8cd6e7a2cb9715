use thiserror::Error;

use crate::packet::PacketType;

/// Framing errors on a Gearman connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad packet magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unknown packet type {0}")]
    UnknownType(u32),

    #[error("packet body of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("{kind:?} packet has {found} arguments, expected {expected}")]
    MissingArgument {
        kind: PacketType,
        expected: usize,
        found: usize,
    },

    #[error("{kind:?} packet built with {found} arguments, expected {expected}")]
    Arity {
        kind: PacketType,
        expected: usize,
        found: usize,
    },

    #[error("argument {index} of {kind:?} packet contains a NUL byte")]
    EmbeddedNul { kind: PacketType, index: usize },

    #[error("argument {index} of {kind:?} packet is not valid UTF-8")]
    InvalidUtf8 { kind: PacketType, index: usize },
}
