use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::packet::{Magic, Packet, PacketType, HEADER_LEN};

/// Largest body accepted by default: 64 MiB.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// `tokio-util` codec for the Gearman binary protocol.
///
/// Decodes packets with either magic; encodes whatever magic the packet
/// carries, so the same codec serves clients, workers and test servers.
#[derive(Debug, Clone)]
pub struct GearmanCodec {
    max_body: usize,
}

impl GearmanCodec {
    pub fn new() -> Self {
        Self {
            max_body: MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl Default for GearmanCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for GearmanCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = Magic::from_bytes(&src[0..4]).ok_or_else(|| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&src[0..4]);
            ProtocolError::BadMagic(raw)
        })?;
        let code = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let kind = PacketType::from_code(code).ok_or(ProtocolError::UnknownType(code))?;
        let size = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if size > self.max_body {
            return Err(ProtocolError::TooLarge {
                size,
                max: self.max_body,
            });
        }

        let frame_len = HEADER_LEN + size;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(size).freeze();
        let args = split_args(kind, body)?;
        Ok(Some(Packet { magic, kind, args }))
    }
}

fn split_args(kind: PacketType, body: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let arity = kind.arity();
    if arity == 0 {
        return Ok(Vec::new());
    }

    let mut args = Vec::with_capacity(arity);
    let mut rest = body;
    while args.len() + 1 < arity {
        match rest.iter().position(|b| *b == 0) {
            Some(nul) => {
                let arg = rest.split_to(nul);
                rest.advance(1);
                args.push(arg);
            }
            None => {
                return Err(ProtocolError::MissingArgument {
                    kind,
                    expected: arity,
                    found: args.len() + 1,
                })
            }
        }
    }
    args.push(rest);
    Ok(args)
}

impl Encoder<Packet> for GearmanCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        packet.validate()?;
        let size = packet.body_len();
        if size > self.max_body {
            return Err(ProtocolError::TooLarge {
                size,
                max: self.max_body,
            });
        }

        dst.reserve(HEADER_LEN + size);
        dst.put_slice(packet.magic.bytes());
        dst.put_u32(packet.kind.code());
        dst.put_u32(size as u32);
        for (i, arg) in packet.args.iter().enumerate() {
            if i > 0 {
                dst.put_u8(0);
            }
            dst.put_slice(arg);
        }
        Ok(())
    }
}
