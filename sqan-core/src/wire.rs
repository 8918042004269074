//! Wire format: fixed big-endian header + typed payload + checksum byte,
//! and the 4-byte big-endian length prefix used on stream transports.

use std::num::NonZeroU8;

use crate::integrity;
use crate::protocol::{NodeId, Packet, PacketHeader, PacketKind, Payload};

/// type(1) + origin(4) + destination(4) + time(8) + hop_count(1).
pub const HEADER_LEN: usize = 18;
const CHECKSUM_LEN: usize = 1;
/// Smallest encoded packet: header and checksum with an empty payload.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + CHECKSUM_LEN;
const HOP_COUNT_OFFSET: usize = HEADER_LEN - 1;

pub const LEN_SIZE: usize = 4;
/// Default ceiling for a declared frame length.
pub const MAX_FRAME_LEN: usize = 20 * 1024 * 1024; // 20 MiB

/// Encode a packet. Pure: the same packet always yields the same bytes.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut body = Vec::new();
    encode_payload(&packet.payload, &mut body);
    let checksum = match packet.kind() {
        // Tunnelled traffic is guarded by its own protocol.
        PacketKind::VpnBytes => 0,
        _ => integrity::packet_checksum(&body),
    };
    let h = &packet.header;
    let mut out = Vec::with_capacity(MIN_PACKET_LEN + body.len());
    out.push(packet.kind().as_u8());
    out.extend_from_slice(&h.origin.0.to_be_bytes());
    out.extend_from_slice(&h.destination.0.to_be_bytes());
    out.extend_from_slice(&h.time.to_be_bytes());
    out.push(h.hop_count);
    out.extend_from_slice(&body);
    out.push(checksum);
    out
}

fn encode_payload(payload: &Payload, out: &mut Vec<u8>) {
    match payload {
        Payload::Heartbeat { callsign } => {
            if let Some(name) = callsign {
                put_string(out, name);
            }
        }
        Payload::Ping { midpoint } => out.extend_from_slice(&midpoint.to_be_bytes()),
        Payload::RawBytes(data) => out.extend_from_slice(data),
        Payload::ChannelBytes { channel, data } => {
            put_string(out, channel);
            out.extend_from_slice(data);
        }
        Payload::Disconnecting => {}
        Payload::VpnBytes {
            forward_index,
            data,
        } => {
            out.push(forward_index.map(NonZeroU8::get).unwrap_or(0));
            out.extend_from_slice(data);
        }
    }
}

/// Size of `encode(packet)` without building it.
pub fn encoded_len(packet: &Packet) -> usize {
    let body = match &packet.payload {
        Payload::Heartbeat { callsign } => callsign.as_ref().map_or(0, |s| 4 + s.len()),
        Payload::Ping { .. } => 8,
        Payload::RawBytes(data) => data.len(),
        Payload::ChannelBytes { channel, data } => 4 + channel.len() + data.len(),
        Payload::Disconnecting => 0,
        Payload::VpnBytes { data, .. } => 1 + data.len(),
    };
    MIN_PACKET_LEN + body
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as i32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Decode one packet occupying all of `bytes`.
///
/// Structural problems are errors. A checksum mismatch is not: the packet is
/// returned with `is_valid() == false` and the caller decides what to do.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let (kind, header) = decode_header(bytes)?;
    if bytes.len() < MIN_PACKET_LEN {
        return Err(DecodeError::Truncated {
            needed: MIN_PACKET_LEN,
            got: bytes.len(),
        });
    }
    let body = &bytes[HEADER_LEN..bytes.len() - CHECKSUM_LEN];
    let stored = bytes[bytes.len() - 1];
    let payload = decode_payload(kind, body)?;
    let valid = integrity::verify_packet(body, stored);
    Ok(Packet::new(header, payload).with_validity(valid))
}

/// Read only the fixed header. Used by relays that forward without parsing payloads.
pub fn decode_header(bytes: &[u8]) -> Result<(PacketKind, PacketHeader), DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            got: bytes.len(),
        });
    }
    let kind = PacketKind::from_u8(bytes[0]).ok_or(DecodeError::UnknownType(bytes[0]))?;
    let header = PacketHeader {
        origin: NodeId(read_i32(&bytes[1..5])),
        destination: NodeId(read_i32(&bytes[5..9])),
        time: read_i64(&bytes[9..17]),
        hop_count: bytes[HOP_COUNT_OFFSET],
    };
    Ok((kind, header))
}

/// Rewrite the hop count of an encoded packet in place. The checksum covers
/// only the payload, so nothing else changes.
pub fn set_hop_count(bytes: &mut [u8], hop_count: u8) -> Result<(), DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            got: bytes.len(),
        });
    }
    bytes[HOP_COUNT_OFFSET] = hop_count;
    Ok(())
}

fn decode_payload(kind: PacketKind, body: &[u8]) -> Result<Payload, DecodeError> {
    let payload = match kind {
        PacketKind::Heartbeat => {
            if body.is_empty() {
                Payload::Heartbeat { callsign: None }
            } else {
                let (name, _) = take_string(body)?;
                Payload::Heartbeat {
                    callsign: Some(name),
                }
            }
        }
        PacketKind::Ping => {
            if body.len() < 8 {
                return Err(DecodeError::Truncated {
                    needed: HEADER_LEN + 8 + CHECKSUM_LEN,
                    got: HEADER_LEN + body.len() + CHECKSUM_LEN,
                });
            }
            Payload::Ping {
                midpoint: read_i64(&body[..8]),
            }
        }
        PacketKind::RawBytes => Payload::RawBytes(body.to_vec()),
        PacketKind::ChannelBytes => {
            let (channel, used) = take_string(body)?;
            Payload::ChannelBytes {
                channel,
                data: body[used..].to_vec(),
            }
        }
        PacketKind::Disconnecting => Payload::Disconnecting,
        PacketKind::VpnBytes => {
            let (&index, data) = body.split_first().ok_or(DecodeError::Truncated {
                needed: MIN_PACKET_LEN + 1,
                got: MIN_PACKET_LEN,
            })?;
            Payload::VpnBytes {
                forward_index: NonZeroU8::new(index),
                data: data.to_vec(),
            }
        }
    };
    Ok(payload)
}

/// Length-prefixed UTF-8 string at the front of `body`; returns it and bytes consumed.
fn take_string(body: &[u8]) -> Result<(String, usize), DecodeError> {
    if body.len() < 4 {
        return Err(DecodeError::Malformed("string length missing"));
    }
    let len = read_i32(&body[..4]);
    if len < 0 {
        return Err(DecodeError::Malformed("negative string length"));
    }
    let end = 4 + len as usize;
    if body.len() < end {
        return Err(DecodeError::Malformed("string length exceeds payload"));
    }
    let s = std::str::from_utf8(&body[4..end])
        .map_err(|_| DecodeError::Malformed("string is not UTF-8"))?;
    Ok((s.to_owned(), end))
}

fn read_i32(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_i64(b: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    i64::from_be_bytes(buf)
}

/// Error decoding a packet. Always recoverable: drop the packet and carry on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated packet: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Encode a length-prefixed frame: 4 bytes BE length + encoded packet.
pub fn encode_frame(packet_bytes: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if packet_bytes.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(packet_bytes.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + packet_bytes.len());
    out.extend_from_slice(&(packet_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(packet_bytes);
    Ok(out)
}

/// Error building a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Validate a declared frame length against `[MIN_PACKET_LEN, max]`.
pub fn parse_frame_len(prefix: [u8; LEN_SIZE], max: usize) -> Result<usize, FrameDecodeError> {
    let declared = i32::from_be_bytes(prefix);
    if declared < 0 {
        return Err(FrameDecodeError::Negative(declared));
    }
    let len = declared as usize;
    if len < MIN_PACKET_LEN {
        return Err(FrameDecodeError::TooSmall(len));
    }
    if len > max {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Decode one frame from the front of `bytes`. Returns the packet bytes and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_frame(bytes: &[u8], max: usize) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = parse_frame_len([bytes[0], bytes[1], bytes[2], bytes[3]], max)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error decoding a frame. Everything but `NeedMore` is a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("negative frame length {0}")]
    Negative(i32),
    #[error("frame too small: {0} bytes")]
    TooSmall(usize),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}
