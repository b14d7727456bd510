//! Packet framing: header encoding, CRC validation, bounded framed reads.

use std::io::Read;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::PacketType;

/// Header magic. Mismatch fails parsing before anything else is looked at.
pub const MAGIC: u32 = 0xACCA_11CE;

/// Serialized header size: magic(4) + type(2) + length(4) + crc32(4) + sender(4).
pub const HEADER_LEN: usize = 18;

/// CRC-32/ISO-HDLC (polynomial 0xEDB88320 reflected, init and xorout
/// 0xFFFFFFFF), computed over the payload bytes only. Fixed here as part of
/// the wire contract.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Parsed packet header. All fields little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub packet_type: PacketType,
    pub length: u32,
    pub crc32: u32,
    /// Originating client id; 0 when the server is the sender.
    pub sender_id: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),
    #[error("unknown packet type {0}")]
    UnknownType(u16),
    #[error("payload of {length} bytes exceeds limit {max}")]
    Oversize { length: u32, max: u32 },
    #[error("truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("payload CRC mismatch: header 0x{header:08X}, computed 0x{computed:08X}")]
    CrcMismatch { header: u32, computed: u32 },
}

/// Serializes a complete wire packet (header + payload).
pub fn encode_packet(packet_type: PacketType, sender_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(MAGIC);
    buf.put_u16_le(packet_type as u16);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(payload_checksum(payload));
    buf.put_u32_le(sender_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Parses and validates an 18-byte header. `max_payload` bounds `length`
/// before any allocation happens on its behalf.
pub fn parse_header(bytes: &[u8], max_payload: u32) -> Result<WireHeader, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            need: HEADER_LEN,
            have: bytes.len(),
        });
    }
    let mut cursor = &bytes[..HEADER_LEN];
    let magic = cursor.get_u32_le();
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let raw_type = cursor.get_u16_le();
    let packet_type = PacketType::from_wire(raw_type).ok_or(WireError::UnknownType(raw_type))?;
    let length = cursor.get_u32_le();
    if length > max_payload {
        return Err(WireError::Oversize {
            length,
            max: max_payload,
        });
    }
    let crc32 = cursor.get_u32_le();
    let sender_id = cursor.get_u32_le();
    Ok(WireHeader {
        packet_type,
        length,
        crc32,
        sender_id,
    })
}

/// Validates a payload against its header CRC.
pub fn validate_payload(header: &WireHeader, payload: &[u8]) -> Result<(), WireError> {
    if payload.len() != header.length as usize {
        return Err(WireError::Truncated {
            need: header.length as usize,
            have: payload.len(),
        });
    }
    let computed = payload_checksum(payload);
    if computed != header.crc32 {
        return Err(WireError::CrcMismatch {
            header: header.crc32,
            computed,
        });
    }
    Ok(())
}

/// Parses a complete serialized packet. Inverse of [`encode_packet`] over the
/// set of well-formed packets.
pub fn parse_packet(bytes: &[u8], max_payload: u32) -> Result<(WireHeader, Bytes), WireError> {
    let header = parse_header(bytes, max_payload)?;
    let body = &bytes[HEADER_LEN..];
    validate_payload(&header, body)?;
    Ok((header, Bytes::copy_from_slice(body)))
}

/// Parses the first packet out of a buffer that may hold several back to
/// back. The caller advances by `HEADER_LEN + payload.len()` for the next.
pub fn parse_packet_prefix(bytes: &[u8]) -> Result<(WireHeader, Bytes), WireError> {
    let header = parse_header(bytes, u32::MAX)?;
    let end = HEADER_LEN + header.length as usize;
    if bytes.len() < end {
        return Err(WireError::Truncated {
            need: end,
            have: bytes.len(),
        });
    }
    let body = &bytes[HEADER_LEN..end];
    validate_payload(&header, body)?;
    Ok((header, Bytes::copy_from_slice(body)))
}

/// Outcome of a bounded framed read.
pub enum ReadOutcome {
    /// A complete, CRC-valid packet.
    Packet(WireHeader, BytesMut),
    /// The deadline elapsed with no packet started.
    TimedOut,
    /// The shutdown flag flipped while waiting.
    ShutDown,
}

/// Reads one framed packet from a blocking transport.
///
/// The transport must be configured with a short read timeout (the hub uses
/// 100ms) so `should_stop` is observed between chunks. `deadline` bounds the
/// whole packet: a peer that stalls mid-frame is treated as gone.
pub fn read_framed<T: Read>(
    transport: &mut T,
    deadline: Duration,
    max_payload: u32,
    should_stop: &dyn Fn() -> bool,
) -> std::io::Result<Result<ReadOutcome, WireError>> {
    let started = Instant::now();
    let mut header_bytes = [0u8; HEADER_LEN];
    let mut filled = 0usize;

    // Header first; an idle wait (no bytes yet) is a clean timeout, a stall
    // mid-header is an error surfaced as a truncated read.
    while filled < HEADER_LEN {
        if should_stop() {
            return Ok(Ok(ReadOutcome::ShutDown));
        }
        if started.elapsed() > deadline {
            if filled == 0 {
                return Ok(Ok(ReadOutcome::TimedOut));
            }
            return Ok(Err(WireError::Truncated {
                need: HEADER_LEN,
                have: filled,
            }));
        }
        match transport.read(&mut header_bytes[filled..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ))
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }

    let header = match parse_header(&header_bytes, max_payload) {
        Ok(header) => header,
        Err(e) => return Ok(Err(e)),
    };

    let mut payload = BytesMut::zeroed(header.length as usize);
    let mut filled = 0usize;
    while filled < payload.len() {
        if should_stop() {
            return Ok(Ok(ReadOutcome::ShutDown));
        }
        if started.elapsed() > deadline {
            return Ok(Err(WireError::Truncated {
                need: payload.len(),
                have: filled,
            }));
        }
        match transport.read(&mut payload[filled..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection mid-payload",
                ))
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }

    if let Err(e) = validate_payload(&header, &payload) {
        return Ok(Err(e));
    }
    Ok(Ok(ReadOutcome::Packet(header, payload)))
}
