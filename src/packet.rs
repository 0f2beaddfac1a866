//! Wire codec for the five TFTP packet types (RFC 1350), octet mode only.

use thiserror::Error;

/// TFTP opcodes (RFC 1350 §5).
const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

/// Data payload per DATA packet.
pub const BLOCK_SIZE: usize = 512;

/// Largest packet this codec ever emits or accepts: 4-byte DATA header + BLOCK_SIZE.
pub const MAX_PACKET: usize = 4 + BLOCK_SIZE;

/// The block counter is a u16 and block numbers run 1..=65535 before
/// wrapping; a transfer needing more blocks than that is refused rather
/// than silently wrapping (spec.md §1 Non-goals).
pub const MAX_BLOCKS: usize = u16::MAX as usize;

/// Largest file this implementation will transfer: `MAX_BLOCKS` full blocks.
pub const MAX_FILE_SIZE: usize = MAX_BLOCKS * BLOCK_SIZE;

/// The only transfer mode this implementation accepts.
const MODE_OCTET: &str = "octet";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short")]
    TooShort,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("string field missing its NUL terminator")]
    UnterminatedString,
    #[error("unsupported transfer mode {0:?}")]
    BadMode(String),
    #[error("packet contains invalid UTF-8")]
    InvalidUtf8,
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ { filename: String, mode: String },
    WRQ { filename: String, mode: String },
    DATA { block: u16, data: Vec<u8> },
    ACK { block: u16 },
    ERROR { code: u16, message: String },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort);
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => decode_request(buf, true),
            OPCODE_WRQ => decode_request(buf, false),
            OPCODE_DATA => decode_data(buf),
            OPCODE_ACK => decode_ack(buf),
            OPCODE_ERROR => decode_error(buf),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }

    /// Serialize the packet to bytes for transmission. Never exceeds `MAX_PACKET`
    /// for DATA/ACK; RRQ/WRQ/ERROR are bounded only by the caller-supplied strings.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::RRQ { filename, mode } => encode_request(OPCODE_RRQ, filename, mode),
            Packet::WRQ { filename, mode } => encode_request(OPCODE_WRQ, filename, mode),
            Packet::DATA { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::ACK { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::ERROR { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
        }
    }

    /// Build a request packet, validating that `mode` is (case-insensitively) "octet".
    pub fn request(is_read: bool, filename: impl Into<String>, mode: &str) -> Result<Self, DecodeError> {
        if !mode.eq_ignore_ascii_case(MODE_OCTET) {
            return Err(DecodeError::BadMode(mode.to_string()));
        }
        let filename = filename.into();
        let mode = MODE_OCTET.to_string();
        Ok(if is_read {
            Packet::RRQ { filename, mode }
        } else {
            Packet::WRQ { filename, mode }
        })
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Packet::ERROR {
            code,
            message: message.into(),
        }
    }
}

fn decode_request(buf: &[u8], is_rrq: bool) -> Result<Packet, DecodeError> {
    let payload = &buf[2..];
    let mut fields = payload.splitn(3, |&b| b == 0);

    let filename_bytes = fields.next().ok_or(DecodeError::UnterminatedString)?;
    let mode_bytes = fields.next().ok_or(DecodeError::UnterminatedString)?;
    // splitn(3, ..) leaves a trailing empty slice after the second NUL only if
    // the buffer terminated right there; anything else means a malformed packet.
    if fields.next().is_none_or(|rest| !rest.is_empty()) {
        return Err(DecodeError::UnterminatedString);
    }

    let filename =
        String::from_utf8(filename_bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
    let mode = String::from_utf8(mode_bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;

    if !mode.eq_ignore_ascii_case(MODE_OCTET) {
        return Err(DecodeError::BadMode(mode));
    }

    let mode = MODE_OCTET.to_string();
    Ok(if is_rrq {
        Packet::RRQ { filename, mode }
    } else {
        Packet::WRQ { filename, mode }
    })
}

fn decode_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 || buf.len() > MAX_PACKET {
        return Err(DecodeError::TooShort);
    }
    let block = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::DATA {
        block,
        data: buf[4..].to_vec(),
    })
}

fn decode_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() != 4 {
        return Err(DecodeError::TooShort);
    }
    let block = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::ACK { block })
}

fn decode_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 5 {
        return Err(DecodeError::TooShort);
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::UnterminatedString)?;
    let message =
        String::from_utf8(msg_bytes[..end].to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(Packet::ERROR { code, message })
}

fn encode_request(opcode: u16, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_rrq() {
        let pkt = Packet::request(true, "hello.txt", "octet").unwrap();
        let bytes = pkt.encode();
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn round_trip_wrq() {
        let pkt = Packet::request(false, "a/b/c.bin", "OCTET").unwrap();
        let bytes = pkt.encode();
        match Packet::decode(&bytes).unwrap() {
            Packet::WRQ { filename, mode } => {
                assert_eq!(filename, "a/b/c.bin");
                assert_eq!(mode, "octet");
            }
            other => panic!("expected WRQ, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_data() {
        let pkt = Packet::DATA {
            block: 42,
            data: vec![1, 2, 3],
        };
        assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
    }

    #[test]
    fn round_trip_data_empty_payload() {
        let pkt = Packet::DATA {
            block: 65535,
            data: vec![],
        };
        assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
    }

    #[test]
    fn round_trip_ack() {
        let pkt = Packet::ACK { block: 0 };
        assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
    }

    #[test]
    fn round_trip_error() {
        let pkt = Packet::error(1, "File not found");
        assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
    }

    #[test]
    fn rejects_non_octet_mode() {
        assert_eq!(
            Packet::request(true, "f", "netascii").unwrap_err(),
            DecodeError::BadMode("netascii".into())
        );

        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"f\0netascii\0");
        assert_eq!(
            Packet::decode(&buf).unwrap_err(),
            DecodeError::BadMode("netascii".into())
        );
    }

    #[test]
    fn rejects_too_short() {
        assert_eq!(Packet::decode(&[]).unwrap_err(), DecodeError::TooShort);
        assert_eq!(Packet::decode(&[0]).unwrap_err(), DecodeError::TooShort);
        assert_eq!(
            Packet::decode(&[0, 4, 0]).unwrap_err(),
            DecodeError::TooShort
        ); // ACK with only 3 bytes
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert_eq!(
            Packet::decode(&[0, 9, 0, 0]).unwrap_err(),
            DecodeError::UnknownOpcode(9)
        );
    }

    #[test]
    fn rejects_unterminated_request() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"nomode");
        assert_eq!(
            Packet::decode(&buf).unwrap_err(),
            DecodeError::UnterminatedString
        );
    }

    #[test]
    fn data_over_max_packet_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend(std::iter::repeat_n(0u8, BLOCK_SIZE + 1));
        assert_eq!(Packet::decode(&buf).unwrap_err(), DecodeError::TooShort);
    }
}
