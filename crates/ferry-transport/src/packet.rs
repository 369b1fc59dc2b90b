//! Packet encoding and decoding for the FERRY wire protocol.
//!
//! Every packet travels as a single length-prefixed frame:
//!
//! ```text
//! +----------------+---------+---------------------------+
//! | length (u32)   | type u8 | body (length - 1 bytes)   |
//! +----------------+---------+---------------------------+
//! ```
//!
//! All multi-byte fields are big-endian (network byte order). Strings are
//! encoded as a `u16` byte length followed by UTF-8 data, byte payloads as a
//! `u32` length followed by the raw bytes.

use crate::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
use serde::{Deserialize, Serialize};

/// Packet-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Buffer too short to contain the announced field
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size available
        actual: usize,
    },

    /// Unknown packet type byte
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown enumeration value inside a packet body
    #[error("invalid {field} value: {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Raw value received
        value: u8,
    },

    /// Frame larger than the protocol maximum
    #[error("packet of {0} bytes exceeds maximum size")]
    Oversize(usize),

    /// String field longer than its length prefix can express
    #[error("string field `{0}` too long")]
    StringTooLong(&'static str),

    /// String field is not valid UTF-8
    #[error("string field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// Bytes left over after the body was fully decoded
    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),
}

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Transfer open / rank negotiation
    Request = 0x01,
    /// One block of file data
    Data = 0x02,
    /// Sender has emitted every block
    EndTransfer = 0x03,
    /// Positive outcome acknowledgment
    ValidAck = 0x04,
    /// Negative outcome notice
    ErrorNotice = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::EndTransfer),
            0x04 => Ok(Self::ValidAck),
            0x05 => Ok(Self::ErrorNotice),
            _ => Err(PacketError::InvalidPacketType(value)),
        }
    }
}

/// Which side of a transfer moves the file data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrieveMode {
    /// The local host receives blocks from the peer and writes them to disk
    Pull,
    /// The local host reads blocks from disk and sends them to the peer
    Push,
}

impl RetrieveMode {
    /// Wire representation
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Pull => 1,
            Self::Push => 2,
        }
    }

    /// The mode the peer runs for the same transfer
    #[must_use]
    pub fn mirrored(self) -> Self {
        match self {
            Self::Pull => Self::Push,
            Self::Push => Self::Pull,
        }
    }
}

impl TryFrom<u8> for RetrieveMode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Pull),
            2 => Ok(Self::Push),
            _ => Err(PacketError::InvalidField {
                field: "retrieve_mode",
                value,
            }),
        }
    }
}

/// What a `ValidAck` acknowledges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    /// All blocks were received and committed
    EndTransfer = 1,
    /// The whole request (transfer plus post tasks) completed
    EndRequest = 2,
}

impl TryFrom<u8> for RequestKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::EndTransfer),
            2 => Ok(Self::EndRequest),
            _ => Err(PacketError::InvalidField {
                field: "request_kind",
                value,
            }),
        }
    }
}

/// Opening request, also used as the rank negotiation reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    /// Host owning the transfer record
    pub owner: String,
    /// Host that initiated the transfer
    pub requester: String,
    /// Host that answers the transfer
    pub requested: String,
    /// Globally unique transfer id
    pub special_id: u64,
    /// Sender's local channel id
    pub local_id: u64,
    /// Rule governing tasks for this transfer
    pub rule_id: String,
    /// File name on the requested side
    pub filename: String,
    /// Block size in bytes
    pub block_size: u32,
    /// Sender's last committed block count
    pub rank: u64,
    /// Transfer mode flags
    pub mode: u8,
    /// Retrieve mode from the sender's point of view
    pub retrieve_mode: RetrieveMode,
    /// Free-form file information
    pub file_info: String,
}

/// Protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Transfer open / rank negotiation
    Request(RequestPacket),
    /// One block of file data
    Data {
        /// Block index
        rank: u64,
        /// Block content
        payload: Vec<u8>,
    },
    /// Sender has emitted every block
    EndTransfer {
        /// Number of blocks sent
        rank: u64,
        /// Hex digest of the whole file when the mode requests it
        checksum: Option<String>,
    },
    /// Positive outcome
    ValidAck {
        /// Human-readable message
        message: String,
        /// Final rank as a decimal string
        rank_token: String,
        /// What is acknowledged
        request_kind: RequestKind,
    },
    /// Negative outcome
    ErrorNotice {
        /// Human-readable message
        message: String,
        /// Failure classification
        cause: String,
        /// Blocks the sender of the notice holds committed
        rank: u64,
        /// Peer must close after reading this notice
        forward_close: bool,
    },
}

impl Packet {
    /// Packet type of this packet
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Request(_) => PacketType::Request,
            Self::Data { .. } => PacketType::Data,
            Self::EndTransfer { .. } => PacketType::EndTransfer,
            Self::ValidAck { .. } => PacketType::ValidAck,
            Self::ErrorNotice { .. } => PacketType::ErrorNotice,
        }
    }

    /// Encode into a complete length-prefixed frame
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut w = PacketWriter::with_capacity(self.size_hint());
        w.put_u32(0);
        w.put_u8(self.packet_type() as u8);

        match self {
            Self::Request(req) => {
                w.put_str("owner", &req.owner)?;
                w.put_str("requester", &req.requester)?;
                w.put_str("requested", &req.requested)?;
                w.put_u64(req.special_id);
                w.put_u64(req.local_id);
                w.put_str("rule_id", &req.rule_id)?;
                w.put_str("filename", &req.filename)?;
                w.put_u32(req.block_size);
                w.put_u64(req.rank);
                w.put_u8(req.mode);
                w.put_u8(req.retrieve_mode.as_u8());
                w.put_str("file_info", &req.file_info)?;
            }
            Self::Data { rank, payload } => {
                w.put_u64(*rank);
                w.put_bytes(payload)?;
            }
            Self::EndTransfer { rank, checksum } => {
                w.put_u64(*rank);
                w.put_str("checksum", checksum.as_deref().unwrap_or(""))?;
            }
            Self::ValidAck {
                message,
                rank_token,
                request_kind,
            } => {
                w.put_str("message", message)?;
                w.put_str("rank_token", rank_token)?;
                w.put_u8(*request_kind as u8);
            }
            Self::ErrorNotice {
                message,
                cause,
                rank,
                forward_close,
            } => {
                w.put_str("message", message)?;
                w.put_str("cause", cause)?;
                w.put_u64(*rank);
                w.put_u8(u8::from(*forward_close));
            }
        }

        w.finish()
    }

    /// Decode a complete frame (length prefix included)
    pub fn decode(frame: &[u8]) -> Result<Self, PacketError> {
        if frame.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: PACKET_HEADER_SIZE,
                actual: frame.len(),
            });
        }
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let body = &frame[4..];
        if len != body.len() {
            return Err(PacketError::TooShort {
                expected: len + 4,
                actual: frame.len(),
            });
        }
        Self::decode_body(body)
    }

    /// Decode the part of a frame following the length prefix
    pub fn decode_body(body: &[u8]) -> Result<Self, PacketError> {
        if body.len() + 4 > MAX_PACKET_SIZE {
            return Err(PacketError::Oversize(body.len() + 4));
        }
        let mut r = PacketReader::new(body);
        let packet_type = PacketType::try_from(r.get_u8()?)?;

        let packet = match packet_type {
            PacketType::Request => Self::Request(RequestPacket {
                owner: r.get_string("owner")?,
                requester: r.get_string("requester")?,
                requested: r.get_string("requested")?,
                special_id: r.get_u64()?,
                local_id: r.get_u64()?,
                rule_id: r.get_string("rule_id")?,
                filename: r.get_string("filename")?,
                block_size: r.get_u32()?,
                rank: r.get_u64()?,
                mode: r.get_u8()?,
                retrieve_mode: RetrieveMode::try_from(r.get_u8()?)?,
                file_info: r.get_string("file_info")?,
            }),
            PacketType::Data => Self::Data {
                rank: r.get_u64()?,
                payload: r.get_bytes()?,
            },
            PacketType::EndTransfer => {
                let rank = r.get_u64()?;
                let checksum = r.get_string("checksum")?;
                Self::EndTransfer {
                    rank,
                    checksum: (!checksum.is_empty()).then_some(checksum),
                }
            }
            PacketType::ValidAck => Self::ValidAck {
                message: r.get_string("message")?,
                rank_token: r.get_string("rank_token")?,
                request_kind: RequestKind::try_from(r.get_u8()?)?,
            },
            PacketType::ErrorNotice => Self::ErrorNotice {
                message: r.get_string("message")?,
                cause: r.get_string("cause")?,
                rank: r.get_u64()?,
                forward_close: r.get_u8()? != 0,
            },
        };

        r.expect_end()?;
        Ok(packet)
    }

    fn size_hint(&self) -> usize {
        match self {
            Self::Data { payload, .. } => PACKET_HEADER_SIZE + 12 + payload.len(),
            _ => 128,
        }
    }
}

struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_str(&mut self, field: &'static str, s: &str) -> Result<(), PacketError> {
        let len = u16::try_from(s.len()).map_err(|_| PacketError::StringTooLong(field))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn put_bytes(&mut self, data: &[u8]) -> Result<(), PacketError> {
        let len = u32::try_from(data.len()).map_err(|_| PacketError::Oversize(data.len()))?;
        self.put_u32(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>, PacketError> {
        if self.buf.len() > MAX_PACKET_SIZE {
            return Err(PacketError::Oversize(self.buf.len()));
        }
        let body_len = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&body_len.to_be_bytes());
        Ok(self.buf)
    }
}

struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        let end = self.pos.checked_add(n).ok_or(PacketError::Oversize(n))?;
        if end > self.buf.len() {
            return Err(PacketError::TooShort {
                expected: end,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64, PacketError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn get_string(&mut self, field: &'static str) -> Result<String, PacketError> {
        let len = self.get_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8(field))
    }

    fn get_bytes(&mut self) -> Result<Vec<u8>, PacketError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn expect_end(&self) -> Result<(), PacketError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(PacketError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestPacket {
        RequestPacket {
            owner: "hostA".to_string(),
            requester: "hostA".to_string(),
            requested: "hostB".to_string(),
            special_id: 42,
            local_id: 3,
            rule_id: "default".to_string(),
            filename: "in/report.csv".to_string(),
            block_size: 4096,
            rank: 7,
            mode: 0b11,
            retrieve_mode: RetrieveMode::Push,
            file_info: "nightly".to_string(),
        }
    }

    #[test]
    fn test_request_encoding_layout() {
        let encoded = Packet::Request(sample_request()).encode().unwrap();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);
        assert_eq!(encoded[4], PacketType::Request as u8);

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, Packet::Request(sample_request()));
    }

    #[test]
    fn test_end_transfer_without_checksum() {
        let packet = Packet::EndTransfer {
            rank: 3,
            checksum: None,
        };
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_error_notice_carries_committed_rank() {
        let packet = Packet::ErrorNotice {
            message: "disk full".to_string(),
            cause: "System".to_string(),
            rank: 1,
            forward_close: true,
        };
        match Packet::decode(&packet.encode().unwrap()).unwrap() {
            Packet::ErrorNotice {
                rank,
                forward_close,
                ..
            } => {
                assert_eq!(rank, 1);
                assert!(forward_close);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_invalid_packet_type() {
        let frame = [0, 0, 0, 1, 0x7F];
        assert_eq!(
            Packet::decode(&frame),
            Err(PacketError::InvalidPacketType(0x7F))
        );
    }

    #[test]
    fn test_truncated_body() {
        let mut encoded = Packet::Data {
            rank: 1,
            payload: vec![9u8; 32],
        }
        .encode()
        .unwrap();
        encoded.truncate(encoded.len() - 5);
        let body_len = (encoded.len() - 4) as u32;
        encoded[..4].copy_from_slice(&body_len.to_be_bytes());

        assert!(matches!(
            Packet::decode(&encoded),
            Err(PacketError::TooShort { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = Packet::EndTransfer {
            rank: 0,
            checksum: None,
        }
        .encode()
        .unwrap();
        encoded.push(0);
        let body_len = (encoded.len() - 4) as u32;
        encoded[..4].copy_from_slice(&body_len.to_be_bytes());

        assert_eq!(Packet::decode(&encoded), Err(PacketError::TrailingBytes(1)));
    }

    #[test]
    fn test_string_too_long() {
        let packet = Packet::ValidAck {
            message: "x".repeat(u16::MAX as usize + 1),
            rank_token: "0".to_string(),
            request_kind: RequestKind::EndRequest,
        };
        assert_eq!(packet.encode(), Err(PacketError::StringTooLong("message")));
    }

    #[test]
    fn test_invalid_retrieve_mode() {
        let mut encoded = Packet::Request(sample_request()).encode().unwrap();
        // retrieve mode sits right before the trailing file_info string
        let idx = encoded.len() - 2 - "nightly".len() - 1;
        encoded[idx] = 9;
        assert_eq!(
            Packet::decode(&encoded),
            Err(PacketError::InvalidField {
                field: "retrieve_mode",
                value: 9
            })
        );
    }

    #[test]
    fn test_retrieve_mode_mirrored() {
        assert_eq!(RetrieveMode::Pull.mirrored(), RetrieveMode::Push);
        assert_eq!(RetrieveMode::Push.mirrored(), RetrieveMode::Pull);
    }
}
