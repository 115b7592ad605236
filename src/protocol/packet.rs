//! Packet encoding/decoding
//!
//! Packet layout:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |     Stream ID (4B, little-endian) |
//! +--------+--------+--------+--------+--------+
//! |              Payload (to end)              |
//! +--------------------------------------------+
//! ```
//!
//! Payload interpretation depends on the packet type. Stream id 0 is reserved
//! for connection-level signalling (the initial server CONTINUE).

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use super::ProtocolError;

/// Fixed header size: 1 byte type + 4 bytes stream id.
pub const PACKET_HEADER_SIZE: usize = 5;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Open a new stream
    Connect = 0x01,
    /// Stream payload bytes
    Data = 0x02,
    /// Flow-control credit update
    Continue = 0x03,
    /// Terminate a stream
    Close = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Connect),
            0x02 => Ok(PacketType::Data),
            0x03 => Ok(PacketType::Continue),
            0x04 => Ok(PacketType::Close),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Stream types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for StreamType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(StreamType::Tcp),
            0x02 => Ok(StreamType::Udp),
            other => Err(ProtocolError::UnknownStreamType(other)),
        }
    }
}

/// Close reasons.
///
/// The code space is open: reasons outside the known set are preserved
/// verbatim as [`CloseReason::Other`] and treated as opaque failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unknown,
    Voluntary,
    NetworkError,
    InvalidInfo,
    Unreachable,
    Timeout,
    Refused,
    TcpDataTimeout,
    Blocked,
    Throttled,
    ClientUnexpected,
    Other(u8),
}

impl CloseReason {
    pub fn from_byte(value: u8) -> Self {
        match value {
            0x01 => CloseReason::Unknown,
            0x02 => CloseReason::Voluntary,
            0x03 => CloseReason::NetworkError,
            0x41 => CloseReason::InvalidInfo,
            0x42 => CloseReason::Unreachable,
            0x43 => CloseReason::Timeout,
            0x44 => CloseReason::Refused,
            0x47 => CloseReason::TcpDataTimeout,
            0x48 => CloseReason::Blocked,
            0x49 => CloseReason::Throttled,
            0x81 => CloseReason::ClientUnexpected,
            other => CloseReason::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            CloseReason::Unknown => 0x01,
            CloseReason::Voluntary => 0x02,
            CloseReason::NetworkError => 0x03,
            CloseReason::InvalidInfo => 0x41,
            CloseReason::Unreachable => 0x42,
            CloseReason::Timeout => 0x43,
            CloseReason::Refused => 0x44,
            CloseReason::TcpDataTimeout => 0x47,
            CloseReason::Blocked => 0x48,
            CloseReason::Throttled => 0x49,
            CloseReason::ClientUnexpected => 0x81,
            CloseReason::Other(other) => other,
        }
    }

    /// A voluntary close maps to end-of-stream rather than an error.
    pub fn is_voluntary(self) -> bool {
        self == CloseReason::Voluntary
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Unknown => write!(f, "unknown"),
            CloseReason::Voluntary => write!(f, "voluntary"),
            CloseReason::NetworkError => write!(f, "network error"),
            CloseReason::InvalidInfo => write!(f, "invalid info"),
            CloseReason::Unreachable => write!(f, "unreachable"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Refused => write!(f, "refused"),
            CloseReason::TcpDataTimeout => write!(f, "TCP data timeout"),
            CloseReason::Blocked => write!(f, "blocked by policy"),
            CloseReason::Throttled => write!(f, "throttled"),
            CloseReason::ClientUnexpected => write!(f, "unexpected client error"),
            CloseReason::Other(code) => write!(f, "reason {code:#04x}"),
        }
    }
}

/// A Wisp packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Stream id (0 for connection-level packets)
    pub stream_id: u32,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a CONNECT packet for the given payload.
    pub fn connect(stream_id: u32, payload: &ConnectPayload) -> Self {
        Self {
            packet_type: PacketType::Connect,
            stream_id,
            payload: payload.serialize(),
        }
    }

    /// Create a DATA packet.
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            packet_type: PacketType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a CONTINUE packet advertising `buffer_remaining` credits.
    pub fn continue_packet(stream_id: u32, buffer_remaining: u32) -> Self {
        Self {
            packet_type: PacketType::Continue,
            stream_id,
            payload: ContinuePayload { buffer_remaining }.serialize(),
        }
    }

    /// Create a CLOSE packet.
    pub fn close(stream_id: u32, reason: CloseReason) -> Self {
        Self {
            packet_type: PacketType::Close,
            stream_id,
            payload: ClosePayload { reason }.serialize(),
        }
    }

    /// Encode the packet into a single wire message.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.packet_type as u8);
        buf.put_u32_le(self.stream_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a packet from one wire message.
    ///
    /// The payload is a cheap slice of the input buffer, no copy is made.
    pub fn parse(data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort(data.len()));
        }
        let packet_type = PacketType::try_from(data[0])?;
        let stream_id = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        Ok(Self {
            packet_type,
            stream_id,
            payload: data.slice(PACKET_HEADER_SIZE..),
        })
    }
}

/// CONNECT payload: stream type, port and hostname.
///
/// The hostname has no length prefix; it extends to the end of the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub stream_type: StreamType,
    pub port: u16,
    pub hostname: String,
}

impl ConnectPayload {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.hostname.len());
        buf.put_u8(self.stream_type as u8);
        buf.put_u16_le(self.port);
        buf.extend_from_slice(self.hostname.as_bytes());
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 3 {
            return Err(ProtocolError::ConnectPayloadTooShort(data.len()));
        }
        let stream_type = StreamType::try_from(data[0])?;
        let port = u16::from_le_bytes([data[1], data[2]]);
        let hostname = std::str::from_utf8(&data[3..])
            .map_err(|_| ProtocolError::BadHostname)?
            .to_string();
        Ok(Self {
            stream_type,
            port,
            hostname,
        })
    }
}

/// CONTINUE payload: a buffer-credit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuePayload {
    pub buffer_remaining: u32,
}

impl ContinuePayload {
    pub fn serialize(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer_remaining.to_le_bytes())
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != 4 {
            return Err(ProtocolError::BadContinuePayload(data.len()));
        }
        Ok(Self {
            buffer_remaining: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        })
    }
}

/// CLOSE payload: a one-byte reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePayload {
    pub reason: CloseReason,
}

impl ClosePayload {
    pub fn serialize(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.reason.as_byte()])
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyClosePayload);
        }
        Ok(Self {
            reason: CloseReason::from_byte(data[0]),
        })
    }
}
