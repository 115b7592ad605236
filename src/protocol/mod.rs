//! Wisp wire protocol
//!
//! Provides:
//! - Packet encoding/decoding
//! - Typed payloads for CONNECT, CONTINUE and CLOSE
//! - The close-reason code space
//!
//! All numeric fields on the wire are little-endian. Packets are carried one
//! per binary WebSocket message, so no length prefix is needed.

mod packet;

pub use packet::{
    ClosePayload, CloseReason, ConnectPayload, ContinuePayload, Packet, PacketType, StreamType,
    PACKET_HEADER_SIZE,
};

use thiserror::Error;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("unknown stream type: {0:#04x}")]
    UnknownStreamType(u8),

    #[error("connect payload too short: {0} bytes")]
    ConnectPayloadTooShort(usize),

    #[error("continue payload must be 4 bytes, got {0}")]
    BadContinuePayload(usize),

    #[error("close payload is empty")]
    EmptyClosePayload,

    #[error("hostname is not valid UTF-8")]
    BadHostname,
}
