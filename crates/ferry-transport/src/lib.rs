//! # FERRY Transport
//!
//! Network channel layer for the FERRY managed file transfer engine.
//!
//! This crate provides:
//! - Length-prefixed packet framing for the transfer protocol
//! - The `Channel` abstraction every transfer talks through
//! - TCP channels for real peers
//! - In-memory channel pairs for loopback transfers and tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod memory;
pub mod packet;
pub mod tcp;

pub use channel::{Channel, ChannelId, ChannelStats, Connector, TransportError, TransportResult};
pub use memory::MemoryChannel;
pub use packet::{Packet, PacketError, PacketType, RequestKind, RequestPacket, RetrieveMode};
pub use tcp::{TcpChannel, TcpConnector};

/// Size of the frame header (u32 length + u8 packet type)
pub const PACKET_HEADER_SIZE: usize = 5;

/// Largest frame accepted on the wire (16 MiB of payload plus headers)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024 + 1024;
