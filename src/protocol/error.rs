use crate::types::{NodeId, Version};

/// Malformed or out-of-order traffic from a peer. The receiving node closes
/// the offending connection; it never aborts the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Packet ended before a field could be read
    Truncated { needed: usize, available: usize },
    /// Declared packet size outside the accepted range
    BadPacketSize { size: u64, max: u64 },
    /// Unknown command number
    UnknownCommand(u32),
    /// Bytes left over after decoding a packet body
    TrailingBytes(usize),
    /// Chunk layout is inconsistent
    MalformedChunk(String),
    /// Data packet out of sequence within a message
    UnexpectedSequence { expected: u32, got: u32 },
    /// Data packet for a different version than the message in progress
    VersionMismatch { expected: Version, got: Version },
    /// Packet not valid in the current handshake state
    UnexpectedPacket(String),
    /// Node entered the same barrier version twice
    DuplicateBarrierEntry { node: NodeId, version: Version },
    /// Untimed barrier entry for a version the master already released
    StaleBarrierEntry { version: Version, current: Version },
    /// More distinct nodes entered a barrier version than its height
    BarrierHeightExceeded { version: Version, entrants: usize, height: u32 },
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::Truncated { needed, available } => {
                write!(f, "Truncated packet: needed {} bytes, {} available", needed, available)
            }
            ProtocolViolation::BadPacketSize { size, max } => {
                write!(f, "Bad packet size {} (max {})", size, max)
            }
            ProtocolViolation::UnknownCommand(c) => write!(f, "Unknown command: {}", c),
            ProtocolViolation::TrailingBytes(n) => write!(f, "{} trailing bytes after packet", n),
            ProtocolViolation::MalformedChunk(msg) => write!(f, "Malformed chunk: {}", msg),
            ProtocolViolation::UnexpectedSequence { expected, got } => {
                write!(f, "Unexpected sequence number: expected {}, got {}", expected, got)
            }
            ProtocolViolation::VersionMismatch { expected, got } => {
                write!(f, "Data for version {} while assembling {}", got, expected)
            }
            ProtocolViolation::UnexpectedPacket(what) => write!(f, "Unexpected packet: {}", what),
            ProtocolViolation::DuplicateBarrierEntry { node, version } => {
                write!(f, "Node {} entered barrier version {} twice", node, version)
            }
            ProtocolViolation::StaleBarrierEntry { version, current } => {
                write!(
                    f,
                    "Barrier entry for released version {} (current {})",
                    version, current
                )
            }
            ProtocolViolation::BarrierHeightExceeded {
                version,
                entrants,
                height,
            } => write!(
                f,
                "{} entrants for barrier version {} of height {}",
                entrants, version, height
            ),
        }
    }
}

impl std::error::Error for ProtocolViolation {}
