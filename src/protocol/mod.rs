//! Wire packets
//!
//! Every packet starts with the same fixed header, little-endian:
//!
//! ```text
//! ┌───────────┬────────────┬──────────────────┬──────────────────┬───────────────────┐
//! │ size: u64 │ command:u32│ session_id: u128 │ object_id: u128  │ instance_id: u32  │
//! └───────────┴────────────┴──────────────────┴──────────────────┴───────────────────┘
//! ```
//!
//! `size` covers the whole packet including the header. Versioned data
//! packets (instance, delta, slave delta) continue with
//! `version: u128, sequence: u32, last: u8` followed by one [`WireChunk`].

mod error;
pub(crate) mod wire;

pub use error::ProtocolViolation;

use crate::connection::Connection;
use crate::stream::{StreamError, WireChunk};
use crate::types::{InstanceId, NodeId, ObjectId, RequestId, SessionId, Version, INSTANCE_INVALID};
use bytes::{BufMut, Bytes, BytesMut};
use wire::WireReader;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 48;

/// Default upper bound on accepted packet size.
pub const PACKET_SIZE_MAX: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    NodeConnect = 1,
    NodeConnectReply = 2,
    NodeStop = 3,
    MapSession = 4,
    MapSessionReply = 5,
    AckRequest = 6,

    GenIds = 20,
    GenIdsReply = 21,
    SetIdMaster = 22,
    GetIdMaster = 23,
    GetIdMasterReply = 24,
    AttachObject = 25,
    DetachObject = 26,
    MapObject = 27,
    SubscribeObject = 28,
    SubscribeObjectReply = 29,
    UnsubscribeObject = 30,

    ObjectCommit = 40,
    ObjectObsolete = 41,
    ObjectInstance = 42,
    ObjectDelta = 43,
    ObjectSlaveDelta = 44,

    BarrierEnter = 60,
    BarrierEnterReply = 61,
}

impl Command {
    fn from_u32(value: u32) -> Option<Command> {
        use Command::*;
        Some(match value {
            1 => NodeConnect,
            2 => NodeConnectReply,
            3 => NodeStop,
            4 => MapSession,
            5 => MapSessionReply,
            6 => AckRequest,
            20 => GenIds,
            21 => GenIdsReply,
            22 => SetIdMaster,
            23 => GetIdMaster,
            24 => GetIdMasterReply,
            25 => AttachObject,
            26 => DetachObject,
            27 => MapObject,
            28 => SubscribeObject,
            29 => SubscribeObjectReply,
            30 => UnsubscribeObject,
            40 => ObjectCommit,
            41 => ObjectObsolete,
            42 => ObjectInstance,
            43 => ObjectDelta,
            44 => ObjectSlaveDelta,
            60 => BarrierEnter,
            61 => BarrierEnterReply,
            _ => return None,
        })
    }

    /// Handled by the node itself rather than a session.
    pub fn is_node_command(&self) -> bool {
        (*self as u32) < 20
    }

    /// Handled directly on the receiver thread instead of the command queue.
    ///
    /// Object table mutations and slave data assembly run here so the table
    /// has a single writer and data is queued in arrival order.
    pub fn runs_in_receiver(&self) -> bool {
        matches!(
            self,
            Command::NodeConnect
                | Command::NodeConnectReply
                | Command::NodeStop
                | Command::AckRequest
                | Command::AttachObject
                | Command::DetachObject
                | Command::MapObject
                | Command::SubscribeObjectReply
                | Command::ObjectInstance
                | Command::ObjectDelta
                | Command::ObjectSlaveDelta
        )
    }
}

/// Kind of a versioned data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Complete object state
    Instance,
    /// Changes since the previous version
    Delta,
    /// Changes committed by a slave, addressed to the master
    SlaveDelta,
}

impl DataKind {
    fn command(&self) -> Command {
        match self {
            DataKind::Instance => Command::ObjectInstance,
            DataKind::Delta => Command::ObjectDelta,
            DataKind::SlaveDelta => Command::ObjectSlaveDelta,
        }
    }
}

/// One chunk of a versioned message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData {
    pub kind: DataKind,
    pub version: Version,
    /// Position within the message; 0 starts a new message
    pub sequence: u32,
    pub last: bool,
    pub chunk: WireChunk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    NodeConnect {
        request_id: RequestId,
        node_id: NodeId,
    },
    NodeConnectReply {
        request_id: RequestId,
        node_id: NodeId,
    },
    NodeStop,
    MapSession {
        request_id: RequestId,
    },
    MapSessionReply {
        request_id: RequestId,
        ok: bool,
    },
    AckRequest {
        request_id: RequestId,
    },
    GenIds {
        request_id: RequestId,
        range: u32,
    },
    GenIdsReply {
        request_id: RequestId,
        id: ObjectId,
        requested: u32,
        allocated: u32,
    },
    SetIdMaster {
        request_id: RequestId,
        start: ObjectId,
        range: u32,
        master: NodeId,
    },
    GetIdMaster {
        request_id: RequestId,
        id: ObjectId,
    },
    GetIdMasterReply {
        request_id: RequestId,
        id: ObjectId,
        start: ObjectId,
        range: u32,
        master: NodeId,
    },
    AttachObject {
        request_id: RequestId,
    },
    DetachObject {
        request_id: RequestId,
    },
    MapObject {
        request_id: RequestId,
        version: Version,
        master: NodeId,
    },
    SubscribeObject {
        request_id: RequestId,
        requested: Version,
        slave_instance_id: InstanceId,
    },
    SubscribeObjectReply {
        request_id: RequestId,
        ok: bool,
        version: Version,
        master_instance_id: InstanceId,
        oldest: Version,
        head: Version,
    },
    UnsubscribeObject {
        request_id: RequestId,
        master_instance_id: InstanceId,
        slave_instance_id: InstanceId,
    },
    /// `REQUEST_INVALID` counts a commit without publishing a version
    ObjectCommit {
        request_id: RequestId,
    },
    ObjectObsolete {
        count: u32,
    },
    ObjectData(ObjectData),
    BarrierEnter {
        version: Version,
        incarnation: u32,
        /// 0 means no timeout
        timeout_ms: u32,
    },
    BarrierEnterReply {
        version: Version,
        incarnation: u32,
    },
}

impl PacketBody {
    pub fn command(&self) -> Command {
        match self {
            PacketBody::NodeConnect { .. } => Command::NodeConnect,
            PacketBody::NodeConnectReply { .. } => Command::NodeConnectReply,
            PacketBody::NodeStop => Command::NodeStop,
            PacketBody::MapSession { .. } => Command::MapSession,
            PacketBody::MapSessionReply { .. } => Command::MapSessionReply,
            PacketBody::AckRequest { .. } => Command::AckRequest,
            PacketBody::GenIds { .. } => Command::GenIds,
            PacketBody::GenIdsReply { .. } => Command::GenIdsReply,
            PacketBody::SetIdMaster { .. } => Command::SetIdMaster,
            PacketBody::GetIdMaster { .. } => Command::GetIdMaster,
            PacketBody::GetIdMasterReply { .. } => Command::GetIdMasterReply,
            PacketBody::AttachObject { .. } => Command::AttachObject,
            PacketBody::DetachObject { .. } => Command::DetachObject,
            PacketBody::MapObject { .. } => Command::MapObject,
            PacketBody::SubscribeObject { .. } => Command::SubscribeObject,
            PacketBody::SubscribeObjectReply { .. } => Command::SubscribeObjectReply,
            PacketBody::UnsubscribeObject { .. } => Command::UnsubscribeObject,
            PacketBody::ObjectCommit { .. } => Command::ObjectCommit,
            PacketBody::ObjectObsolete { .. } => Command::ObjectObsolete,
            PacketBody::ObjectData(data) => data.kind.command(),
            PacketBody::BarrierEnter { .. } => Command::BarrierEnter,
            PacketBody::BarrierEnterReply { .. } => Command::BarrierEnterReply,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub session_id: SessionId,
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
    pub body: PacketBody,
}

impl Packet {
    /// Node-level packet (no session or object).
    pub fn node(body: PacketBody) -> Self {
        Packet {
            session_id: SessionId::ZERO,
            object_id: ObjectId::INVALID,
            instance_id: INSTANCE_INVALID,
            body,
        }
    }

    pub fn session(session_id: SessionId, body: PacketBody) -> Self {
        Packet {
            session_id,
            object_id: ObjectId::INVALID,
            instance_id: INSTANCE_INVALID,
            body,
        }
    }

    pub fn object(
        session_id: SessionId,
        object_id: ObjectId,
        instance_id: InstanceId,
        body: PacketBody,
    ) -> Self {
        Packet {
            session_id,
            object_id,
            instance_id,
            body,
        }
    }

    #[inline]
    pub fn command(&self) -> Command {
        self.body.command()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_u64_le(0);
        buf.put_u32_le(self.command() as u32);
        buf.put_u128_le(self.session_id.0);
        buf.put_u128_le(self.object_id.0);
        buf.put_u32_le(self.instance_id);
        self.encode_body(&mut buf);

        let size = buf.len() as u64;
        buf[..8].copy_from_slice(&size.to_le_bytes());
        buf.freeze()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match &self.body {
            PacketBody::NodeConnect {
                request_id,
                node_id,
            }
            | PacketBody::NodeConnectReply {
                request_id,
                node_id,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u128_le(node_id.0);
            }
            PacketBody::NodeStop => {}
            PacketBody::MapSession { request_id }
            | PacketBody::AckRequest { request_id }
            | PacketBody::AttachObject { request_id }
            | PacketBody::DetachObject { request_id }
            | PacketBody::ObjectCommit { request_id } => buf.put_u32_le(*request_id),
            PacketBody::MapSessionReply { request_id, ok } => {
                buf.put_u32_le(*request_id);
                buf.put_u8(*ok as u8);
            }
            PacketBody::GenIds { request_id, range } => {
                buf.put_u32_le(*request_id);
                buf.put_u32_le(*range);
            }
            PacketBody::GenIdsReply {
                request_id,
                id,
                requested,
                allocated,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u128_le(id.0);
                buf.put_u32_le(*requested);
                buf.put_u32_le(*allocated);
            }
            PacketBody::SetIdMaster {
                request_id,
                start,
                range,
                master,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u128_le(start.0);
                buf.put_u32_le(*range);
                buf.put_u128_le(master.0);
            }
            PacketBody::GetIdMaster { request_id, id } => {
                buf.put_u32_le(*request_id);
                buf.put_u128_le(id.0);
            }
            PacketBody::GetIdMasterReply {
                request_id,
                id,
                start,
                range,
                master,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u128_le(id.0);
                buf.put_u128_le(start.0);
                buf.put_u32_le(*range);
                buf.put_u128_le(master.0);
            }
            PacketBody::MapObject {
                request_id,
                version,
                master,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u128_le(version.0);
                buf.put_u128_le(master.0);
            }
            PacketBody::SubscribeObject {
                request_id,
                requested,
                slave_instance_id,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u128_le(requested.0);
                buf.put_u32_le(*slave_instance_id);
            }
            PacketBody::SubscribeObjectReply {
                request_id,
                ok,
                version,
                master_instance_id,
                oldest,
                head,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u8(*ok as u8);
                buf.put_u128_le(version.0);
                buf.put_u32_le(*master_instance_id);
                buf.put_u128_le(oldest.0);
                buf.put_u128_le(head.0);
            }
            PacketBody::UnsubscribeObject {
                request_id,
                master_instance_id,
                slave_instance_id,
            } => {
                buf.put_u32_le(*request_id);
                buf.put_u32_le(*master_instance_id);
                buf.put_u32_le(*slave_instance_id);
            }
            PacketBody::ObjectObsolete { count } => buf.put_u32_le(*count),
            PacketBody::ObjectData(data) => {
                buf.put_u128_le(data.version.0);
                buf.put_u32_le(data.sequence);
                buf.put_u8(data.last as u8);
                data.chunk.encode(buf);
            }
            PacketBody::BarrierEnter {
                version,
                incarnation,
                timeout_ms,
            } => {
                buf.put_u128_le(version.0);
                buf.put_u32_le(*incarnation);
                buf.put_u32_le(*timeout_ms);
            }
            PacketBody::BarrierEnterReply {
                version,
                incarnation,
            } => {
                buf.put_u128_le(version.0);
                buf.put_u32_le(*incarnation);
            }
        }
    }

    /// Decode a complete packet, header included.
    pub fn decode(data: &[u8]) -> Result<Packet, ProtocolViolation> {
        let mut reader = WireReader::new(data);
        let size = reader.u64()?;
        if size != data.len() as u64 {
            return Err(ProtocolViolation::BadPacketSize {
                size,
                max: data.len() as u64,
            });
        }
        let raw_command = reader.u32()?;
        let command =
            Command::from_u32(raw_command).ok_or(ProtocolViolation::UnknownCommand(raw_command))?;
        let session_id = SessionId(reader.u128()?);
        let object_id = ObjectId(reader.u128()?);
        let instance_id = reader.u32()?;
        let body = Self::decode_body(command, &mut reader)?;
        reader.finish()?;
        Ok(Packet {
            session_id,
            object_id,
            instance_id,
            body,
        })
    }

    fn decode_body(
        command: Command,
        r: &mut WireReader<'_>,
    ) -> Result<PacketBody, ProtocolViolation> {
        Ok(match command {
            Command::NodeConnect => PacketBody::NodeConnect {
                request_id: r.u32()?,
                node_id: NodeId(r.u128()?),
            },
            Command::NodeConnectReply => PacketBody::NodeConnectReply {
                request_id: r.u32()?,
                node_id: NodeId(r.u128()?),
            },
            Command::NodeStop => PacketBody::NodeStop,
            Command::MapSession => PacketBody::MapSession {
                request_id: r.u32()?,
            },
            Command::MapSessionReply => PacketBody::MapSessionReply {
                request_id: r.u32()?,
                ok: r.bool()?,
            },
            Command::AckRequest => PacketBody::AckRequest {
                request_id: r.u32()?,
            },
            Command::GenIds => PacketBody::GenIds {
                request_id: r.u32()?,
                range: r.u32()?,
            },
            Command::GenIdsReply => PacketBody::GenIdsReply {
                request_id: r.u32()?,
                id: ObjectId(r.u128()?),
                requested: r.u32()?,
                allocated: r.u32()?,
            },
            Command::SetIdMaster => PacketBody::SetIdMaster {
                request_id: r.u32()?,
                start: ObjectId(r.u128()?),
                range: r.u32()?,
                master: NodeId(r.u128()?),
            },
            Command::GetIdMaster => PacketBody::GetIdMaster {
                request_id: r.u32()?,
                id: ObjectId(r.u128()?),
            },
            Command::GetIdMasterReply => PacketBody::GetIdMasterReply {
                request_id: r.u32()?,
                id: ObjectId(r.u128()?),
                start: ObjectId(r.u128()?),
                range: r.u32()?,
                master: NodeId(r.u128()?),
            },
            Command::AttachObject => PacketBody::AttachObject {
                request_id: r.u32()?,
            },
            Command::DetachObject => PacketBody::DetachObject {
                request_id: r.u32()?,
            },
            Command::MapObject => PacketBody::MapObject {
                request_id: r.u32()?,
                version: Version(r.u128()?),
                master: NodeId(r.u128()?),
            },
            Command::SubscribeObject => PacketBody::SubscribeObject {
                request_id: r.u32()?,
                requested: Version(r.u128()?),
                slave_instance_id: r.u32()?,
            },
            Command::SubscribeObjectReply => PacketBody::SubscribeObjectReply {
                request_id: r.u32()?,
                ok: r.bool()?,
                version: Version(r.u128()?),
                master_instance_id: r.u32()?,
                oldest: Version(r.u128()?),
                head: Version(r.u128()?),
            },
            Command::UnsubscribeObject => PacketBody::UnsubscribeObject {
                request_id: r.u32()?,
                master_instance_id: r.u32()?,
                slave_instance_id: r.u32()?,
            },
            Command::ObjectCommit => PacketBody::ObjectCommit {
                request_id: r.u32()?,
            },
            Command::ObjectObsolete => PacketBody::ObjectObsolete { count: r.u32()? },
            Command::ObjectInstance | Command::ObjectDelta | Command::ObjectSlaveDelta => {
                let kind = match command {
                    Command::ObjectInstance => DataKind::Instance,
                    Command::ObjectDelta => DataKind::Delta,
                    _ => DataKind::SlaveDelta,
                };
                PacketBody::ObjectData(ObjectData {
                    kind,
                    version: Version(r.u128()?),
                    sequence: r.u32()?,
                    last: r.bool()?,
                    chunk: WireChunk::decode(r)?,
                })
            }
            Command::BarrierEnter => PacketBody::BarrierEnter {
                version: Version(r.u128()?),
                incarnation: r.u32()?,
                timeout_ms: r.u32()?,
            },
            Command::BarrierEnterReply => PacketBody::BarrierEnterReply {
                version: Version(r.u128()?),
                incarnation: r.u32()?,
            },
        })
    }
}

/// Read one packet, blocking until it has fully arrived.
pub fn read_packet(connection: &Connection, max_size: u64) -> Result<Packet, StreamError> {
    let mut size_bytes = [0u8; 8];
    connection.recv(&mut size_bytes)?;
    let size = u64::from_le_bytes(size_bytes);
    if size < HEADER_SIZE as u64 || size > max_size {
        return Err(ProtocolViolation::BadPacketSize {
            size,
            max: max_size,
        }
        .into());
    }

    let mut data = vec![0u8; size as usize];
    data[..8].copy_from_slice(&size_bytes);
    connection.recv(&mut data[8..])?;
    Ok(Packet::decode(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let encoded = packet.encode();
        assert_eq!(
            u64::from_le_bytes(encoded[..8].try_into().unwrap()),
            encoded.len() as u64
        );
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_header_size() {
        let encoded = Packet::node(PacketBody::NodeStop).encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
    }

    #[test]
    fn test_control_packets_roundtrip() {
        let session = SessionId::generate();
        roundtrip(Packet::node(PacketBody::NodeConnect {
            request_id: 3,
            node_id: NodeId::generate(),
        }));
        roundtrip(Packet::session(
            session,
            PacketBody::GenIdsReply {
                request_id: 1,
                id: ObjectId(1024),
                requested: 1,
                allocated: 1024,
            },
        ));
        roundtrip(Packet::object(
            session,
            ObjectId(77),
            5,
            PacketBody::SubscribeObjectReply {
                request_id: 9,
                ok: false,
                version: Version::NONE,
                master_instance_id: 2,
                oldest: Version(2),
                head: Version(4),
            },
        ));
        roundtrip(Packet::object(
            session,
            ObjectId(77),
            5,
            PacketBody::BarrierEnter {
                version: Version(12),
                incarnation: 3,
                timeout_ms: 0,
            },
        ));
    }

    #[test]
    fn test_data_packet_roundtrip() {
        let packet = Packet::object(
            SessionId::generate(),
            ObjectId(8),
            crate::types::INSTANCE_ALL,
            PacketBody::ObjectData(ObjectData {
                kind: DataKind::Delta,
                version: Version(3),
                sequence: 1,
                last: true,
                chunk: WireChunk::raw(b"delta bytes"),
            }),
        );
        assert_eq!(packet.command(), Command::ObjectDelta);
        roundtrip(packet);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut encoded = Packet::node(PacketBody::NodeStop).encode().to_vec();
        encoded[8..12].copy_from_slice(&999u32.to_le_bytes());
        assert_eq!(
            Packet::decode(&encoded),
            Err(ProtocolViolation::UnknownCommand(999))
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = Packet::node(PacketBody::NodeStop).encode().to_vec();
        encoded.push(0);
        let size = encoded.len() as u64;
        encoded[..8].copy_from_slice(&size.to_le_bytes());
        assert_eq!(
            Packet::decode(&encoded),
            Err(ProtocolViolation::TrailingBytes(1))
        );
    }

    #[test]
    fn test_read_packet_from_connection() {
        let (a, b) = Connection::pair().unwrap();
        let packet = Packet::node(PacketBody::AckRequest { request_id: 17 });
        a.send(&packet.encode(), false).unwrap();
        assert_eq!(read_packet(&b, PACKET_SIZE_MAX).unwrap(), packet);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let (a, b) = Connection::pair().unwrap();
        let packet = Packet::node(PacketBody::AckRequest { request_id: 17 });
        a.send(&packet.encode(), false).unwrap();
        assert!(matches!(
            read_packet(&b, 16),
            Err(StreamError::Protocol(ProtocolViolation::BadPacketSize { .. }))
        ));
    }
}
