//! Wire command protocol
//!
//! Every packet starts with a little-endian `u16` command tag followed by the
//! payload bound to that tag. Payloads have a fixed field order and no optional
//! fields, so the tag alone determines how the rest of the packet is read:
//!
//! ```text
//! +---------------+------------------------------------+
//! | tag (2 bytes) | payload (bincode, fixed-int, LE)   |
//! +---------------+------------------------------------+
//! ```
//!
//! Client and server commands live in two disjoint enumerations. A host only
//! recognizes the enumeration of the role it receives from, so a server tag
//! arriving at a server is rejected like any unknown tag.

use crate::entity::InputFlags;
use crate::error::ProtocolError;
use crate::registry::VoxelDefinition;
use crate::world::{ChunkPosition, VoxelId, VoxelPosition, VoxelRun, VoxelUpdate};
use bincode::Options;
use glam::Vec3;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Index into the server's slot table.
pub type ClientId = u8;

/// Largest packet the protocol produces; bounded by the UDP datagram limit.
pub const MAX_PACKET_SIZE: usize = 60_000;

/// Upper bound on an uploaded skin (64x64 RGBA).
pub const MAX_SKIN_BYTES: usize = 64 * 64 * 4;

/// Upper bound on chunk positions carried by one chunk request.
pub const MAX_CHUNKS_PER_REQUEST: usize = 16;

const TAG_SIZE: usize = std::mem::size_of::<u16>();

/// A closed enumeration of command tags for one direction of traffic.
pub trait Command: Copy + Eq + Debug + 'static {
    /// Number of tags; tags are dense in `0..COUNT`.
    const COUNT: usize;

    fn from_tag(tag: u16) -> Option<Self>;

    fn tag(self) -> u16;

    fn index(self) -> usize {
        self.tag() as usize
    }
}

/// Commands a client may send to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ClientCommand {
    Connect = 0,
    Disconnect = 1,
    PlayerInput = 2,
    VoxelEdit = 3,
    PlayerSkin = 4,
    ChunkRequest = 5,
}

impl ClientCommand {
    pub const ALL: [ClientCommand; 6] = [
        ClientCommand::Connect,
        ClientCommand::Disconnect,
        ClientCommand::PlayerInput,
        ClientCommand::VoxelEdit,
        ClientCommand::PlayerSkin,
        ClientCommand::ChunkRequest,
    ];
}

impl Command for ClientCommand {
    const COUNT: usize = Self::ALL.len();

    fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    fn tag(self) -> u16 {
        self as u16
    }
}

/// Commands a server may send to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServerCommand {
    ConnectRequestResult = 0,
    PlayerJoin = 1,
    PlayerLeave = 2,
    Snapshot = 3,
    ChunkData = 4,
    SpawnPoint = 5,
    VoxelUpdate = 6,
    GameRegistryData = 7,
    PlayerSkin = 8,
}

impl ServerCommand {
    pub const ALL: [ServerCommand; 9] = [
        ServerCommand::ConnectRequestResult,
        ServerCommand::PlayerJoin,
        ServerCommand::PlayerLeave,
        ServerCommand::Snapshot,
        ServerCommand::ChunkData,
        ServerCommand::SpawnPoint,
        ServerCommand::VoxelUpdate,
        ServerCommand::GameRegistryData,
        ServerCommand::PlayerSkin,
    ];
}

impl Command for ServerCommand {
    const COUNT: usize = Self::ALL.len();

    fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    fn tag(self) -> u16 {
        self as u16
    }
}

/// A payload type permanently bound to one command tag.
pub trait Payload: Serialize + DeserializeOwned {
    type Command: Command;
    const COMMAND: Self::Command;
}

// Client -> server payloads

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerInput {
    pub client_id: ClientId,
    pub input: InputFlags,
    pub rotation_x: f32,
    pub rotation_y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelEditRequest {
    pub position: VoxelPosition,
    pub voxel: VoxelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkinUpload {
    pub client_id: ClientId,
    pub skin: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub positions: Vec<ChunkPosition>,
}

// Server -> client payloads

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectRequestResult {
    Success {
        client_id: ClientId,
        max_connections: u8,
    },
    GameFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoin {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeave {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub client_id: ClientId,
    pub position: Vec3,
    pub rotation: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u32,
    pub entities: Vec<EntitySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    pub position: ChunkPosition,
    pub version: u32,
    pub runs: Vec<VoxelRun>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    pub position: Vec3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRegistryData {
    pub voxels: Vec<VoxelDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSkin {
    pub client_id: ClientId,
    pub skin: Vec<u8>,
}

macro_rules! bind_payloads {
    ($command:ty { $($payload:ty => $variant:ident),* $(,)? }) => {
        $(
            impl Payload for $payload {
                type Command = $command;
                const COMMAND: $command = <$command>::$variant;
            }
        )*
    };
}

bind_payloads!(ClientCommand {
    ConnectRequest => Connect,
    DisconnectRequest => Disconnect,
    PlayerInput => PlayerInput,
    VoxelEditRequest => VoxelEdit,
    SkinUpload => PlayerSkin,
    ChunkRequest => ChunkRequest,
});

bind_payloads!(ServerCommand {
    ConnectRequestResult => ConnectRequestResult,
    PlayerJoin => PlayerJoin,
    PlayerLeave => PlayerLeave,
    Snapshot => Snapshot,
    ChunkData => ChunkData,
    SpawnPoint => SpawnPoint,
    VoxelUpdate => VoxelUpdate,
    GameRegistryData => GameRegistryData,
    PlayerSkin => PlayerSkin,
});

/// Encoding options shared by every reader and writer so both sides agree on
/// integer width and byte order.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_PACKET_SIZE as u64)
}

/// Serializes `payload` behind its command tag.
pub fn encode<P: Payload>(payload: &P) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(&P::COMMAND.tag().to_le_bytes());
    wire_options().serialize_into(&mut bytes, payload)?;
    Ok(bytes)
}

/// Splits a packet into its raw tag and the payload bytes behind it.
pub fn split_tag(packet: &[u8]) -> Result<(u16, &[u8]), ProtocolError> {
    if packet.len() < TAG_SIZE {
        return Err(ProtocolError::MissingTag(packet.len()));
    }
    let (tag, payload) = packet.split_at(TAG_SIZE);
    Ok((u16::from_le_bytes([tag[0], tag[1]]), payload))
}

/// Reads the tag of a packet as a command of role `C`.
pub fn peek_command<C: Command>(packet: &[u8]) -> Result<C, ProtocolError> {
    let (tag, _) = split_tag(packet)?;
    C::from_tag(tag).ok_or(ProtocolError::UnknownCommand(tag))
}

/// Cursor over the payload bytes of a single packet.
///
/// Fields are consumed in the order they were written; a payload must be read
/// to the end or [`PacketReader::finish`] reports the leftover bytes.
pub struct PacketReader<'a> {
    remaining: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { remaining: payload }
    }

    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        Ok(wire_options().deserialize_from(&mut self.remaining)?)
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining.len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

/// Decodes a complete payload of type `P` from the bytes behind the tag.
pub fn decode_payload<P: Payload>(payload: &[u8]) -> Result<P, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let value = reader.read()?;
    reader.finish()?;
    Ok(value)
}

/// Decodes a full packet, checking that its tag belongs to `P`.
pub fn decode<P: Payload>(packet: &[u8]) -> Result<P, ProtocolError> {
    let (tag, payload) = split_tag(packet)?;
    if tag != P::COMMAND.tag() {
        return Err(ProtocolError::UnknownCommand(tag));
    }
    decode_payload(payload)
}
