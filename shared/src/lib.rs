//! Protocol, world model and transport shared by the voxel server and client.

pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod world;

pub use dispatcher::CommandDispatcher;
pub use entity::{Entity, InputFlags, PLAYER_SPEED};
pub use error::{ProtocolError, TransportError};
pub use protocol::{ClientCommand, ClientId, Command, Payload, ServerCommand};
pub use registry::{RegistryError, VoxelDefinition, VoxelRegistry};
pub use transport::{
    Channel, MemoryTransport, NetworkHandler, NetworkHost, Outbox, Transport, TransportEvent,
    UdpTransport,
};
pub use world::{
    Chunk, ChunkManager, ChunkPosition, VoxelId, VoxelPosition, VoxelUpdate, AIR, CHUNK_SIZE,
};
