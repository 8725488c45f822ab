//! Client-side mirror of the server's world
//!
//! The mirror holds what the server has told this client: the entity table
//! indexed by ClientId, the chunks received so far and the registry. Locally
//! predicted voxel edits sit on top of the mirrored chunks until the server
//! confirms them or they expire.

use glam::Vec3;
use log::debug;
use shared::protocol::{ChunkData, EntitySnapshot, Snapshot};
use shared::{
    Chunk, ChunkManager, ClientId, Entity, ProtocolError, RegistryError, VoxelDefinition, VoxelId,
    VoxelPosition, VoxelRegistry, VoxelUpdate,
};
use std::collections::HashMap;

/// Ticks a predicted edit waits for confirmation before it is reverted.
pub const PREDICTION_TIMEOUT_TICKS: u32 = 60;

#[derive(Debug, Clone, Copy)]
struct Prediction {
    /// Voxel the mirror held before the first prediction at this position.
    previous: VoxelId,
    voxel: VoxelId,
    tick: u32,
}

#[derive(Debug, Default)]
pub struct ClientMirror {
    entities: Vec<Entity>,
    local_id: Option<ClientId>,
    chunks: ChunkManager,
    registry: VoxelRegistry,
    spawn: Option<Vec3>,
    last_snapshot_tick: Option<u32>,
    predictions: HashMap<VoxelPosition, Prediction>,
}

impl ClientMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes the entity table after the server accepted us.
    pub fn connected(&mut self, client_id: ClientId, max_connections: u8) {
        self.entities = vec![Entity::default(); max_connections as usize];
        self.local_id = Some(client_id);
        self.last_snapshot_tick = None;
        if let Some(entity) = self.entities.get_mut(client_id as usize) {
            entity.respawn(self.spawn.unwrap_or(Vec3::ZERO));
        }
    }

    /// Forgets everything learned from the server except the registry and
    /// spawn, which a new session sends again anyway.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.local_id = None;
        self.last_snapshot_tick = None;
        self.chunks = ChunkManager::new();
        self.predictions.clear();
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    pub fn entity(&self, client_id: ClientId) -> Option<&Entity> {
        self.entities.get(client_id as usize)
    }

    pub fn local_entity(&self) -> Option<&Entity> {
        self.local_id.and_then(|id| self.entity(id))
    }

    pub fn local_entity_mut(&mut self) -> Option<&mut Entity> {
        let id = self.local_id?;
        self.entities.get_mut(id as usize)
    }

    /// Entities currently in the game, with their ids.
    pub fn active_entities(&self) -> impl Iterator<Item = (ClientId, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, entity)| entity.alive)
            .map(|(index, entity)| (index as ClientId, entity))
    }

    pub fn player_join(&mut self, client_id: ClientId) -> bool {
        let spawn = self.spawn.unwrap_or(Vec3::ZERO);
        match self.entities.get_mut(client_id as usize) {
            Some(entity) => {
                entity.respawn(spawn);
                true
            }
            None => false,
        }
    }

    pub fn player_leave(&mut self, client_id: ClientId) -> bool {
        match self.entities.get_mut(client_id as usize) {
            Some(entity) => {
                entity.kill();
                entity.skin = None;
                true
            }
            None => false,
        }
    }

    pub fn set_skin(&mut self, client_id: ClientId, skin: Vec<u8>) -> bool {
        match self.entities.get_mut(client_id as usize) {
            Some(entity) => {
                entity.skin = Some(skin);
                true
            }
            None => false,
        }
    }

    /// Applies a snapshot unless a newer one was already applied.
    ///
    /// Entities not mentioned keep their last known state.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> bool {
        if let Some(last) = self.last_snapshot_tick {
            if (snapshot.tick.wrapping_sub(last) as i32) <= 0 {
                debug!("Dropping stale snapshot {} (have {})", snapshot.tick, last);
                return false;
            }
        }
        self.last_snapshot_tick = Some(snapshot.tick);

        for &EntitySnapshot {
            client_id,
            position,
            rotation,
        } in &snapshot.entities
        {
            if let Some(entity) = self.entities.get_mut(client_id as usize) {
                entity.position = position;
                entity.rotation = rotation;
            }
        }
        true
    }

    pub fn last_snapshot_tick(&self) -> Option<u32> {
        self.last_snapshot_tick
    }

    pub fn spawn(&self) -> Option<Vec3> {
        self.spawn
    }

    pub fn set_spawn(&mut self, position: Vec3) {
        self.spawn = Some(position);
        if let Some(entity) = self.local_entity_mut() {
            entity.position = position;
        }
    }

    pub fn registry(&self) -> &VoxelRegistry {
        &self.registry
    }

    pub fn set_registry(&mut self, definitions: Vec<VoxelDefinition>) -> Result<(), RegistryError> {
        self.registry = VoxelRegistry::from_definitions(definitions)?;
        Ok(())
    }

    pub fn chunks(&self) -> &ChunkManager {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut ChunkManager {
        &mut self.chunks
    }

    pub fn get_voxel(&self, position: VoxelPosition) -> VoxelId {
        self.chunks.get_voxel(position)
    }

    /// Merges a chunk payload. Returns whether it replaced local contents.
    ///
    /// Predictions inside the chunk are laid back over the new contents.
    pub fn apply_chunk_data(&mut self, data: &ChunkData) -> Result<bool, ProtocolError> {
        let chunk = Chunk::from_runs(data.position, data.version, &data.runs)?;
        if !self.chunks.add_chunk(chunk) {
            return Ok(false);
        }

        for (position, prediction) in self.predictions.iter_mut() {
            if position.chunk() == data.position {
                if let Some(previous) = self.chunks.overwrite_voxel(*position, prediction.voxel) {
                    prediction.previous = previous;
                }
            }
        }
        Ok(true)
    }

    /// Applies an authoritative edit, settling any prediction at the same
    /// position.
    pub fn apply_voxel_update(&mut self, update: VoxelUpdate) {
        self.predictions.remove(&update.position);
        self.chunks.apply_voxel_update(update);
    }

    /// Shows an edit locally before the server has confirmed it.
    ///
    /// Only possible inside a loaded chunk. Returns whether the edit is now
    /// visible.
    pub fn predict_edit(&mut self, position: VoxelPosition, voxel: VoxelId, tick: u32) -> bool {
        let Some(previous) = self.chunks.overwrite_voxel(position, voxel) else {
            return false;
        };
        self.predictions
            .entry(position)
            .and_modify(|prediction| {
                prediction.voxel = voxel;
                prediction.tick = tick;
            })
            .or_insert(Prediction {
                previous,
                voxel,
                tick,
            });
        true
    }

    /// Reverts predictions the server never confirmed. Returns how many.
    pub fn expire_predictions(&mut self, tick: u32) -> usize {
        let expired: Vec<(VoxelPosition, VoxelId)> = self
            .predictions
            .iter()
            .filter(|(_, prediction)| {
                tick.wrapping_sub(prediction.tick) >= PREDICTION_TIMEOUT_TICKS
            })
            .map(|(position, prediction)| (*position, prediction.previous))
            .collect();

        for (position, previous) in &expired {
            self.predictions.remove(position);
            self.chunks.overwrite_voxel(*position, *previous);
            debug!("Reverted unconfirmed edit at {:?}", position);
        }
        expired.len()
    }

    pub fn pending_predictions(&self) -> usize {
        self.predictions.len()
    }
}
