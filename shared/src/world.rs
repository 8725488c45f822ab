//! Chunk and voxel storage common to both roles
//!
//! The world is split into cubic chunks of [`CHUNK_SIZE`] voxels per axis.
//! Positions come in two flavours: [`ChunkPosition`] addresses a chunk in the
//! chunk grid and [`VoxelPosition`] addresses a single voxel, either in world
//! space or relative to the corner of its chunk.

use crate::error::ProtocolError;
use glam::Vec3;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CHUNK_SIZE: i32 = 16;
pub const CHUNK_AREA: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;
pub const CHUNK_VOLUME: usize = CHUNK_AREA * CHUNK_SIZE as usize;

/// Registry index of a voxel type.
pub type VoxelId = u16;

pub const AIR: VoxelId = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPosition {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk containing a point in world space.
    pub fn from_world(point: Vec3) -> Self {
        VoxelPosition::from_world(point).chunk()
    }

    /// World position of a voxel given relative to this chunk's corner.
    pub fn to_global(self, local: VoxelPosition) -> VoxelPosition {
        VoxelPosition::new(
            self.x * CHUNK_SIZE + local.x,
            self.y * CHUNK_SIZE + local.y,
            self.z * CHUNK_SIZE + local.z,
        )
    }

    pub fn distance_squared(self, other: ChunkPosition) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dy = (self.y - other.y) as i64;
        let dz = (self.z - other.z) as i64;
        dx * dx + dy * dy + dz * dz
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoxelPosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelPosition {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn from_world(point: Vec3) -> Self {
        let floored = point.floor();
        Self::new(floored.x as i32, floored.y as i32, floored.z as i32)
    }

    /// Chunk holding this world-space voxel.
    pub fn chunk(self) -> ChunkPosition {
        ChunkPosition::new(
            self.x.div_euclid(CHUNK_SIZE),
            self.y.div_euclid(CHUNK_SIZE),
            self.z.div_euclid(CHUNK_SIZE),
        )
    }

    /// Position of this world-space voxel relative to its chunk's corner.
    pub fn local(self) -> VoxelPosition {
        VoxelPosition::new(
            self.x.rem_euclid(CHUNK_SIZE),
            self.y.rem_euclid(CHUNK_SIZE),
            self.z.rem_euclid(CHUNK_SIZE),
        )
    }

    fn is_local(self) -> bool {
        (0..CHUNK_SIZE).contains(&self.x)
            && (0..CHUNK_SIZE).contains(&self.y)
            && (0..CHUNK_SIZE).contains(&self.z)
    }
}

/// One authoritative voxel edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelUpdate {
    pub position: VoxelPosition,
    pub voxel: VoxelId,
}

/// `count` consecutive voxels of one type in chunk storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelRun {
    pub count: u16,
    pub voxel: VoxelId,
}

/// A cubic block of voxels.
///
/// `version` counts the edits applied since the chunk was generated; it lets a
/// receiver tell a stale chunk payload from a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    position: ChunkPosition,
    voxels: Vec<VoxelId>,
    version: u32,
}

impl Chunk {
    /// An all-air chunk.
    pub fn new(position: ChunkPosition) -> Self {
        Self {
            position,
            voxels: vec![AIR; CHUNK_VOLUME],
            version: 0,
        }
    }

    pub fn position(&self) -> ChunkPosition {
        self.position
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn index(local: VoxelPosition) -> usize {
        (local.y * CHUNK_SIZE * CHUNK_SIZE + local.z * CHUNK_SIZE + local.x) as usize
    }

    /// Voxel at a chunk-local position; out of range positions read as air.
    pub fn get(&self, local: VoxelPosition) -> VoxelId {
        if local.is_local() {
            self.voxels[Self::index(local)]
        } else {
            AIR
        }
    }

    /// Writes a voxel at a chunk-local position without touching the version.
    /// Used while generating terrain.
    pub fn set(&mut self, local: VoxelPosition, voxel: VoxelId) -> bool {
        if !local.is_local() {
            return false;
        }
        self.voxels[Self::index(local)] = voxel;
        true
    }

    /// Applies one edit and counts it in the chunk version.
    pub fn apply_edit(&mut self, local: VoxelPosition, voxel: VoxelId) -> bool {
        let applied = self.set(local, voxel);
        if applied {
            self.version = self.version.wrapping_add(1);
        }
        applied
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.iter().all(|&voxel| voxel == AIR)
    }

    /// Run-length encodes the voxel grid for transfer.
    pub fn encode_runs(&self) -> Vec<VoxelRun> {
        let mut runs: Vec<VoxelRun> = Vec::new();
        for &voxel in &self.voxels {
            match runs.last_mut() {
                Some(run) if run.voxel == voxel && run.count < u16::MAX => run.count += 1,
                _ => runs.push(VoxelRun { count: 1, voxel }),
            }
        }
        runs
    }

    /// Rebuilds a chunk from a transferred run list.
    ///
    /// The runs must cover the grid exactly; anything else is a malformed
    /// payload.
    pub fn from_runs(
        position: ChunkPosition,
        version: u32,
        runs: &[VoxelRun],
    ) -> Result<Self, ProtocolError> {
        let total: usize = runs.iter().map(|run| run.count as usize).sum();
        if total != CHUNK_VOLUME {
            return Err(ProtocolError::InvalidField("runs"));
        }

        let mut voxels = Vec::with_capacity(CHUNK_VOLUME);
        for run in runs {
            voxels.extend(std::iter::repeat(run.voxel).take(run.count as usize));
        }

        Ok(Self {
            position,
            voxels,
            version,
        })
    }
}

/// All chunks a host currently holds, plus the changes not yet picked up by
/// whoever consumes them (mesh builder on a client, broadcaster on a server).
#[derive(Debug, Default)]
pub struct ChunkManager {
    chunks: HashMap<ChunkPosition, Chunk>,
    chunk_updates: Vec<ChunkPosition>,
    voxel_updates: Vec<VoxelUpdate>,
}

impl ChunkManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_chunk(&self, position: ChunkPosition) -> Option<&Chunk> {
        self.chunks.get(&position)
    }

    pub fn has_chunk(&self, position: ChunkPosition) -> bool {
        self.chunks.contains_key(&position)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = &ChunkPosition> {
        self.chunks.keys()
    }

    /// Merges a received or generated chunk.
    ///
    /// A chunk already held with a higher version is kept; otherwise the new
    /// one replaces it wholesale. Returns whether the chunk was taken.
    pub fn add_chunk(&mut self, chunk: Chunk) -> bool {
        let position = chunk.position();
        if let Some(existing) = self.chunks.get(&position) {
            if existing.version() > chunk.version() {
                debug!(
                    "Ignoring stale chunk {:?} (version {} < {})",
                    position,
                    chunk.version(),
                    existing.version()
                );
                return false;
            }
        }
        self.chunks.insert(position, chunk);
        self.chunk_updates.push(position);
        true
    }

    pub fn remove_chunk(&mut self, position: ChunkPosition) -> Option<Chunk> {
        self.chunks.remove(&position)
    }

    /// Voxel at a world position; unloaded space reads as air.
    pub fn get_voxel(&self, position: VoxelPosition) -> VoxelId {
        self.chunks
            .get(&position.chunk())
            .map_or(AIR, |chunk| chunk.get(position.local()))
    }

    /// Applies an authoritative edit and queues it for consumers.
    ///
    /// An edit into an unloaded chunk creates an empty placeholder chunk at
    /// version zero, which any later chunk payload replaces.
    pub fn apply_voxel_update(&mut self, update: VoxelUpdate) {
        let position = update.position.chunk();
        let chunk = self
            .chunks
            .entry(position)
            .or_insert_with(|| Chunk::new(position));
        chunk.apply_edit(update.position.local(), update.voxel);
        self.voxel_updates.push(update);
    }

    /// Overwrites a voxel without counting it as an authoritative edit.
    /// Returns the previous voxel, or `None` if the chunk is not loaded.
    pub fn overwrite_voxel(&mut self, position: VoxelPosition, voxel: VoxelId) -> Option<VoxelId> {
        let chunk = self.chunks.get_mut(&position.chunk())?;
        let local = position.local();
        let previous = chunk.get(local);
        chunk.set(local, voxel);
        self.voxel_updates.push(VoxelUpdate { position, voxel });
        Some(previous)
    }

    pub fn take_chunk_updates(&mut self) -> Vec<ChunkPosition> {
        std::mem::take(&mut self.chunk_updates)
    }

    pub fn take_voxel_updates(&mut self) -> Vec<VoxelUpdate> {
        std::mem::take(&mut self.voxel_updates)
    }

    pub fn pending_voxel_updates(&self) -> &[VoxelUpdate] {
        &self.voxel_updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_conversion_negative() {
        let voxel = VoxelPosition::new(-1, 17, -16);
        assert_eq!(voxel.chunk(), ChunkPosition::new(-1, 1, -1));
        assert_eq!(voxel.local(), VoxelPosition::new(15, 1, 0));
        assert_eq!(voxel.chunk().to_global(voxel.local()), voxel);
    }

    #[test]
    fn test_from_world_floors() {
        let position = VoxelPosition::from_world(Vec3::new(-0.5, 3.9, 16.0));
        assert_eq!(position, VoxelPosition::new(-1, 3, 16));
        assert_eq!(
            ChunkPosition::from_world(Vec3::new(-0.5, 3.9, 16.0)),
            ChunkPosition::new(-1, 0, 1)
        );
    }

    #[test]
    fn test_chunk_get_set() {
        let mut chunk = Chunk::new(ChunkPosition::default());
        let local = VoxelPosition::new(3, 4, 5);
        assert!(chunk.is_empty());
        assert!(chunk.set(local, 2));
        assert_eq!(chunk.get(local), 2);
        assert_eq!(chunk.version(), 0);
        assert!(!chunk.set(VoxelPosition::new(16, 0, 0), 2));
        assert_eq!(chunk.get(VoxelPosition::new(-1, 0, 0)), AIR);
    }

    #[test]
    fn test_runs_cover_grid() {
        let mut chunk = Chunk::new(ChunkPosition::new(1, 0, 1));
        for x in 0..CHUNK_SIZE {
            for z in 0..CHUNK_SIZE {
                chunk.set(VoxelPosition::new(x, 0, z), 1);
            }
        }
        chunk.apply_edit(VoxelPosition::new(4, 8, 4), 3);

        let runs = chunk.encode_runs();
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0], VoxelRun { count: CHUNK_AREA as u16, voxel: 1 });

        let rebuilt = Chunk::from_runs(chunk.position(), chunk.version(), &runs).unwrap();
        assert_eq!(rebuilt, chunk);
    }

    #[test]
    fn test_short_runs_rejected() {
        let runs = [VoxelRun { count: 10, voxel: 1 }];
        assert!(Chunk::from_runs(ChunkPosition::default(), 0, &runs).is_err());
    }

    #[test]
    fn test_voxel_update_on_fresh_manager() {
        let mut manager = ChunkManager::new();
        let update = VoxelUpdate {
            position: VoxelPosition::new(-20, 5, 40),
            voxel: 4,
        };
        manager.apply_voxel_update(update);

        assert_eq!(manager.get_voxel(update.position), 4);
        assert_eq!(manager.get_chunk(update.position.chunk()).unwrap().version(), 1);
        assert_eq!(manager.take_voxel_updates(), vec![update]);
        assert!(manager.take_voxel_updates().is_empty());
    }

    #[test]
    fn test_stale_chunk_not_merged() {
        let position = ChunkPosition::new(0, 0, 0);
        let mut manager = ChunkManager::new();
        manager.apply_voxel_update(VoxelUpdate {
            position: VoxelPosition::new(1, 1, 1),
            voxel: 2,
        });
        manager.apply_voxel_update(VoxelUpdate {
            position: VoxelPosition::new(1, 1, 1),
            voxel: 3,
        });

        assert!(!manager.add_chunk(Chunk::new(position)));
        assert_eq!(manager.get_voxel(VoxelPosition::new(1, 1, 1)), 3);

        let mut fresh = Chunk::new(position);
        fresh.apply_edit(VoxelPosition::new(1, 1, 1), 3);
        fresh.apply_edit(VoxelPosition::new(2, 2, 2), 5);
        assert!(manager.add_chunk(fresh));
        assert_eq!(manager.get_voxel(VoxelPosition::new(2, 2, 2)), 5);
        assert_eq!(manager.take_chunk_updates(), vec![position]);
    }

    #[test]
    fn test_overwrite_requires_loaded_chunk() {
        let mut manager = ChunkManager::new();
        assert_eq!(manager.overwrite_voxel(VoxelPosition::new(0, 0, 0), 1), None);

        manager.add_chunk(Chunk::new(ChunkPosition::default()));
        assert_eq!(manager.overwrite_voxel(VoxelPosition::new(0, 0, 0), 1), Some(AIR));
        assert_eq!(manager.get_voxel(VoxelPosition::new(0, 0, 0)), 1);
        assert_eq!(manager.get_chunk(ChunkPosition::default()).unwrap().version(), 0);
    }
}
