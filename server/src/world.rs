//! Server-side voxel world
//!
//! Terrain is a seeded heightmap generated one chunk at a time, the first
//! time anything touches that chunk. Heights are sampled on a lattice with one
//! point per chunk corner and interpolated in between, so a column's height
//! depends only on the seed and its coordinates, never on the order in which
//! chunks were generated.

use glam::Vec3;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::protocol::{ChunkData, VoxelEditRequest};
use shared::world::CHUNK_SIZE;
use shared::{Chunk, ChunkManager, ChunkPosition, VoxelId, VoxelPosition, VoxelRegistry, VoxelUpdate, AIR};

/// Horizontal extent of the world in chunks, on each side of the origin.
pub const WORLD_RADIUS_CHUNKS: i32 = 8;

/// Vertical extent of the world in chunks, starting at y = 0.
pub const WORLD_HEIGHT_CHUNKS: i32 = 4;

const MIN_SURFACE: i32 = 20;
const MAX_SURFACE: i32 = 36;
const DIRT_DEPTH: i32 = 3;

/// Chunk-aligned box the world is confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldBounds {
    /// Inclusive lower corner.
    pub min: ChunkPosition,
    /// Exclusive upper corner.
    pub max: ChunkPosition,
}

impl WorldBounds {
    pub fn contains_chunk(&self, position: ChunkPosition) -> bool {
        (self.min.x..self.max.x).contains(&position.x)
            && (self.min.y..self.max.y).contains(&position.y)
            && (self.min.z..self.max.z).contains(&position.z)
    }

    pub fn contains_voxel(&self, position: VoxelPosition) -> bool {
        self.contains_chunk(position.chunk())
    }
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            min: ChunkPosition::new(-WORLD_RADIUS_CHUNKS, 0, -WORLD_RADIUS_CHUNKS),
            max: ChunkPosition::new(WORLD_RADIUS_CHUNKS, WORLD_HEIGHT_CHUNKS, WORLD_RADIUS_CHUNKS),
        }
    }
}

/// Voxel ids the generator paints with.
#[derive(Debug, Clone, Copy)]
struct Palette {
    stone: VoxelId,
    dirt: VoxelId,
    grass: VoxelId,
}

impl Palette {
    /// Looks up the terrain voxels by name; a registry missing some of them
    /// falls back to its first solid voxel, or air if it has none.
    fn from_registry(registry: &VoxelRegistry) -> Self {
        let fallback = registry
            .definitions()
            .iter()
            .position(|definition| definition.solid)
            .map_or(AIR, |index| index as VoxelId);
        let lookup = |name: &str| registry.id_of(name).unwrap_or(fallback);
        Self {
            stone: lookup("stone"),
            dirt: lookup("dirt"),
            grass: lookup("grass"),
        }
    }
}

pub struct ServerWorld {
    chunks: ChunkManager,
    registry: VoxelRegistry,
    bounds: WorldBounds,
    seed: u64,
    palette: Palette,
}

impl ServerWorld {
    pub fn new(registry: VoxelRegistry, seed: u64) -> Self {
        Self::with_bounds(registry, seed, WorldBounds::default())
    }

    pub fn with_bounds(registry: VoxelRegistry, seed: u64, bounds: WorldBounds) -> Self {
        Self {
            chunks: ChunkManager::new(),
            palette: Palette::from_registry(&registry),
            registry,
            bounds,
            seed,
        }
    }

    pub fn registry(&self) -> &VoxelRegistry {
        &self.registry
    }

    pub fn bounds(&self) -> WorldBounds {
        self.bounds
    }

    pub fn loaded_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Terrain surface height of the column at world `(x, z)`.
    pub fn surface_height(&self, x: i32, z: i32) -> i32 {
        let cell_x = x.div_euclid(CHUNK_SIZE);
        let cell_z = z.div_euclid(CHUNK_SIZE);
        let tx = x.rem_euclid(CHUNK_SIZE) as f32 / CHUNK_SIZE as f32;
        let tz = z.rem_euclid(CHUNK_SIZE) as f32 / CHUNK_SIZE as f32;

        let h00 = self.lattice_height(cell_x, cell_z);
        let h10 = self.lattice_height(cell_x + 1, cell_z);
        let h01 = self.lattice_height(cell_x, cell_z + 1);
        let h11 = self.lattice_height(cell_x + 1, cell_z + 1);

        let near = h00 + (h10 - h00) * tx;
        let far = h01 + (h11 - h01) * tx;
        (near + (far - near) * tz).round() as i32
    }

    fn lattice_height(&self, x: i32, z: i32) -> f32 {
        let mixed = self.seed
            ^ (x as i64 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (z as i64 as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        StdRng::seed_from_u64(mixed).gen_range(MIN_SURFACE..=MAX_SURFACE) as f32
    }

    /// Where every player enters the world: above the terrain at the centre
    /// of the origin chunk.
    pub fn spawn_point(&self) -> Vec3 {
        let x = CHUNK_SIZE / 2;
        let z = CHUNK_SIZE / 2;
        let y = self.surface_height(x, z) + 2;
        Vec3::new(x as f32 + 0.5, y as f32, z as f32 + 0.5)
    }

    fn generate(&self, position: ChunkPosition) -> Chunk {
        let mut chunk = Chunk::new(position);
        for local_x in 0..CHUNK_SIZE {
            for local_z in 0..CHUNK_SIZE {
                let column = position.to_global(VoxelPosition::new(local_x, 0, local_z));
                let surface = self.surface_height(column.x, column.z);

                for local_y in 0..CHUNK_SIZE {
                    let y = position.y * CHUNK_SIZE + local_y;
                    let voxel = if y > surface {
                        continue;
                    } else if y == surface {
                        self.palette.grass
                    } else if y > surface - DIRT_DEPTH {
                        self.palette.dirt
                    } else {
                        self.palette.stone
                    };
                    chunk.set(VoxelPosition::new(local_x, local_y, local_z), voxel);
                }
            }
        }
        chunk
    }

    /// Returns the chunk at `position`, generating it on first access.
    /// Positions outside the world bounds have no chunk.
    pub fn chunk(&mut self, position: ChunkPosition) -> Option<&Chunk> {
        if !self.bounds.contains_chunk(position) {
            return None;
        }
        if !self.chunks.has_chunk(position) {
            let chunk = self.generate(position);
            debug!("Generated chunk {:?}", position);
            self.chunks.add_chunk(chunk);
            // Generation is not a change anyone needs to hear about.
            self.chunks.take_chunk_updates();
        }
        self.chunks.get_chunk(position)
    }

    /// Full payload for a chunk request.
    pub fn chunk_data(&mut self, position: ChunkPosition) -> Option<ChunkData> {
        let chunk = self.chunk(position)?;
        Some(ChunkData {
            position,
            version: chunk.version(),
            runs: chunk.encode_runs(),
        })
    }

    pub fn get_voxel(&mut self, position: VoxelPosition) -> Option<VoxelId> {
        self.chunk(position.chunk())
            .map(|chunk| chunk.get(position.local()))
    }

    /// Checks an edit request against the world bounds and the registry.
    pub fn validate_edit(&self, request: &VoxelEditRequest) -> Option<VoxelUpdate> {
        if !self.bounds.contains_voxel(request.position) {
            return None;
        }
        if !self.registry.contains(request.voxel) {
            return None;
        }
        Some(VoxelUpdate {
            position: request.position,
            voxel: request.voxel,
        })
    }

    /// Applies a valid edit and queues it for broadcast. Invalid requests
    /// change nothing and return `None`.
    pub fn apply_edit(&mut self, request: &VoxelEditRequest) -> Option<VoxelUpdate> {
        let update = self.validate_edit(request)?;
        // Edits land on generated terrain, never on a placeholder.
        self.chunk(update.position.chunk())?;
        self.chunks.apply_voxel_update(update);
        Some(update)
    }

    /// Edits applied since the last call, in the order they were accepted.
    pub fn take_voxel_updates(&mut self) -> Vec<VoxelUpdate> {
        self.chunks.take_voxel_updates()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> ServerWorld {
        ServerWorld::new(VoxelRegistry::with_default_voxels(), 42)
    }

    #[test]
    fn test_generation_is_deterministic() {
        let mut a = world();
        let mut b = world();
        let position = ChunkPosition::new(-3, 1, 2);
        assert_eq!(a.chunk(position), b.chunk(position));

        // Generation order does not matter.
        let mut c = world();
        c.chunk(ChunkPosition::new(-2, 1, 2));
        let expected = a.chunk(position).cloned();
        assert_eq!(c.chunk(position).cloned(), expected);
    }

    #[test]
    fn test_terrain_layers() {
        let mut world = world();
        let surface = world.surface_height(3, 5);
        assert!((MIN_SURFACE..=MAX_SURFACE).contains(&surface));

        let grass = world.registry().id_of("grass").unwrap();
        let stone = world.registry().id_of("stone").unwrap();
        assert_eq!(world.get_voxel(VoxelPosition::new(3, surface, 5)), Some(grass));
        assert_eq!(world.get_voxel(VoxelPosition::new(3, surface + 1, 5)), Some(AIR));
        assert_eq!(world.get_voxel(VoxelPosition::new(3, 0, 5)), Some(stone));
    }

    #[test]
    fn test_spawn_point_above_terrain() {
        let world = world();
        let spawn = world.spawn_point();
        let surface = world.surface_height(spawn.x.floor() as i32, spawn.z.floor() as i32);
        assert!(spawn.y > surface as f32);
        assert_eq!(spawn, world.spawn_point());
    }

    #[test]
    fn test_out_of_bounds_chunks_are_absent() {
        let mut world = world();
        assert!(world.chunk(ChunkPosition::new(0, -1, 0)).is_none());
        assert!(world.chunk_data(ChunkPosition::new(WORLD_RADIUS_CHUNKS, 0, 0)).is_none());
        assert_eq!(world.loaded_chunks(), 0);
    }

    #[test]
    fn test_edit_validation() {
        let mut world = world();
        let inside = VoxelPosition::new(1, 40, 1);

        let unknown_voxel = VoxelEditRequest {
            position: inside,
            voxel: world.registry().len() as VoxelId,
        };
        assert!(world.apply_edit(&unknown_voxel).is_none());

        let outside = VoxelEditRequest {
            position: VoxelPosition::new(0, -1, 0),
            voxel: 1,
        };
        assert!(world.apply_edit(&outside).is_none());
        assert!(world.take_voxel_updates().is_empty());

        let valid = VoxelEditRequest {
            position: inside,
            voxel: 1,
        };
        let update = world.apply_edit(&valid).unwrap();
        assert_eq!(world.get_voxel(inside), Some(1));
        assert_eq!(world.take_voxel_updates(), vec![update]);
    }

    #[test]
    fn test_edit_bumps_chunk_version() {
        let mut world = world();
        let position = VoxelPosition::new(2, 2, 2);
        world.apply_edit(&VoxelEditRequest { position, voxel: AIR });
        world.apply_edit(&VoxelEditRequest { position, voxel: 1 });

        let data = world.chunk_data(position.chunk()).unwrap();
        assert_eq!(data.version, 2);
        let rebuilt = Chunk::from_runs(data.position, data.version, &data.runs).unwrap();
        assert_eq!(rebuilt.get(position.local()), 1);
    }
}
