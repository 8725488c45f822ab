use glam::Vec3;
use log::debug;
use shared::protocol::{EntitySnapshot, Snapshot};
use shared::{ClientId, Entity, InputFlags};

/// Authoritative simulation state: the entity arena and the tick counter.
///
/// Entities are allocated once, one per session slot, and addressed by index.
#[derive(Debug, Clone)]
pub struct GameState {
    pub tick: u32,
    entities: Vec<Entity>,
    alive: usize,
}

impl GameState {
    pub fn new(capacity: usize) -> Self {
        Self {
            tick: 0,
            entities: vec![Entity::default(); capacity],
            alive: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entities.len()
    }

    pub fn alive_count(&self) -> usize {
        self.alive
    }

    pub fn entity(&self, index: usize) -> Option<&Entity> {
        self.entities.get(index)
    }

    pub fn entity_mut(&mut self, index: usize) -> Option<&mut Entity> {
        self.entities.get_mut(index)
    }

    /// Resets entity `index` to fresh spawn values and marks it alive.
    pub fn spawn(&mut self, index: usize, position: Vec3) -> bool {
        let Some(entity) = self.entities.get_mut(index) else {
            return false;
        };
        if !entity.alive {
            self.alive += 1;
        }
        entity.respawn(position);
        debug!("Spawned entity {} at {}", index, position);
        true
    }

    pub fn despawn(&mut self, index: usize) -> bool {
        match self.entities.get_mut(index) {
            Some(entity) if entity.alive => {
                entity.kill();
                self.alive -= 1;
                true
            }
            _ => false,
        }
    }

    /// Stores the look direction reported by the owning client.
    pub fn set_rotation(&mut self, index: usize, pitch: f32, yaw: f32) {
        if let Some(entity) = self.entities.get_mut(index) {
            entity.rotation = Vec3::new(pitch, yaw, 0.0);
        }
    }

    pub fn apply_input(&mut self, index: usize, input: InputFlags, dt: f32) {
        if let Some(entity) = self.entities.get_mut(index) {
            if entity.alive {
                entity.apply_input(input, dt);
            }
        }
    }

    /// Positions and rotations of all alive entities at the current tick.
    pub fn snapshot(&self) -> Snapshot {
        let entities = self
            .entities
            .iter()
            .enumerate()
            .filter(|(_, entity)| entity.alive)
            .map(|(index, entity)| EntitySnapshot {
                client_id: index as ClientId,
                position: entity.position,
                rotation: entity.rotation,
            })
            .collect();

        Snapshot {
            tick: self.tick,
            entities,
        }
    }

    pub fn advance(&mut self) {
        self.tick = self.tick.wrapping_add(1);
    }
}
