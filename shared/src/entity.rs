//! Player entities and the movement rules applied to them

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Horizontal movement speed in voxels per second.
pub const PLAYER_SPEED: f32 = 5.0;

/// Movement keys held by a player, as sent in `PlayerInput`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputFlags(u8);

impl InputFlags {
    pub const FORWARD: InputFlags = InputFlags(1 << 0);
    pub const BACK: InputFlags = InputFlags(1 << 1);
    pub const LEFT: InputFlags = InputFlags(1 << 2);
    pub const RIGHT: InputFlags = InputFlags(1 << 3);

    pub const fn empty() -> Self {
        InputFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        InputFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: InputFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, flag: InputFlags, pressed: bool) {
        if pressed {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InputFlags {
    type Output = InputFlags;

    fn bitor(self, rhs: InputFlags) -> InputFlags {
        InputFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for InputFlags {
    fn bitor_assign(&mut self, rhs: InputFlags) {
        self.0 |= rhs.0;
    }
}

/// A player body. Both roles keep a fixed array of these indexed by ClientId.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    pub position: Vec3,
    /// Pitch (x) and yaw (y) in degrees, as reported by the owning client.
    pub rotation: Vec3,
    pub velocity: Vec3,
    pub alive: bool,
    pub skin: Option<Vec<u8>>,
}

impl Entity {
    /// Puts the entity back into its freshly spawned state.
    ///
    /// Everything the previous occupant left behind (velocity, look
    /// direction, skin) is cleared.
    pub fn respawn(&mut self, spawn: Vec3) {
        *self = Entity {
            position: spawn,
            alive: true,
            ..Entity::default()
        };
    }

    pub fn kill(&mut self) {
        self.alive = false;
        self.velocity = Vec3::ZERO;
    }

    /// Moves the entity for one tick of held input.
    ///
    /// Forward wins over back and left wins over right when both keys of a pair
    /// are held, so conflicting input never cancels out to a standstill.
    pub fn apply_input(&mut self, input: InputFlags, dt: f32) {
        let yaw = self.rotation.y.to_radians();
        let forward = Vec3::new(yaw.sin(), 0.0, -yaw.cos());
        let right = Vec3::new(yaw.cos(), 0.0, yaw.sin());

        let mut direction = Vec3::ZERO;
        if input.contains(InputFlags::FORWARD) {
            direction += forward;
        } else if input.contains(InputFlags::BACK) {
            direction -= forward;
        }
        if input.contains(InputFlags::LEFT) {
            direction -= right;
        } else if input.contains(InputFlags::RIGHT) {
            direction += right;
        }

        self.velocity = direction.normalize_or_zero() * PLAYER_SPEED;
        self.position += self.velocity * dt;
    }
}
