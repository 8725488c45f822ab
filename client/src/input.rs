//! Client input management with change detection

use shared::protocol::PlayerInput;
use shared::{ClientId, InputFlags};

/// Pitch is kept short of straight up or down.
pub const MAX_PITCH: f32 = 89.0;

/// Ticks between input packets when nothing changes.
pub const INPUT_KEEPALIVE_TICKS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Forward,
    Back,
    Left,
    Right,
}

impl Key {
    fn flag(self) -> InputFlags {
        match self {
            Key::Forward => InputFlags::FORWARD,
            Key::Back => InputFlags::BACK,
            Key::Left => InputFlags::LEFT,
            Key::Right => InputFlags::RIGHT,
        }
    }
}

/// Turns key and mouse events into the input packets sent to the server
pub struct InputController {
    flags: InputFlags,
    pitch: f32,
    yaw: f32,
    sensitivity: f32,

    // Last state sent, for change detection
    last_sent: Option<(InputFlags, f32, f32)>,
    ticks_since_sent: u32,
}

impl InputController {
    pub fn new(sensitivity: f32) -> Self {
        Self {
            flags: InputFlags::empty(),
            pitch: 0.0,
            yaw: 0.0,
            sensitivity,
            last_sent: None,
            ticks_since_sent: 0,
        }
    }

    pub fn set_key(&mut self, key: Key, pressed: bool) {
        self.flags.set(key.flag(), pressed);
    }

    pub fn release_all(&mut self) {
        self.flags = InputFlags::empty();
    }

    pub fn flags(&self) -> InputFlags {
        self.flags
    }

    /// Rotates the view by a mouse movement.
    pub fn look(&mut self, dx: f32, dy: f32) {
        self.yaw = (self.yaw + dx * self.sensitivity).rem_euclid(360.0);
        self.pitch = (self.pitch - dy * self.sensitivity).clamp(-MAX_PITCH, MAX_PITCH);
    }

    pub fn set_rotation(&mut self, pitch: f32, yaw: f32) {
        self.pitch = pitch.clamp(-MAX_PITCH, MAX_PITCH);
        self.yaw = yaw.rem_euclid(360.0);
    }

    /// Pitch and yaw in degrees.
    pub fn rotation(&self) -> (f32, f32) {
        (self.pitch, self.yaw)
    }

    pub fn to_packet(&self, client_id: ClientId) -> PlayerInput {
        PlayerInput {
            client_id,
            input: self.flags,
            rotation_x: self.pitch,
            rotation_y: self.yaw,
        }
    }

    /// Returns a packet if the input changed or the keep-alive is due.
    pub fn poll(&mut self, client_id: ClientId) -> Option<PlayerInput> {
        let current = (self.flags, self.pitch, self.yaw);
        self.ticks_since_sent += 1;

        let changed = self.last_sent != Some(current);
        if !changed && self.ticks_since_sent < INPUT_KEEPALIVE_TICKS {
            return None;
        }

        self.last_sent = Some(current);
        self.ticks_since_sent = 0;
        Some(self.to_packet(client_id))
    }
}
