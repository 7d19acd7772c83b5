//! Tank state carried by player updates.
//!
//! A state is packed in one of two shapes. The full shape sends raw floats;
//! the small shape quantizes position, velocity and angles into `i16`s and
//! is chosen automatically whenever every value fits its range. The type
//! code of the enclosing message records which shape was used.

use crate::protocol::{MSG_PLAYER_UPDATE, MSG_PLAYER_UPDATE_SMALL};
use crate::wire::{Pack, Vec3, WireReader};
use std::f32::consts::PI;

/// Full range of an `i16`, less one for safety.
const SMALL_SCALE: f32 = 32766.0;
/// 2 cm resolution.
const SMALL_MAX_DIST: f32 = 0.02 * SMALL_SCALE;
/// 1 cm/s resolution.
const SMALL_MAX_VEL: f32 = 0.01 * SMALL_SCALE;
/// 0.001 rad/s resolution.
const SMALL_MAX_ANG_VEL: f32 = 0.001 * SMALL_SCALE;

pub const STATUS_DEAD: i16 = 0x0000;
pub const STATUS_ALIVE: i16 = 0x0001;
pub const STATUS_PAUSED: i16 = 0x0002;
pub const STATUS_EXPLODING: i16 = 0x0004;
pub const STATUS_TELEPORTING: i16 = 0x0008;
pub const STATUS_FLAG_ACTIVE: i16 = 0x0010;
pub const STATUS_CROSSING_WALL: i16 = 0x0020;
pub const STATUS_FALLING: i16 = 0x0040;
pub const STATUS_JUMP_JETS: i16 = 0x0080;
pub const STATUS_ON_DRIVER: i16 = 0x0100;
pub const STATUS_USER_INPUTS: i16 = 0x0200;
pub const STATUS_PLAY_SOUND: i16 = 0x0400;

/// Largest player update payload: id, timestamp and a full state with
/// every conditional field present.
pub const MAX_PLAYER_UPDATE_LEN: usize = 1 + 8 + 4 + 2 + 12 + 12 + 4 + 4 + 2 + 4 + 4 + 1;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerState {
    pub order: i32,
    pub status: i16,
    pub position: Vec3,
    pub velocity: Vec3,
    pub azimuth: f32,
    pub angular_velocity: f32,
    pub jump_jets_scale: f32,
    /// Physics driver id, -1 when not on one.
    pub physics_driver: i32,
    pub user_speed: f32,
    pub user_angular_velocity: f32,
    pub sounds: u8,
}

fn clamped(value: f32, max: f32) -> f32 {
    value.clamp(-max, max)
}

impl PlayerState {
    pub fn new() -> Self {
        Self {
            physics_driver: -1,
            ..Self::default()
        }
    }

    fn has(&self, flag: i16) -> bool {
        self.status & flag != 0
    }

    /// True when every quantized field fits the small encoding.
    pub fn fits_small(&self) -> bool {
        self.position.iter().all(|p| p.abs() < SMALL_MAX_DIST)
            && self.velocity.iter().all(|v| v.abs() < SMALL_MAX_VEL)
            && self.angular_velocity.abs() < SMALL_MAX_ANG_VEL
    }

    /// Packs the state and returns the message code matching the shape used.
    pub fn pack<P: Pack>(&self, out: &mut P) -> u16 {
        out.pack_i32(self.order).pack_i16(self.status);

        let code = if self.fits_small() {
            for p in self.position {
                out.pack_i16(((p * SMALL_SCALE) / SMALL_MAX_DIST) as i16);
            }
            for v in self.velocity {
                out.pack_i16(((v * SMALL_SCALE) / SMALL_MAX_VEL) as i16);
            }
            let mut angle = self.azimuth % (2.0 * PI);
            if angle > PI {
                angle -= 2.0 * PI;
            } else if angle < -PI {
                angle += 2.0 * PI;
            }
            out.pack_i16(((angle * SMALL_SCALE) / PI) as i16);
            out.pack_i16(((self.angular_velocity * SMALL_SCALE) / SMALL_MAX_ANG_VEL) as i16);
            MSG_PLAYER_UPDATE_SMALL
        } else {
            out.pack_vec3(self.position)
                .pack_vec3(self.velocity)
                .pack_f32(self.azimuth)
                .pack_f32(self.angular_velocity);
            MSG_PLAYER_UPDATE
        };

        if self.has(STATUS_JUMP_JETS) {
            out.pack_i16((clamped(self.jump_jets_scale, 1.0) * SMALL_SCALE) as i16);
        }
        if self.has(STATUS_ON_DRIVER) {
            out.pack_i32(self.physics_driver);
        }
        if self.has(STATUS_USER_INPUTS) {
            let speed = clamped(self.user_speed, SMALL_MAX_VEL);
            out.pack_i16(((speed * SMALL_SCALE) / SMALL_MAX_VEL) as i16);
            let ang = clamped(self.user_angular_velocity, SMALL_MAX_ANG_VEL);
            out.pack_i16(((ang * SMALL_SCALE) / SMALL_MAX_ANG_VEL) as i16);
        }
        if self.has(STATUS_PLAY_SOUND) {
            out.pack_u8(self.sounds);
        }
        code
    }

    /// Unpacks a state whose shape is given by the enclosing message code.
    pub fn unpack(reader: &mut WireReader<'_>, code: u16) -> Self {
        let mut state = Self::new();
        state.order = reader.unpack_i32();
        state.status = reader.unpack_i16();

        if code == MSG_PLAYER_UPDATE {
            state.position = reader.unpack_vec3();
            state.velocity = reader.unpack_vec3();
            state.azimuth = reader.unpack_f32();
            state.angular_velocity = reader.unpack_f32();
        } else {
            for i in 0..3 {
                state.position[i] = (reader.unpack_i16() as f32 * SMALL_MAX_DIST) / SMALL_SCALE;
            }
            for i in 0..3 {
                state.velocity[i] = (reader.unpack_i16() as f32 * SMALL_MAX_VEL) / SMALL_SCALE;
            }
            state.azimuth = (reader.unpack_i16() as f32 * PI) / SMALL_SCALE;
            state.angular_velocity =
                (reader.unpack_i16() as f32 * SMALL_MAX_ANG_VEL) / SMALL_SCALE;
        }

        if state.has(STATUS_JUMP_JETS) {
            state.jump_jets_scale = reader.unpack_i16() as f32 / SMALL_SCALE;
        }
        if state.has(STATUS_ON_DRIVER) {
            state.physics_driver = reader.unpack_i32();
        }
        if state.has(STATUS_USER_INPUTS) {
            state.user_speed = (reader.unpack_i16() as f32 * SMALL_MAX_VEL) / SMALL_SCALE;
            state.user_angular_velocity =
                (reader.unpack_i16() as f32 * SMALL_MAX_ANG_VEL) / SMALL_SCALE;
        }
        if state.has(STATUS_PLAY_SOUND) {
            state.sounds = reader.unpack_u8();
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn moving_state() -> PlayerState {
        PlayerState {
            order: 12,
            status: STATUS_ALIVE,
            position: [10.5, -20.25, 3.0],
            velocity: [5.0, 0.0, -1.5],
            azimuth: 1.0,
            angular_velocity: 0.5,
            ..PlayerState::new()
        }
    }

    #[test]
    fn test_small_shape_chosen_when_in_range() {
        let state = moving_state();
        let mut buf = Vec::new();
        assert_eq!(state.pack(&mut buf), MSG_PLAYER_UPDATE_SMALL);
        assert_eq!(buf.len(), 4 + 2 + 16);

        let decoded = PlayerState::unpack(&mut WireReader::new(&buf), MSG_PLAYER_UPDATE_SMALL);
        assert_eq!(decoded.order, 12);
        assert_approx_eq!(decoded.position[0], 10.5, 0.02);
        assert_approx_eq!(decoded.position[1], -20.25, 0.02);
        assert_approx_eq!(decoded.velocity[2], -1.5, 0.01);
        assert_approx_eq!(decoded.azimuth, 1.0, 0.001);
        assert_approx_eq!(decoded.angular_velocity, 0.5, 0.001);
    }

    #[test]
    fn test_full_shape_when_out_of_range() {
        let state = PlayerState {
            position: [700.0, 0.0, 0.0],
            ..moving_state()
        };
        let mut buf = Vec::new();
        assert_eq!(state.pack(&mut buf), MSG_PLAYER_UPDATE);
        assert_eq!(buf.len(), 4 + 2 + 32);

        let decoded = PlayerState::unpack(&mut WireReader::new(&buf), MSG_PLAYER_UPDATE);
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_azimuth_wrapped_into_half_turn() {
        let state = PlayerState {
            azimuth: 1.5 * PI,
            ..moving_state()
        };
        let mut buf = Vec::new();
        state.pack(&mut buf);
        let decoded = PlayerState::unpack(&mut WireReader::new(&buf), MSG_PLAYER_UPDATE_SMALL);
        assert_approx_eq!(decoded.azimuth, -0.5 * PI, 0.001);
    }

    #[test]
    fn test_conditional_fields_reach_documented_maximum() {
        let state = PlayerState {
            status: STATUS_ALIVE
                | STATUS_JUMP_JETS
                | STATUS_ON_DRIVER
                | STATUS_USER_INPUTS
                | STATUS_PLAY_SOUND,
            position: [1000.0, 0.0, 0.0],
            jump_jets_scale: 0.5,
            physics_driver: 42,
            user_speed: 12.0,
            user_angular_velocity: -0.75,
            sounds: 3,
            ..moving_state()
        };
        let mut buf = Vec::new();
        buf.pack_u8(1).pack_f64(0.0);
        state.pack(&mut buf);
        assert_eq!(buf.len(), MAX_PLAYER_UPDATE_LEN);
        assert_eq!(MAX_PLAYER_UPDATE_LEN, 58);

        let mut reader = WireReader::new(&buf[9..]);
        let decoded = PlayerState::unpack(&mut reader, MSG_PLAYER_UPDATE);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(decoded.physics_driver, 42);
        assert_eq!(decoded.sounds, 3);
        assert_approx_eq!(decoded.jump_jets_scale, 0.5, 0.001);
        assert_approx_eq!(decoded.user_speed, 12.0, 0.01);
        assert_approx_eq!(decoded.user_angular_velocity, -0.75, 0.001);
    }

    #[test]
    fn test_physics_driver_defaults_when_absent() {
        let mut buf = Vec::new();
        moving_state().pack(&mut buf);
        let decoded = PlayerState::unpack(&mut WireReader::new(&buf), MSG_PLAYER_UPDATE_SMALL);
        assert_eq!(decoded.physics_driver, -1);
    }
}
