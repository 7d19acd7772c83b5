//! Decoded form of server-to-client messages.
//!
//! The server builds outbound messages by packing a [`GameEvent`], and
//! in-process players receive the very same value instead of bytes. Network
//! clients decode the bytes back with [`GameEvent::decode`].

use crate::player_state::PlayerState;
use crate::protocol::*;
use crate::wire::{Pack, Vec3, WireReader};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{name} payload truncated at {len} bytes")]
    Truncated { name: &'static str, len: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub id: PlayerIndex,
    pub wins: u16,
    pub losses: u16,
    pub team_kills: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    Accept {
        index: PlayerIndex,
    },
    Reject {
        code: u16,
        reason: String,
    },
    PlayerAdded {
        id: PlayerIndex,
        player_type: u16,
        team: u16,
        wins: u16,
        losses: u16,
        team_kills: u16,
        callsign: String,
    },
    PlayerRemoved {
        id: PlayerIndex,
    },
    PlayerUpdate {
        id: PlayerIndex,
        timestamp: f64,
        state: PlayerState,
    },
    ShotBegin {
        player: PlayerIndex,
        shot_id: u16,
        shot_type: u8,
        position: Vec3,
        velocity: Vec3,
        lifetime: f32,
    },
    ShotEnd {
        player: PlayerIndex,
        shot_id: i16,
        reason: u16,
    },
    GuidedMissileUpdate {
        player: PlayerIndex,
        shot_id: u16,
        position: Vec3,
        velocity: Vec3,
        target: PlayerIndex,
    },
    Chat {
        from: PlayerIndex,
        to: PlayerIndex,
        kind: u8,
        text: String,
    },
    Alive {
        id: PlayerIndex,
        position: Vec3,
        azimuth: f32,
    },
    Killed {
        victim: PlayerIndex,
        killer: PlayerIndex,
        reason: i16,
        shot_id: i16,
        flag: [u8; 2],
        physics_driver: Option<i32>,
    },
    Teleport {
        id: PlayerIndex,
        from: u16,
        to: u16,
    },
    Score(Vec<ScoreRecord>),
    FlagGrabbed {
        player: PlayerIndex,
        flag: u16,
    },
    FlagDropped {
        player: PlayerIndex,
        flag: u16,
        position: Vec3,
    },
    FlagCaptured {
        player: PlayerIndex,
        flag: u16,
        team: u16,
    },
    TimeUpdate {
        seconds: i32,
    },
    LagPing {
        sequence: u16,
    },
    TimeReply {
        tag: u8,
        seconds: f64,
    },
    SuperKill,
    UdpLinkRequest {
        index: PlayerIndex,
    },
    UdpLinkEstablished,
    /// A code this decoder has no layout for.
    Unhandled {
        code: u16,
        payload: Vec<u8>,
    },
}

impl GameEvent {
    /// Packs the payload and returns the type code to frame it with.
    pub fn pack<P: Pack>(&self, out: &mut P) -> u16 {
        match self {
            GameEvent::Accept { index } => {
                out.pack_u8(*index);
                MSG_ACCEPT
            }
            GameEvent::Reject { code, reason } => {
                out.pack_u16(*code).pack_bytes(reason.as_bytes());
                MSG_REJECT
            }
            GameEvent::PlayerAdded {
                id,
                player_type,
                team,
                wins,
                losses,
                team_kills,
                callsign,
            } => {
                out.pack_u8(*id)
                    .pack_u16(*player_type)
                    .pack_u16(*team)
                    .pack_u16(*wins)
                    .pack_u16(*losses)
                    .pack_u16(*team_kills)
                    .pack_fixed_str(callsign, CALLSIGN_LEN);
                MSG_ADD_PLAYER
            }
            GameEvent::PlayerRemoved { id } => {
                out.pack_u8(*id);
                MSG_REMOVE_PLAYER
            }
            GameEvent::PlayerUpdate {
                id,
                timestamp,
                state,
            } => {
                out.pack_u8(*id).pack_f64(*timestamp);
                state.pack(out)
            }
            GameEvent::ShotBegin {
                player,
                shot_id,
                shot_type,
                position,
                velocity,
                lifetime,
            } => {
                out.pack_u8(*player)
                    .pack_u16(*shot_id)
                    .pack_u8(*shot_type)
                    .pack_vec3(*position)
                    .pack_vec3(*velocity)
                    .pack_f32(*lifetime);
                MSG_SHOT_BEGIN
            }
            GameEvent::ShotEnd {
                player,
                shot_id,
                reason,
            } => {
                out.pack_u8(*player).pack_i16(*shot_id).pack_u16(*reason);
                MSG_SHOT_END
            }
            GameEvent::GuidedMissileUpdate {
                player,
                shot_id,
                position,
                velocity,
                target,
            } => {
                out.pack_u8(*player)
                    .pack_u16(*shot_id)
                    .pack_vec3(*position)
                    .pack_vec3(*velocity)
                    .pack_u8(*target);
                MSG_GM_UPDATE
            }
            GameEvent::Chat {
                from,
                to,
                kind,
                text,
            } => {
                out.pack_u8(*from)
                    .pack_u8(*to)
                    .pack_u8(*kind)
                    .pack_bytes(text.as_bytes())
                    .pack_u8(0);
                MSG_MESSAGE
            }
            GameEvent::Alive {
                id,
                position,
                azimuth,
            } => {
                out.pack_u8(*id).pack_vec3(*position).pack_f32(*azimuth);
                MSG_ALIVE
            }
            GameEvent::Killed {
                victim,
                killer,
                reason,
                shot_id,
                flag,
                physics_driver,
            } => {
                out.pack_u8(*victim)
                    .pack_u8(*killer)
                    .pack_i16(*reason)
                    .pack_i16(*shot_id)
                    .pack_bytes(flag);
                if *reason == PHYSICS_DRIVER_DEATH {
                    out.pack_i32(physics_driver.unwrap_or(-1));
                }
                MSG_KILLED
            }
            GameEvent::Teleport { id, from, to } => {
                out.pack_u8(*id).pack_u16(*from).pack_u16(*to);
                MSG_TELEPORT
            }
            GameEvent::Score(records) => {
                out.pack_u8(records.len() as u8);
                for record in records {
                    out.pack_u8(record.id)
                        .pack_u16(record.wins)
                        .pack_u16(record.losses)
                        .pack_u16(record.team_kills);
                }
                MSG_SCORE
            }
            GameEvent::FlagGrabbed { player, flag } => {
                out.pack_u8(*player).pack_u16(*flag);
                MSG_GRAB_FLAG
            }
            GameEvent::FlagDropped {
                player,
                flag,
                position,
            } => {
                out.pack_u8(*player).pack_u16(*flag).pack_vec3(*position);
                MSG_DROP_FLAG
            }
            GameEvent::FlagCaptured { player, flag, team } => {
                out.pack_u8(*player).pack_u16(*flag).pack_u16(*team);
                MSG_CAPTURE_FLAG
            }
            GameEvent::TimeUpdate { seconds } => {
                out.pack_i32(*seconds);
                MSG_TIME_UPDATE
            }
            GameEvent::LagPing { sequence } => {
                out.pack_u16(*sequence);
                MSG_LAG_PING
            }
            GameEvent::TimeReply { tag, seconds } => {
                out.pack_u8(*tag).pack_f64(*seconds);
                MSG_WHAT_TIME_IS_IT
            }
            GameEvent::SuperKill => MSG_SUPER_KILL,
            GameEvent::UdpLinkRequest { index } => {
                out.pack_u8(*index);
                MSG_UDP_LINK_REQUEST
            }
            GameEvent::UdpLinkEstablished => MSG_UDP_LINK_ESTABLISHED,
            GameEvent::Unhandled { code, payload } => {
                out.pack_bytes(payload);
                *code
            }
        }
    }

    /// Decodes a server-to-client payload.
    pub fn decode(code: u16, payload: &[u8]) -> Result<GameEvent, DecodeError> {
        let mut r = WireReader::new(payload);
        let event = match code {
            MSG_ACCEPT => GameEvent::Accept {
                index: r.unpack_u8(),
            },
            MSG_REJECT => GameEvent::Reject {
                code: r.unpack_u16(),
                reason: String::from_utf8_lossy(r.rest()).into_owned(),
            },
            MSG_ADD_PLAYER => GameEvent::PlayerAdded {
                id: r.unpack_u8(),
                player_type: r.unpack_u16(),
                team: r.unpack_u16(),
                wins: r.unpack_u16(),
                losses: r.unpack_u16(),
                team_kills: r.unpack_u16(),
                callsign: r.unpack_fixed_str(CALLSIGN_LEN),
            },
            MSG_REMOVE_PLAYER => GameEvent::PlayerRemoved { id: r.unpack_u8() },
            MSG_PLAYER_UPDATE | MSG_PLAYER_UPDATE_SMALL => GameEvent::PlayerUpdate {
                id: r.unpack_u8(),
                timestamp: r.unpack_f64(),
                state: PlayerState::unpack(&mut r, code),
            },
            MSG_SHOT_BEGIN => GameEvent::ShotBegin {
                player: r.unpack_u8(),
                shot_id: r.unpack_u16(),
                shot_type: r.unpack_u8(),
                position: r.unpack_vec3(),
                velocity: r.unpack_vec3(),
                lifetime: r.unpack_f32(),
            },
            MSG_SHOT_END => GameEvent::ShotEnd {
                player: r.unpack_u8(),
                shot_id: r.unpack_i16(),
                reason: r.unpack_u16(),
            },
            MSG_GM_UPDATE => GameEvent::GuidedMissileUpdate {
                player: r.unpack_u8(),
                shot_id: r.unpack_u16(),
                position: r.unpack_vec3(),
                velocity: r.unpack_vec3(),
                target: r.unpack_u8(),
            },
            MSG_MESSAGE => {
                let from = r.unpack_u8();
                let to = r.unpack_u8();
                let kind = r.unpack_u8();
                let rest = r.rest();
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                GameEvent::Chat {
                    from,
                    to,
                    kind,
                    text: String::from_utf8_lossy(&rest[..end]).into_owned(),
                }
            }
            MSG_ALIVE => GameEvent::Alive {
                id: r.unpack_u8(),
                position: r.unpack_vec3(),
                azimuth: r.unpack_f32(),
            },
            MSG_KILLED => {
                let victim = r.unpack_u8();
                let killer = r.unpack_u8();
                let reason = r.unpack_i16();
                let shot_id = r.unpack_i16();
                let flag = match r.unpack_bytes(2) {
                    [a, b] => [*a, *b],
                    _ => [0, 0],
                };
                let physics_driver = (reason == PHYSICS_DRIVER_DEATH).then(|| r.unpack_i32());
                GameEvent::Killed {
                    victim,
                    killer,
                    reason,
                    shot_id,
                    flag,
                    physics_driver,
                }
            }
            MSG_TELEPORT => GameEvent::Teleport {
                id: r.unpack_u8(),
                from: r.unpack_u16(),
                to: r.unpack_u16(),
            },
            MSG_SCORE => {
                let count = r.unpack_u8();
                let records = (0..count)
                    .map(|_| ScoreRecord {
                        id: r.unpack_u8(),
                        wins: r.unpack_u16(),
                        losses: r.unpack_u16(),
                        team_kills: r.unpack_u16(),
                    })
                    .collect();
                GameEvent::Score(records)
            }
            MSG_GRAB_FLAG => GameEvent::FlagGrabbed {
                player: r.unpack_u8(),
                flag: r.unpack_u16(),
            },
            MSG_DROP_FLAG => GameEvent::FlagDropped {
                player: r.unpack_u8(),
                flag: r.unpack_u16(),
                position: r.unpack_vec3(),
            },
            MSG_CAPTURE_FLAG => GameEvent::FlagCaptured {
                player: r.unpack_u8(),
                flag: r.unpack_u16(),
                team: r.unpack_u16(),
            },
            MSG_TIME_UPDATE => GameEvent::TimeUpdate {
                seconds: r.unpack_i32(),
            },
            MSG_LAG_PING => GameEvent::LagPing {
                sequence: r.unpack_u16(),
            },
            MSG_WHAT_TIME_IS_IT => GameEvent::TimeReply {
                tag: r.unpack_u8(),
                seconds: r.unpack_f64(),
            },
            MSG_SUPER_KILL => GameEvent::SuperKill,
            MSG_UDP_LINK_REQUEST => GameEvent::UdpLinkRequest {
                index: r.unpack_u8(),
            },
            MSG_UDP_LINK_ESTABLISHED => GameEvent::UdpLinkEstablished,
            _ => GameEvent::Unhandled {
                code,
                payload: payload.to_vec(),
            },
        };

        if r.is_overrun() {
            return Err(DecodeError::Truncated {
                name: code_name(code),
                len: payload.len(),
            });
        }
        Ok(event)
    }
}
