//! Game-level handling of decoded client traffic.
//!
//! The transport layer owns sessions and bytes; a [`GameRules`]
//! implementation owns what the messages mean. [`RelayRules`] is the stock
//! behaviour: admit players, route chat, relay movement and combat events,
//! and keep an eye on lag.

use crate::context::ServerContext;
use crate::error::CloseReason;
use crate::registry::Departure;
use log::{debug, info};
use shared::protocol::*;
use shared::{GameEvent, OwnedFrame, PlayerIndex, ScoreRecord, WireReader};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub use shared::gameinfo::TEAM_COUNT;

const LAG_PING_INTERVAL: Duration = Duration::from_secs(5);
const TIME_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

pub trait GameRules: Send {
    /// A session was added, before it has sent anything.
    fn on_join(&mut self, _ctx: &mut ServerContext, _player: PlayerIndex, _now: Instant) {}

    /// One frame from `player`. An error closes the session with that
    /// reason.
    fn on_message(
        &mut self,
        ctx: &mut ServerContext,
        player: PlayerIndex,
        frame: &OwnedFrame,
        now: Instant,
    ) -> Result<(), CloseReason>;

    /// A session left the registry.
    fn on_departure(&mut self, _ctx: &mut ServerContext, _departure: &Departure) {}

    fn on_tick(&mut self, _ctx: &mut ServerContext, _now: Instant) {}

    /// Players per team, for list-server reports.
    fn team_counts(&self) -> [u16; TEAM_COUNT] {
        [0; TEAM_COUNT]
    }
}

#[derive(Debug, Default)]
struct LagTracker {
    sequence: u16,
    outstanding: Option<(u16, Instant)>,
    last_sent: Option<Instant>,
    rtt: Option<Duration>,
    lost: u32,
}

#[derive(Debug, Default)]
struct PlayerRecord {
    entered: bool,
    callsign: String,
    player_type: u16,
    team: u16,
    wins: u16,
    losses: u16,
    team_kills: u16,
    lag: LagTracker,
}

impl PlayerRecord {
    fn added_event(&self, id: PlayerIndex) -> GameEvent {
        GameEvent::PlayerAdded {
            id,
            player_type: self.player_type,
            team: self.team,
            wins: self.wins,
            losses: self.losses,
            team_kills: self.team_kills,
            callsign: self.callsign.clone(),
        }
    }

    fn score(&self, id: PlayerIndex) -> ScoreRecord {
        ScoreRecord {
            id,
            wins: self.wins,
            losses: self.losses,
            team_kills: self.team_kills,
        }
    }
}

pub struct RelayRules {
    players: BTreeMap<PlayerIndex, PlayerRecord>,
    lag_ping_interval: Duration,
    time_limit: Option<Duration>,
    started: Option<Instant>,
    last_time_update: Option<Instant>,
}

impl Default for RelayRules {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayRules {
    pub fn new() -> Self {
        Self {
            players: BTreeMap::new(),
            lag_ping_interval: LAG_PING_INTERVAL,
            time_limit: None,
            started: None,
            last_time_update: None,
        }
    }

    /// Broadcasts the remaining game time every thirty seconds.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_lag_ping_interval(mut self, interval: Duration) -> Self {
        self.lag_ping_interval = interval;
        self
    }

    pub fn is_entered(&self, player: PlayerIndex) -> bool {
        self.players.get(&player).is_some_and(|record| record.entered)
    }

    pub fn callsign(&self, player: PlayerIndex) -> Option<&str> {
        self.players
            .get(&player)
            .filter(|record| record.entered)
            .map(|record| record.callsign.as_str())
    }

    /// Last measured round trip for `player`.
    pub fn lag(&self, player: PlayerIndex) -> Option<Duration> {
        self.players.get(&player).and_then(|record| record.lag.rtt)
    }

    fn enter(
        &mut self,
        ctx: &mut ServerContext,
        player: PlayerIndex,
        payload: &[u8],
    ) -> Result<(), CloseReason> {
        if self.is_entered(player) {
            return Err(CloseReason::ProtocolViolation("entered twice".into()));
        }
        let mut r = WireReader::new(payload);
        let player_type = r.unpack_u16();
        let team = r.unpack_u16();
        let callsign = r.unpack_fixed_str(CALLSIGN_LEN);

        let taken = self
            .players
            .values()
            .any(|record| record.entered && record.callsign.eq_ignore_ascii_case(&callsign));
        if callsign.is_empty() || !is_printable_text(callsign.as_bytes()) || taken {
            return Self::reject(ctx, player, REJECT_BAD_CALLSIGN, "bad callsign");
        }
        if usize::from(team) >= TEAM_COUNT {
            return Self::reject(ctx, player, REJECT_BAD_REQUEST, "bad team");
        }

        let record = self.players.entry(player).or_default();
        record.entered = true;
        record.player_type = player_type;
        record.team = team;
        record.callsign = callsign;
        info!("Player {} entered as {:?} on team {}", player, record.callsign, team);
        let added = record.added_event(player);

        ctx.send_event(player, GameEvent::Accept { index: player });
        for (&id, other) in &self.players {
            if id != player && other.entered {
                ctx.send_event(player, other.added_event(id));
            }
        }
        ctx.broadcast_event(added);
        Ok(())
    }

    /// Tells the player why before the session goes away.
    fn reject(
        ctx: &mut ServerContext,
        player: PlayerIndex,
        code: u16,
        reason: &str,
    ) -> Result<(), CloseReason> {
        ctx.send_event(
            player,
            GameEvent::Reject {
                code,
                reason: reason.to_string(),
            },
        );
        ctx.flush_player(player);
        Err(CloseReason::Kicked(reason.to_string()))
    }

    fn chat(
        &mut self,
        ctx: &mut ServerContext,
        player: PlayerIndex,
        payload: &[u8],
    ) -> Result<(), CloseReason> {
        let to = payload[0];
        let kind = payload[1];
        let rest = &payload[2..];
        let text = &rest[..rest.iter().position(|&b| b == 0).unwrap_or(rest.len())];
        if text.len() > MESSAGE_LEN || !is_printable_text(text) {
            return Err(CloseReason::ProtocolViolation("bad chat text".into()));
        }
        let event = GameEvent::Chat {
            from: player,
            to,
            kind,
            text: String::from_utf8_lossy(text).into_owned(),
        };

        match to {
            ALL_PLAYERS => ctx.broadcast_event(event),
            target if target <= LAST_REAL_PLAYER => {
                if !ctx.registry.contains(target) {
                    debug!("Player {} wrote to absent player {}", player, target);
                    return Ok(());
                }
                if target != player {
                    ctx.send_event(target, event.clone());
                }
                ctx.send_event(player, event);
            }
            target if target <= TEAM_TARGET_BASE && target > TEAM_TARGET_BASE - TEAM_COUNT as u8 => {
                let team = u16::from(TEAM_TARGET_BASE - target);
                let members: Vec<PlayerIndex> = self
                    .players
                    .iter()
                    .filter(|(_, record)| record.entered && record.team == team)
                    .map(|(&id, _)| id)
                    .collect();
                for &member in &members {
                    ctx.send_event(member, event.clone());
                }
                if !members.contains(&player) {
                    ctx.send_event(player, event);
                }
            }
            _ => debug!("Player {} wrote to unsupported target {}", player, to),
        }
        Ok(())
    }

    fn lag_reply(&mut self, player: PlayerIndex, payload: &[u8], now: Instant) {
        let sequence = WireReader::new(payload).unpack_u16();
        let Some(record) = self.players.get_mut(&player) else {
            return;
        };
        match record.lag.outstanding {
            Some((expected, sent)) if expected == sequence => {
                let rtt = now.saturating_duration_since(sent);
                record.lag.rtt = Some(rtt);
                record.lag.outstanding = None;
                debug!("Player {} lag {} ms", player, rtt.as_millis());
            }
            _ => debug!("Player {} answered stale lag ping {}", player, sequence),
        }
    }

    /// Decodes an event a client reports about itself and passes it on to
    /// everyone.
    fn relay_event(
        &mut self,
        ctx: &mut ServerContext,
        player: PlayerIndex,
        frame: &OwnedFrame,
    ) -> Result<(), CloseReason> {
        let event = GameEvent::decode(frame.code, &frame.payload)
            .map_err(|e| CloseReason::ProtocolViolation(e.to_string()))?;
        let owner = match &event {
            GameEvent::ShotBegin { player, .. }
            | GameEvent::ShotEnd { player, .. }
            | GameEvent::GuidedMissileUpdate { player, .. }
            | GameEvent::FlagGrabbed { player, .. }
            | GameEvent::FlagDropped { player, .. }
            | GameEvent::FlagCaptured { player, .. } => *player,
            GameEvent::Alive { id, .. } | GameEvent::Teleport { id, .. } => *id,
            GameEvent::Killed { victim, .. } => *victim,
            _ => player,
        };
        if owner != player {
            return Err(CloseReason::ProtocolViolation(format!(
                "{} for player {}",
                code_name(frame.code),
                owner
            )));
        }

        let score = match &event {
            GameEvent::Killed { victim, killer, .. } => self.score_kill(*victim, *killer),
            _ => None,
        };
        ctx.broadcast_event(event);
        if let Some(records) = score {
            ctx.broadcast_event(GameEvent::Score(records));
        }
        Ok(())
    }

    fn score_kill(&mut self, victim: PlayerIndex, killer: PlayerIndex) -> Option<Vec<ScoreRecord>> {
        let victim_team = self.players.get(&victim)?.team;
        if killer == victim || !self.is_entered(killer) {
            let record = self.players.get_mut(&victim)?;
            record.losses = record.losses.saturating_add(1);
            return Some(vec![record.score(victim)]);
        }

        let killer_record = self.players.get_mut(&killer)?;
        if killer_record.team == victim_team && victim_team != 0 {
            killer_record.team_kills = killer_record.team_kills.saturating_add(1);
        } else {
            killer_record.wins = killer_record.wins.saturating_add(1);
        }
        let killer_score = killer_record.score(killer);
        let victim_record = self.players.get_mut(&victim)?;
        victim_record.losses = victim_record.losses.saturating_add(1);
        Some(vec![killer_score, victim_record.score(victim)])
    }

    fn send_lag_pings(&mut self, ctx: &mut ServerContext, now: Instant) {
        let interval = self.lag_ping_interval;
        for (&player, record) in self.players.iter_mut() {
            if !record.entered || ctx.registry.get(player).map_or(true, |s| s.is_virtual()) {
                continue;
            }
            let due = record
                .lag
                .last_sent
                .map_or(true, |sent| now.saturating_duration_since(sent) >= interval);
            if !due {
                continue;
            }
            if let Some((sequence, _)) = record.lag.outstanding {
                record.lag.lost += 1;
                debug!(
                    "Player {} never answered lag ping {} ({} lost)",
                    player, sequence, record.lag.lost
                );
            }
            record.lag.sequence = record.lag.sequence.wrapping_add(1);
            record.lag.outstanding = Some((record.lag.sequence, now));
            record.lag.last_sent = Some(now);
            ctx.send_event(
                player,
                GameEvent::LagPing {
                    sequence: record.lag.sequence,
                },
            );
        }
    }

    fn send_time_update(&mut self, ctx: &mut ServerContext, now: Instant) {
        let Some(limit) = self.time_limit else {
            return;
        };
        let started = *self.started.get_or_insert(now);
        let due = self
            .last_time_update
            .map_or(true, |last| now.saturating_duration_since(last) >= TIME_UPDATE_INTERVAL);
        if !due {
            return;
        }
        self.last_time_update = Some(now);
        let remaining = limit.saturating_sub(now.saturating_duration_since(started));
        ctx.broadcast_event(GameEvent::TimeUpdate {
            seconds: remaining.as_secs().min(i32::MAX as u64) as i32,
        });
    }
}

impl GameRules for RelayRules {
    fn on_join(&mut self, _ctx: &mut ServerContext, player: PlayerIndex, _now: Instant) {
        self.players.insert(player, PlayerRecord::default());
    }

    fn on_message(
        &mut self,
        ctx: &mut ServerContext,
        player: PlayerIndex,
        frame: &OwnedFrame,
        now: Instant,
    ) -> Result<(), CloseReason> {
        let code = frame.code;
        let payload = frame.payload.as_slice();
        if payload.len() < min_payload_len(code) {
            return Err(CloseReason::ProtocolViolation(format!(
                "short {} ({} bytes)",
                code_name(code),
                payload.len()
            )));
        }

        match code {
            MSG_ENTER => return self.enter(ctx, player, payload),
            MSG_EXIT => return Err(CloseReason::Exit),
            MSG_UDP_LINK_REQUEST | MSG_UDP_LINK_ESTABLISHED => return Ok(()),
            MSG_WHAT_TIME_IS_IT => {
                ctx.send_event(
                    player,
                    GameEvent::TimeReply {
                        tag: payload[0],
                        seconds: ctx.uptime(),
                    },
                );
                return Ok(());
            }
            _ => {}
        }

        if !self.is_entered(player) {
            return Err(CloseReason::ProtocolViolation(format!(
                "{} before entering",
                code_name(code)
            )));
        }

        match code {
            MSG_PLAYER_UPDATE | MSG_PLAYER_UPDATE_SMALL => {
                if payload[0] != player {
                    return Err(CloseReason::ProtocolViolation(format!(
                        "update for player {}",
                        payload[0]
                    )));
                }
                ctx.relay(player, code, payload);
                Ok(())
            }
            MSG_MESSAGE => self.chat(ctx, player, payload),
            MSG_LAG_PING => {
                self.lag_reply(player, payload, now);
                Ok(())
            }
            MSG_SHOT_BEGIN | MSG_SHOT_END | MSG_GM_UPDATE | MSG_ALIVE | MSG_KILLED
            | MSG_TELEPORT | MSG_GRAB_FLAG | MSG_DROP_FLAG | MSG_CAPTURE_FLAG => {
                self.relay_event(ctx, player, frame)
            }
            _ => {
                debug!("Player {} sent unhandled {}", player, code_name(code));
                Ok(())
            }
        }
    }

    fn on_departure(&mut self, ctx: &mut ServerContext, departure: &Departure) {
        if let Some(record) = self.players.remove(&departure.player) {
            if record.entered {
                ctx.broadcast_event(GameEvent::PlayerRemoved {
                    id: departure.player,
                });
            }
        }
    }

    fn on_tick(&mut self, ctx: &mut ServerContext, now: Instant) {
        self.send_lag_pings(ctx, now);
        self.send_time_update(ctx, now);
    }

    fn team_counts(&self) -> [u16; TEAM_COUNT] {
        let mut counts = [0; TEAM_COUNT];
        for record in self.players.values().filter(|record| record.entered) {
            if let Some(count) = counts.get_mut(usize::from(record.team)) {
                *count += 1;
            }
        }
        counts
    }
}
