//! The state every handler works against: live sessions, the outbound
//! queue and the router between them.

use crate::dispatch::{DispatchRouter, Outgoing};
use crate::error::CloseReason;
use crate::message::MessageQueue;
use crate::registry::{Departure, SessionRegistry};
use log::warn;
use shared::protocol::code_name;
use shared::{encode_frame, GameEvent, PlayerIndex};
use std::time::Instant;

pub struct ServerContext {
    pub registry: SessionRegistry,
    pub queue: MessageQueue,
    pub router: DispatchRouter,
    started: Instant,
}

impl ServerContext {
    pub fn new(max_players: usize) -> Self {
        Self {
            registry: SessionRegistry::new(max_players),
            queue: MessageQueue::new(),
            router: DispatchRouter::new(),
            started: Instant::now(),
        }
    }

    /// Seconds since the server started.
    pub fn uptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn send_event(&mut self, to: PlayerIndex, event: GameEvent) {
        self.queue.send_event(to, event);
    }

    pub fn broadcast_event(&mut self, event: GameEvent) {
        self.queue.broadcast_event(event);
    }

    /// Runs one flush pass over the queue.
    pub fn flush_messages(&mut self) -> usize {
        self.queue.send_pending(&mut self.registry, &self.router)
    }

    /// Sends everything queued for `player` right now, ahead of the next
    /// flush point.
    pub fn flush_player(&mut self, player: PlayerIndex) -> usize {
        self.queue.flush_for(player, &mut self.registry, &self.router)
    }

    /// Forwards a client's frame to every other session. It goes out
    /// straight away unless something is still queued, in which case it
    /// waits behind that so announcements such as a new player's arrival
    /// reach everyone first. Returns how many sessions it was sent or queued
    /// to.
    pub fn relay(&mut self, from: PlayerIndex, code: u16, payload: &[u8]) -> usize {
        if !self.queue.is_empty() {
            self.queue.relay(from, code, payload);
            return self
                .registry
                .indices()
                .into_iter()
                .filter(|&player| player != from)
                .count();
        }
        let frame = match encode_frame(code, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot relay {} from player {}: {}", code_name(code), from, e);
                return 0;
            }
        };
        let message = Outgoing {
            code,
            frame: &frame,
            event: None,
        };
        let mut delivered = 0;
        for player in self.registry.indices() {
            if player != from && self.router.send_to(&mut self.registry, player, &message) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Pushes coalesced datagrams and TCP backlogs. Connections whose
    /// backlog cannot be written without a fatal error are closed.
    pub fn flush_transports(&mut self) {
        let mut failed = Vec::new();
        self.registry.for_each_session(|session| {
            let index = session.index();
            if let Some(conn) = session.connection_mut() {
                conn.flush_udp();
                if let Err(reason) = conn.flush() {
                    failed.push((index, reason));
                }
            }
        });
        for (player, reason) in failed {
            self.close_player(player, reason);
        }
    }

    pub fn close_player(&mut self, player: PlayerIndex, reason: CloseReason) -> bool {
        let removed = self.registry.remove(player, reason);
        self.queue.purge_for(player);
        removed
    }

    /// Sessions that left since the last call. Anything still queued for
    /// them is discarded.
    pub fn take_departures(&mut self) -> Vec<Departure> {
        let departures = self.registry.take_departures();
        for departure in &departures {
            self.queue.purge_for(departure.player);
        }
        departures
    }

    pub fn player_count(&self) -> usize {
        self.registry.len()
    }
}
