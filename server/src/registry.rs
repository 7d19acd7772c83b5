//! The live session set.
//!
//! Sessions live in a slot table indexed by player index. The registry is
//! owned by the event loop and only mutated there; the two mutation points
//! are [`SessionRegistry::add`] and [`SessionRegistry::remove`].
//!
//! Each session carries a [`Sink`] chosen once at creation: a network
//! connection that serializes bytes onto its sockets, or an in-process
//! callback that receives decoded [`GameEvent`]s.

use crate::connection::ConnectionHandler;
use crate::dispatch::Outgoing;
use crate::error::CloseReason;
use crate::lifecycle::{CloseGuard, CloseListener};
use crate::transport::{DatagramTransport, StreamTransport};
use log::{debug, info, warn};
use shared::{GameEvent, PlayerIndex};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-process player (bot or API client) that hears the same event stream
/// network clients receive.
pub trait PlayerHandler: Send {
    fn on_event(&mut self, player: PlayerIndex, event: &GameEvent);

    fn on_close(&mut self, _player: PlayerIndex, _reason: &CloseReason) {}
}

pub struct CallbackSink {
    handler: Box<dyn PlayerHandler>,
    guard: CloseGuard,
}

impl CallbackSink {
    pub fn new(handler: Box<dyn PlayerHandler>) -> Self {
        Self {
            handler,
            guard: CloseGuard::new(),
        }
    }

    fn deliver(&mut self, player: PlayerIndex, message: &Outgoing<'_>) {
        if self.guard.is_closed() {
            return;
        }
        match message.event {
            Some(event) => self.handler.on_event(player, event),
            None => match GameEvent::decode(message.code, message.payload()) {
                Ok(event) => self.handler.on_event(player, &event),
                Err(e) => warn!("Player {} could not decode outbound message: {}", player, e),
            },
        }
    }

    fn closing(&mut self, player: PlayerIndex, reason: CloseReason) -> bool {
        if !self.guard.begin(reason.clone()) {
            return false;
        }
        self.handler.on_close(player, &reason);
        self.guard.notify(player);
        true
    }
}

pub enum Sink {
    Network(ConnectionHandler),
    Callback(CallbackSink),
}

impl Sink {
    pub fn deliver(&mut self, player: PlayerIndex, message: &Outgoing<'_>) -> Result<(), CloseReason> {
        match self {
            Sink::Network(conn) => conn.pwrite(message.frame),
            Sink::Callback(sink) => {
                sink.deliver(player, message);
                Ok(())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Sink::Network(conn) => conn.is_closed(),
            Sink::Callback(sink) => sink.guard.is_closed(),
        }
    }

    pub fn closing(&mut self, player: PlayerIndex, reason: CloseReason) -> bool {
        match self {
            Sink::Network(conn) => conn.closing(reason),
            Sink::Callback(sink) => sink.closing(player, reason),
        }
    }

    pub fn register_close_listener(&mut self, listener: Box<dyn CloseListener>) {
        match self {
            Sink::Network(conn) => conn.register_close_listener(listener),
            Sink::Callback(sink) => sink.guard.register(listener),
        }
    }
}

pub struct Session {
    index: PlayerIndex,
    sink: Sink,
    hostname: Option<String>,
    created: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn index(&self) -> PlayerIndex {
        self.index
    }

    pub fn sink_mut(&mut self) -> &mut Sink {
        &mut self.sink
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.sink, Sink::Callback(_))
    }

    pub fn connection(&self) -> Option<&ConnectionHandler> {
        match &self.sink {
            Sink::Network(conn) => Some(conn),
            Sink::Callback(_) => None,
        }
    }

    pub fn connection_mut(&mut self) -> Option<&mut ConnectionHandler> {
        match &mut self.sink {
            Sink::Network(conn) => Some(conn),
            Sink::Callback(_) => None,
        }
    }

    /// TCP peer address; `None` for in-process players.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.connection().map(ConnectionHandler::peer)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn set_hostname(&mut self, hostname: String) {
        self.hostname = Some(hostname);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }
}

/// A session that has left the registry, for the game layer to observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub player: PlayerIndex,
    pub reason: CloseReason,
    pub peer: Option<SocketAddr>,
}

pub struct SessionRegistry {
    slots: Vec<Option<Session>>,
    max_players: usize,
    departures: Vec<Departure>,
}

impl SessionRegistry {
    pub fn new(max_players: usize) -> Self {
        let max_players = max_players.min(shared::protocol::LAST_REAL_PLAYER as usize + 1);
        Self {
            slots: Vec::new(),
            max_players,
            departures: Vec::new(),
        }
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn free_index(&self) -> Option<PlayerIndex> {
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            return Some(index as PlayerIndex);
        }
        (self.slots.len() < self.max_players).then_some(self.slots.len() as PlayerIndex)
    }

    /// Inserts a session built around the lowest free player index.
    pub fn add(&mut self, sink: impl FnOnce(PlayerIndex) -> Sink, now: Instant) -> Option<PlayerIndex> {
        let index = self.free_index()?;
        let session = Session {
            index,
            sink: sink(index),
            hostname: None,
            created: now,
            last_activity: now,
        };
        let slot = index as usize;
        if slot == self.slots.len() {
            self.slots.push(Some(session));
        } else {
            self.slots[slot] = Some(session);
        }
        Some(index)
    }

    pub fn add_connection(
        &mut self,
        stream: Box<dyn StreamTransport>,
        datagrams: Arc<dyn DatagramTransport>,
        peer: SocketAddr,
        now: Instant,
    ) -> Option<PlayerIndex> {
        let index = self.add(
            |index| Sink::Network(ConnectionHandler::new(index, stream, datagrams, peer)),
            now,
        )?;
        info!("Player {} connected from {}", index, peer);
        Some(index)
    }

    pub fn add_virtual(&mut self, handler: Box<dyn PlayerHandler>, now: Instant) -> Option<PlayerIndex> {
        let index = self.add(|_| Sink::Callback(CallbackSink::new(handler)), now)?;
        info!("Player {} registered in-process", index);
        Some(index)
    }

    /// Closes a session and takes it out of the live set. The session stays
    /// in its slot while close listeners run and is dropped afterwards.
    /// Returns false if the slot was already empty.
    pub fn remove(&mut self, player: PlayerIndex, reason: CloseReason) -> bool {
        let Some(session) = self.get_mut(player) else {
            return false;
        };

        let peer = session.peer();
        if reason.is_orderly() {
            info!("Player {} disconnected: {}", player, reason);
        } else {
            warn!("Player {} dropped: {}", player, reason);
        }
        session.sink.closing(player, reason.clone());
        self.slots[player as usize] = None;
        self.departures.push(Departure {
            player,
            reason,
            peer,
        });
        while self.slots.last().is_some_and(Option::is_none) {
            self.slots.pop();
        }
        true
    }

    pub fn get(&self, player: PlayerIndex) -> Option<&Session> {
        self.slots.get(player as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, player: PlayerIndex) -> Option<&mut Session> {
        self.slots.get_mut(player as usize).and_then(Option::as_mut)
    }

    pub fn contains(&self, player: PlayerIndex) -> bool {
        self.get(player).is_some()
    }

    pub fn connection_mut(&mut self, player: PlayerIndex) -> Option<&mut ConnectionHandler> {
        self.get_mut(player).and_then(Session::connection_mut)
    }

    /// Snapshot of live indices in registry order.
    pub fn indices(&self) -> Vec<PlayerIndex> {
        self.slots
            .iter()
            .flatten()
            .map(|session| session.index)
            .collect()
    }

    /// Visits every session live at the start of the call. A session removed
    /// by an earlier visit is skipped, never revisited.
    pub fn for_each_session(&mut self, mut visit: impl FnMut(&mut Session)) {
        for player in self.indices() {
            if let Some(session) = self.get_mut(player) {
                visit(session);
            }
        }
    }

    /// UDP demultiplexing. With `require_port_match` only sessions whose
    /// inbound UDP is confirmed and whose address and port both match are
    /// found; without it any network session from the same IP matches.
    pub fn find_by_address_port(
        &self,
        addr: SocketAddr,
        require_port_match: bool,
    ) -> Option<PlayerIndex> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|session| session.connection())
            .find(|conn| !conn.is_closed() && conn.matches_udp(addr, require_port_match))
            .map(ConnectionHandler::player)
    }

    /// Every network player connected from `ip`.
    pub fn who_is_at(&self, ip: IpAddr) -> Vec<PlayerIndex> {
        self.slots
            .iter()
            .flatten()
            .filter(|session| session.peer().is_some_and(|peer| peer.ip() == ip))
            .map(|session| session.index)
            .collect()
    }

    pub fn player_list(&self) -> Vec<String> {
        self.slots
            .iter()
            .flatten()
            .map(|session| match session.connection() {
                Some(conn) => conn.describe(session.hostname()),
                None => format!("[{}]in-process", session.index),
            })
            .collect()
    }

    /// Network sessions quiet for longer than `timeout`.
    pub fn idle_sessions(&self, now: Instant, timeout: Duration) -> Vec<PlayerIndex> {
        self.slots
            .iter()
            .flatten()
            .filter(|session| !session.is_virtual() && session.idle_for(now) > timeout)
            .map(|session| session.index)
            .collect()
    }

    /// Collects kicks recorded by connections since the last call.
    pub fn pending_kicks(&mut self) -> Vec<(PlayerIndex, CloseReason)> {
        let mut kicks = Vec::new();
        self.for_each_session(|session| {
            let index = session.index;
            if let Some(reason) = session.connection_mut().and_then(ConnectionHandler::take_kick) {
                kicks.push((index, reason));
            }
        });
        kicks
    }

    pub fn take_departures(&mut self) -> Vec<Departure> {
        if !self.departures.is_empty() {
            debug!("{} departures pending", self.departures.len());
        }
        std::mem::take(&mut self.departures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryDatagrams, MemoryStream, MemoryStreamHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_addr() -> SocketAddr {
        "192.168.1.10:40000".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "192.168.1.11:40000".parse().unwrap()
    }

    fn add_network(registry: &mut SessionRegistry, peer: SocketAddr) -> (PlayerIndex, MemoryStreamHandle) {
        let (stream, handle) = MemoryStream::pair();
        let index = registry
            .add_connection(Box::new(stream), MemoryDatagrams::new(), peer, Instant::now())
            .unwrap();
        (index, handle)
    }

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<GameEvent>>>,
    }

    impl PlayerHandler for Recorder {
        fn on_event(&mut self, _player: PlayerIndex, event: &GameEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_indices_are_reused_lowest_first() {
        let mut registry = SessionRegistry::new(8);
        let (a, _) = add_network(&mut registry, test_addr());
        let (b, _) = add_network(&mut registry, test_addr2());
        let (c, _) = add_network(&mut registry, test_addr());
        assert_eq!((a, b, c), (0, 1, 2));

        assert!(registry.remove(b, CloseReason::Exit));
        let (d, _) = add_network(&mut registry, test_addr2());
        assert_eq!(d, 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_capacity_enforced() {
        let mut registry = SessionRegistry::new(2);
        add_network(&mut registry, test_addr());
        add_network(&mut registry, test_addr2());
        let (stream, _) = MemoryStream::pair();
        assert!(registry
            .add_connection(Box::new(stream), MemoryDatagrams::new(), test_addr(), Instant::now())
            .is_none());
    }

    #[test]
    fn test_remove_runs_listeners_once_and_records_departure() {
        let mut registry = SessionRegistry::new(4);
        let (player, _) = add_network(&mut registry, test_addr());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        registry
            .get_mut(player)
            .unwrap()
            .sink_mut()
            .register_close_listener(Box::new(move |_: PlayerIndex, _: &CloseReason| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        assert!(registry.remove(player, CloseReason::Reset));
        assert!(!registry.remove(player, CloseReason::IdleTimeout));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let departures = registry.take_departures();
        assert_eq!(
            departures,
            vec![Departure {
                player,
                reason: CloseReason::Reset,
                peer: Some(test_addr()),
            }]
        );
        assert!(registry.take_departures().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_session_stays_registered_until_listeners_finish() {
        let mut registry = SessionRegistry::new(4);
        let (player, _) = add_network(&mut registry, test_addr());
        registry
            .get_mut(player)
            .unwrap()
            .sink_mut()
            .register_close_listener(Box::new(|_: PlayerIndex, _: &CloseReason| {
                panic!("listener failed");
            }));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.remove(player, CloseReason::Reset)
        }));
        assert!(result.is_err());
        assert!(registry.contains(player));
        assert_eq!(registry.who_is_at(test_addr().ip()), vec![player]);
        assert!(registry.take_departures().is_empty());
    }

    #[test]
    fn test_find_by_address_port() {
        let mut registry = SessionRegistry::new(4);
        let (a, _) = add_network(&mut registry, test_addr());
        let (b, _) = add_network(&mut registry, test_addr2());
        let udp_source: SocketAddr = "192.168.1.11:6000".parse().unwrap();

        assert_eq!(registry.find_by_address_port(udp_source, false), Some(b));
        assert_eq!(registry.find_by_address_port(udp_source, true), None);

        registry.connection_mut(b).unwrap().confirm_udp_peer(udp_source);
        assert_eq!(registry.find_by_address_port(udp_source, true), Some(b));
        assert_eq!(
            registry.find_by_address_port("192.168.1.10:6000".parse().unwrap(), true),
            None
        );
        assert_eq!(
            registry.find_by_address_port("192.168.1.10:6000".parse().unwrap(), false),
            Some(a)
        );
    }

    #[test]
    fn test_virtual_players_have_no_peer() {
        let mut registry = SessionRegistry::new(4);
        let player = registry
            .add_virtual(Box::new(Recorder::default()), Instant::now())
            .unwrap();
        let session = registry.get(player).unwrap();
        assert!(session.is_virtual());
        assert!(session.peer().is_none());
        assert_eq!(registry.player_list(), vec!["[0]in-process".to_string()]);
        assert!(registry
            .find_by_address_port(test_addr(), false)
            .is_none());
    }

    #[test]
    fn test_who_is_at_groups_shared_addresses() {
        let mut registry = SessionRegistry::new(4);
        let (a, _) = add_network(&mut registry, test_addr());
        add_network(&mut registry, test_addr2());
        let (c, _) = add_network(&mut registry, "192.168.1.10:40001".parse().unwrap());
        assert_eq!(registry.who_is_at(test_addr().ip()), vec![a, c]);
    }

    #[test]
    fn test_idle_sessions_skip_virtual_players() {
        let mut registry = SessionRegistry::new(4);
        let start = Instant::now();
        let (stream, _) = MemoryStream::pair();
        let net = registry
            .add_connection(Box::new(stream), MemoryDatagrams::new(), test_addr(), start)
            .unwrap();
        registry.add_virtual(Box::new(Recorder::default()), start);

        let later = start + Duration::from_secs(30);
        assert_eq!(registry.idle_sessions(later, Duration::from_secs(10)), vec![net]);

        registry.get_mut(net).unwrap().touch(later);
        assert!(registry
            .idle_sessions(later, Duration::from_secs(10))
            .is_empty());
    }

    #[test]
    fn test_for_each_session_visits_snapshot() {
        let mut registry = SessionRegistry::new(4);
        for _ in 0..3 {
            add_network(&mut registry, test_addr());
        }
        let mut seen = Vec::new();
        registry.for_each_session(|session| seen.push(session.index()));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_pending_kicks_are_collected_once() {
        let mut registry = SessionRegistry::new(4);
        let (player, _) = add_network(&mut registry, test_addr());
        registry
            .connection_mut(player)
            .unwrap()
            .kick(CloseReason::Kicked("test".into()));
        assert_eq!(
            registry.pending_kicks(),
            vec![(player, CloseReason::Kicked("test".into()))]
        );
        assert!(registry.pending_kicks().is_empty());
    }
}
