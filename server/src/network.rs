//! Server network layer: the event loop that owns every session.

use crate::config::ServerConfig;
use crate::connection::TcpPoll;
use crate::context::ServerContext;
use crate::error::{CloseReason, ServerError};
use crate::publicize::{PublicInfo, Publicizer};
use crate::registry::PlayerHandler;
use crate::resolver::{HostnameResolver, HostsFileResolver};
use crate::rules::{GameRules, RelayRules, TEAM_COUNT};
use crate::transport::{DatagramTransport, LossyDatagrams, TcpTransport};
use crate::udp::{demux_datagram, link_request_reply, ping_reply, DatagramOutcome};
use log::{debug, error, info, warn};
use shared::protocol::{
    MSG_PLAYER_UPDATE, MSG_PLAYER_UPDATE_SMALL, NO_PLAYER, SERVER_VERSION,
};
use shared::{GameInfo, OwnedFrame, PlayerIndex};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Frames read from one session per readiness event, so a flooding client
/// cannot starve the others.
const MAX_FRAMES_PER_WAKE: usize = 32;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Largest datagram the server reads.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Messages sent from helper tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    /// A session's TCP socket has data or an error waiting.
    Readable { player: PlayerIndex },
    HostnameResolved {
        player: PlayerIndex,
        peer: SocketAddr,
        hostname: String,
    },
    /// A frame from an in-process player.
    VirtualInput {
        player: PlayerIndex,
        frame: OwnedFrame,
    },
    Shutdown,
}

/// Lets other tasks talk to a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if self.tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }

    /// Feeds a frame to the server as if the in-process player had sent it.
    pub fn inject(&self, player: PlayerIndex, code: u16, payload: Vec<u8>) {
        let frame = OwnedFrame { code, payload };
        if self
            .tx
            .send(ServerMessage::VirtualInput { player, frame })
            .is_err()
        {
            debug!("Server stopped before input from player {}", player);
        }
    }
}

/// Waits for a session's socket to become readable and tells the loop.
/// After each report it waits to be rearmed, so the loop has read before
/// readiness is polled again.
struct ReadWatcher {
    rearm: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ReadWatcher {
    fn spawn(
        player: PlayerIndex,
        stream: Arc<TcpStream>,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        let rearm = Arc::new(Notify::new());
        let notified = Arc::clone(&rearm);
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = stream.readable().await {
                    debug!("Player {} readiness error: {}", player, e);
                }
                if server_tx.send(ServerMessage::Readable { player }).is_err() {
                    break;
                }
                notified.notified().await;
            }
        });
        Self { rearm, task }
    }
}

/// Main server coordinating sessions, game rules and publicizing
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    datagrams: Arc<dyn DatagramTransport>,
    ctx: ServerContext,
    rules: Box<dyn GameRules>,
    resolver: Arc<dyn HostnameResolver>,
    publicizer: Publicizer,
    watchers: HashMap<PlayerIndex, ReadWatcher>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    /// Binds TCP and UDP on the same port.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        let local = listener.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(local).await?);
        info!("Server listening on {} (TCP and UDP)", local);

        let datagrams: Arc<dyn DatagramTransport> = if config.udp_drop_rate > 0.0 {
            warn!(
                "Test link enabled: dropping {:.0}% of outbound datagrams",
                config.udp_drop_rate * 100.0
            );
            Arc::new(LossyDatagrams::new(
                Arc::clone(&udp) as Arc<dyn DatagramTransport>,
                config.udp_drop_rate,
            ))
        } else {
            Arc::clone(&udp) as Arc<dyn DatagramTransport>
        };

        let ctx = ServerContext::new(config.max_players);
        let max_players = ctx.registry.max_players() as u16;
        let info = PublicInfo {
            address: config
                .public_address
                .clone()
                .unwrap_or_else(|| local.to_string()),
            title: config.public_title.clone(),
            game: GameInfo {
                max_players,
                max_shots: 1,
                team_max: [max_players; TEAM_COUNT],
                ..GameInfo::default()
            },
        };
        let publicizer = Publicizer::new(&config.list_servers, info);
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            config,
            listener,
            udp,
            datagrams,
            ctx,
            rules: Box::new(RelayRules::new()),
            resolver: Arc::new(HostsFileResolver::default()),
            publicizer,
            watchers: HashMap::new(),
            server_tx,
            server_rx,
        })
    }

    pub fn with_rules(mut self, rules: Box<dyn GameRules>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostnameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.server_tx.clone(),
        }
    }

    pub fn player_list(&self) -> Vec<String> {
        self.ctx.registry.player_list()
    }

    /// Registers an in-process player that hears the same events as network
    /// clients. Its own messages go in through [`ServerHandle::inject`].
    pub fn add_virtual_player(&mut self, handler: Box<dyn PlayerHandler>) -> Option<PlayerIndex> {
        let now = Instant::now();
        let player = self.ctx.registry.add_virtual(handler, now)?;
        self.rules.on_join(&mut self.ctx, player, now);
        Some(player)
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let now = Instant::now();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", peer, e);
        }
        let stream = Arc::new(stream);
        let transport = Box::new(TcpTransport::new(Arc::clone(&stream)));
        let Some(player) =
            self.ctx
                .registry
                .add_connection(transport, Arc::clone(&self.datagrams), peer, now)
        else {
            warn!("Turning away {}: server full", peer);
            let mut hello = SERVER_VERSION.to_vec();
            hello.push(NO_PLAYER);
            if let Err(e) = stream.try_write(&hello) {
                debug!("Could not tell {} the server is full: {}", peer, e);
            }
            return;
        };

        let hello = match self.ctx.registry.connection_mut(player) {
            Some(conn) => conn.send_hello(),
            None => return,
        };
        if let Err(reason) = hello {
            self.ctx.close_player(player, reason);
            return;
        }

        let watcher = ReadWatcher::spawn(player, stream, self.server_tx.clone());
        if let Some(stale) = self.watchers.insert(player, watcher) {
            stale.task.abort();
        }
        self.spawn_resolver(player, peer);
        self.rules.on_join(&mut self.ctx, player, now);
        debug!("Players: {:?}", self.ctx.registry.player_list());
    }

    /// Looks the peer up on a blocking worker and reports back by message.
    fn spawn_resolver(&self, player: PlayerIndex, peer: SocketAddr) {
        let resolver = Arc::clone(&self.resolver);
        let server_tx = self.server_tx.clone();
        tokio::spawn(async move {
            let ip = peer.ip();
            let hostname = match tokio::task::spawn_blocking(move || resolver.resolve(ip)).await {
                Ok(hostname) => hostname,
                Err(e) => {
                    debug!("Hostname lookup for {} failed: {}", peer, e);
                    None
                }
            };
            if let Some(hostname) = hostname {
                let message = ServerMessage::HostnameResolved {
                    player,
                    peer,
                    hostname,
                };
                if server_tx.send(message).is_err() {
                    debug!("Server stopped before {} resolved", peer);
                }
            }
        });
    }

    fn apply_hostname(&mut self, player: PlayerIndex, peer: SocketAddr, hostname: String) {
        if let Some(session) = self.ctx.registry.get_mut(player) {
            if session.peer() == Some(peer) {
                info!("Player {} is {}", player, hostname);
                session.set_hostname(hostname);
            }
        }
    }

    /// Reads complete frames from one session until its socket runs dry.
    fn read_player(&mut self, player: PlayerIndex) {
        let now = Instant::now();
        for _ in 0..MAX_FRAMES_PER_WAKE {
            let Some(session) = self.ctx.registry.get_mut(player) else {
                return;
            };
            let Some(conn) = session.connection_mut() else {
                return;
            };
            match conn.tcp_receive() {
                TcpPoll::Frame(frame) => {
                    conn.log_traffic(frame.code, frame.payload.len());
                    session.touch(now);
                    self.dispatch_frame(player, frame, now, true);
                }
                TcpPoll::Pending => break,
                TcpPoll::Closed(reason) => {
                    self.ctx.close_player(player, reason);
                    return;
                }
            }
        }
        if let Some(watcher) = self.watchers.get(&player) {
            watcher.rearm.notify_one();
        }
    }

    fn dispatch_frame(&mut self, player: PlayerIndex, frame: OwnedFrame, now: Instant, via_tcp: bool) {
        if !self.ctx.registry.contains(player) {
            return;
        }
        if via_tcp
            && self.config.require_udp
            && matches!(frame.code, MSG_PLAYER_UPDATE | MSG_PLAYER_UPDATE_SMALL)
        {
            let linked = self
                .ctx
                .registry
                .connection_mut(player)
                .is_some_and(|conn| conn.udp_outbound());
            if !linked {
                self.ctx
                    .close_player(player, CloseReason::Kicked("UDP link required".into()));
                return;
            }
        }
        if let Err(reason) = self.rules.on_message(&mut self.ctx, player, &frame, now) {
            self.ctx.close_player(player, reason);
        }
    }

    fn drain_udp(&mut self, buf: &mut [u8]) {
        loop {
            match self.udp.try_recv_from(buf) {
                Ok((len, source)) => self.handle_datagram(&buf[..len], source),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("UDP receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        let now = Instant::now();
        match demux_datagram(&mut self.ctx.registry, data, source, now) {
            DatagramOutcome::Ping => {
                let reply = ping_reply(self.ctx.player_count(), self.ctx.registry.max_players());
                match reply {
                    Ok(reply) => {
                        if let Err(e) = self.udp.try_send_to(&reply, source) {
                            debug!("Ping reply to {} failed: {}", source, e);
                        }
                    }
                    Err(e) => error!("Cannot build ping reply: {}", e),
                }
            }
            DatagramOutcome::LinkRequest { player } => {
                let Ok(reply) = link_request_reply(player) else {
                    return;
                };
                let result = match self.ctx.registry.connection_mut(player) {
                    Some(conn) => conn.pwrite(&reply),
                    None => return,
                };
                if let Err(reason) = result {
                    self.ctx.close_player(player, reason);
                }
            }
            DatagramOutcome::Frames { player, frames } => {
                for frame in frames {
                    self.dispatch_frame(player, frame, now, false);
                }
            }
            DatagramOutcome::Discarded => {}
        }
    }

    fn handle_virtual_input(&mut self, player: PlayerIndex, frame: OwnedFrame) {
        let is_virtual = self
            .ctx
            .registry
            .get(player)
            .is_some_and(|session| session.is_virtual());
        if !is_virtual {
            warn!("Ignoring injected input for non-virtual player {}", player);
            return;
        }
        self.dispatch_frame(player, frame, Instant::now(), false);
    }

    /// Fixed flush point: game rules, then the message queue, then sockets.
    fn tick(&mut self, now: Instant) {
        self.rules.on_tick(&mut self.ctx, now);
        self.ctx.flush_messages();
        self.ctx.flush_transports();
    }

    fn housekeeping(&mut self, now: Instant) {
        for player in self
            .ctx
            .registry
            .idle_sessions(now, self.config.disconnect_timeout)
        {
            self.ctx.close_player(player, CloseReason::IdleTimeout);
        }
        for (player, reason) in self.ctx.registry.pending_kicks() {
            self.ctx.close_player(player, reason);
        }
        self.publicizer.tick(now);
    }

    /// Lets the rules observe every departure, including ones caused while
    /// observing earlier ones, and keeps list servers' counts current.
    fn settle(&mut self) {
        loop {
            let departures = self.ctx.take_departures();
            if departures.is_empty() {
                break;
            }
            for departure in departures {
                if let Some(watcher) = self.watchers.remove(&departure.player) {
                    watcher.task.abort();
                }
                self.rules.on_departure(&mut self.ctx, &departure);
            }
            debug!("Players: {:?}", self.ctx.registry.player_list());
        }
        self.publicizer.update_counts(self.rules.team_counts());
    }

    async fn shutdown(&mut self) {
        info!("Server shutting down");
        for player in self.ctx.registry.indices() {
            self.ctx.close_player(player, CloseReason::Shutdown);
        }
        self.settle();
        self.publicizer.shutdown().await;
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut housekeeping_interval = interval(HOUSEKEEPING_INTERVAL);
        housekeeping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut datagram = vec![0u8; MAX_DATAGRAM];

        info!("Server started successfully");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                },

                ready = self.udp.readable() => {
                    match ready {
                        Ok(()) => self.drain_udp(&mut datagram),
                        Err(e) => {
                            error!("UDP socket failed: {}", e);
                            return Err(e.into());
                        }
                    }
                },

                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Readable { player }) => self.read_player(player),
                        Some(ServerMessage::HostnameResolved { player, peer, hostname }) => {
                            self.apply_hostname(player, peer, hostname);
                        },
                        Some(ServerMessage::VirtualInput { player, frame }) => {
                            self.handle_virtual_input(player, frame);
                        },
                        Some(ServerMessage::Shutdown) | None => break,
                    }
                },

                _ = tick_interval.tick() => self.tick(Instant::now()),

                _ = housekeeping_interval.tick() => self.housekeeping(Instant::now()),

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C");
                    break;
                }
            }
            self.settle();
        }

        self.shutdown().await;
        Ok(())
    }
}
