//! Per-player transport: one TCP stream plus a UDP return address.
//!
//! Everything here is non-blocking. Outbound TCP bytes the socket will not
//! take right now are kept in a growable buffer and retried on the next
//! flush; outbound UDP messages are coalesced into datagrams of at most
//! [`UDP_COALESCE_LIMIT`] bytes. Inbound TCP bytes are accumulated until a
//! whole frame is present, never more than one frame at a time.

use crate::error::{CloseReason, RxStatus};
use crate::lifecycle::{CloseGuard, CloseListener};
use crate::stats::TrafficStats;
use crate::transport::{DatagramTransport, StreamTransport};
use log::{debug, info, warn};
use shared::framing::{next_frame, peek_header, FrameStatus, OwnedFrame, HEADER_LEN};
use shared::protocol::{
    code_name, is_udp_bulk, MSG_UDP_LINK_ESTABLISHED, MSG_UDP_LINK_REQUEST, SERVER_VERSION,
};
use shared::{PlayerIndex, MAX_PACKET_LEN};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

const INITIAL_OUTBOUND_CAPACITY: usize = 512;

/// Growing the TCP backlog to this size means the client cannot keep up.
pub const MAX_OUTBOUND_CAPACITY: usize = 20 * 1024;

/// Largest datagram the coalescing buffer will emit.
pub const UDP_COALESCE_LIMIT: usize = MAX_PACKET_LEN;

/// Unsent TCP bytes. `capacity` is tracked explicitly so growth follows the
/// doubling policy rather than whatever `Vec` decides.
#[derive(Debug, Default)]
struct OutboundBuffer {
    data: Vec<u8>,
    offset: usize,
    capacity: usize,
}

impl OutboundBuffer {
    fn pending(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn consume(&mut self, n: usize) {
        self.offset += n;
        if self.offset >= self.data.len() {
            self.data.clear();
            self.offset = 0;
        }
    }

    fn compact(&mut self) {
        if self.offset > 0 {
            self.data.drain(..self.offset);
            self.offset = 0;
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), CloseReason> {
        let needed = self.len() + bytes.len();
        if needed > self.capacity {
            let mut capacity = if self.capacity == 0 {
                INITIAL_OUTBOUND_CAPACITY
            } else {
                self.capacity * 2
            };
            while capacity < needed {
                capacity *= 2;
            }
            if capacity >= MAX_OUTBOUND_CAPACITY {
                return Err(CloseReason::SendQueueOverflow);
            }
            self.compact();
            self.data.reserve_exact(capacity - self.data.len());
            self.capacity = capacity;
        } else if self.offset + needed > self.capacity {
            self.compact();
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

/// Result of polling the TCP half for one message.
#[derive(Debug, PartialEq, Eq)]
pub enum TcpPoll {
    Frame(OwnedFrame),
    /// No complete frame yet.
    Pending,
    /// The session must be closed.
    Closed(CloseReason),
}

pub struct ConnectionHandler {
    player: PlayerIndex,
    stream: Box<dyn StreamTransport>,
    datagrams: Arc<dyn DatagramTransport>,
    peer: SocketAddr,
    udp_peer: SocketAddr,
    udp_inbound: bool,
    udp_outbound: bool,
    inbound: Vec<u8>,
    outbound: OutboundBuffer,
    udp_batch: Vec<u8>,
    pending_kick: Option<CloseReason>,
    guard: CloseGuard,
    stats: TrafficStats,
}

impl ConnectionHandler {
    pub fn new(
        player: PlayerIndex,
        stream: Box<dyn StreamTransport>,
        datagrams: Arc<dyn DatagramTransport>,
        peer: SocketAddr,
    ) -> Self {
        Self {
            player,
            stream,
            datagrams,
            peer,
            udp_peer: peer,
            udp_inbound: false,
            udp_outbound: false,
            inbound: Vec::with_capacity(MAX_PACKET_LEN),
            outbound: OutboundBuffer::default(),
            udp_batch: Vec::with_capacity(UDP_COALESCE_LIMIT),
            pending_kick: None,
            guard: CloseGuard::new(),
            stats: TrafficStats::default(),
        }
    }

    pub fn player(&self) -> PlayerIndex {
        self.player
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn udp_peer(&self) -> SocketAddr {
        self.udp_peer
    }

    pub fn udp_inbound(&self) -> bool {
        self.udp_inbound
    }

    pub fn udp_outbound(&self) -> bool {
        self.udp_outbound
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    pub fn pending_tcp_bytes(&self) -> usize {
        self.outbound.len()
    }

    pub fn pending_udp_bytes(&self) -> usize {
        self.udp_batch.len()
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn register_close_listener(&mut self, listener: Box<dyn CloseListener>) {
        self.guard.register(listener);
    }

    /// Writes the unframed greeting: server version and assigned index.
    pub fn send_hello(&mut self) -> Result<(), CloseReason> {
        let mut hello = SERVER_VERSION.to_vec();
        hello.push(self.player);
        self.buffered_send(&hello)
    }

    /// Queues one complete frame for this player.
    ///
    /// Bulk types ride the UDP coalescing buffer once the outbound link is
    /// up; a link request always goes by UDP and is flushed at once.
    /// Everything else goes through the TCP backlog. Writes to a closed
    /// connection are dropped.
    pub fn pwrite(&mut self, frame: &[u8]) -> Result<(), CloseReason> {
        if self.guard.is_closed() {
            return Ok(());
        }
        let Some(header) = peek_header(frame) else {
            return Ok(());
        };
        self.stats.record_sent(header.code, frame.len());

        if header.code == MSG_UDP_LINK_REQUEST {
            self.write_udp(frame);
            self.flush_udp();
            return Ok(());
        }
        if self.udp_outbound && is_udp_bulk(header.code) {
            self.write_udp(frame);
            return Ok(());
        }
        self.buffered_send(frame)
    }

    fn write_udp(&mut self, frame: &[u8]) {
        if self.udp_batch.len() + frame.len() > UDP_COALESCE_LIMIT {
            self.flush_udp();
        }
        self.udp_batch.extend_from_slice(frame);
    }

    /// Sends whatever the coalescing buffer holds as one datagram.
    pub fn flush_udp(&mut self) {
        if self.udp_batch.is_empty() {
            return;
        }
        if let Err(e) = self.datagrams.try_send_to(&self.udp_batch, self.udp_peer) {
            debug!(
                "Player {} dropped {} byte datagram: {}",
                self.player,
                self.udp_batch.len(),
                e
            );
        }
        self.udp_batch.clear();
    }

    /// Pushes as much of the TCP backlog as the socket accepts.
    pub fn flush(&mut self) -> Result<(), CloseReason> {
        self.buffered_send(&[])
    }

    fn buffered_send(&mut self, data: &[u8]) -> Result<(), CloseReason> {
        if !self.outbound.is_empty() {
            let result = self.stream.try_write(self.outbound.pending());
            let written = self.settle_write(result)?;
            self.outbound.consume(written);
        }

        let mut rest = data;
        if self.outbound.is_empty() && !rest.is_empty() {
            let result = self.stream.try_write(rest);
            let written = self.settle_write(result)?;
            rest = &rest[written..];
        }

        if !rest.is_empty() {
            if let Err(reason) = self.outbound.append(rest) {
                warn!(
                    "Player {} send queue too big ({} bytes pending)",
                    self.player,
                    self.outbound.len()
                );
                return Err(reason);
            }
        }
        Ok(())
    }

    /// Classifies a write result: bytes written, transient (zero),
    /// connection-fatal, or a failure that earns a kick at the next
    /// housekeeping pass.
    fn settle_write(&mut self, result: io::Result<usize>) -> Result<usize, CloseReason> {
        match result {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                Err(CloseReason::Reset)
            }
            Err(e) => {
                self.kick(CloseReason::WriteError(e.to_string()));
                Ok(0)
            }
        }
    }

    /// Reads until `target` bytes are buffered or the socket runs dry.
    pub fn receive(&mut self, target: usize) -> RxStatus {
        let have = self.inbound.len();
        if have >= target {
            return RxStatus::All;
        }
        let want = (target - have).min(MAX_PACKET_LEN);
        let mut chunk = [0u8; MAX_PACKET_LEN];
        match self.stream.try_read(&mut chunk[..want]) {
            Ok(0) => RxStatus::Disconnected,
            Ok(n) => {
                self.inbound.extend_from_slice(&chunk[..n]);
                if n == want {
                    RxStatus::All
                } else {
                    RxStatus::Partial
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                RxStatus::Partial
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                ) =>
            {
                RxStatus::Reset
            }
            Err(e) => RxStatus::Error(e.kind()),
        }
    }

    fn rx_failure(status: RxStatus) -> Option<CloseReason> {
        match status {
            RxStatus::All | RxStatus::Partial => None,
            RxStatus::Reset => Some(CloseReason::Reset),
            RxStatus::Disconnected => Some(CloseReason::PeerClosed),
            RxStatus::Error(kind) => Some(CloseReason::ReadError(kind.to_string())),
        }
    }

    /// Polls for the next complete TCP frame.
    pub fn tcp_receive(&mut self) -> TcpPoll {
        if self.guard.is_closed() {
            return TcpPoll::Pending;
        }

        let status = self.receive(HEADER_LEN);
        if status != RxStatus::All {
            return match Self::rx_failure(status) {
                Some(reason) => TcpPoll::Closed(reason),
                None => TcpPoll::Pending,
            };
        }

        let Some(header) = peek_header(&self.inbound) else {
            return TcpPoll::Pending;
        };
        if let Err(e) = header.validate() {
            return TcpPoll::Closed(CloseReason::ProtocolViolation(e.to_string()));
        }

        let status = self.receive(header.frame_len());
        if status != RxStatus::All {
            return match Self::rx_failure(status) {
                Some(reason) => TcpPoll::Closed(reason),
                None => TcpPoll::Pending,
            };
        }

        let frame = match next_frame(&self.inbound) {
            Ok(FrameStatus::Complete(frame)) => frame.to_owned_frame(),
            Ok(FrameStatus::Incomplete { .. }) => return TcpPoll::Pending,
            Err(e) => return TcpPoll::Closed(CloseReason::ProtocolViolation(e.to_string())),
        };
        self.inbound.clear();
        self.stats
            .record_received(frame.code, HEADER_LEN + frame.payload.len());

        if frame.code == MSG_UDP_LINK_ESTABLISHED {
            self.enable_udp_outbound();
        }
        TcpPoll::Frame(frame)
    }

    /// Counts a frame that arrived by datagram.
    pub fn note_udp_received(&mut self, code: u16, len: usize) {
        self.stats.record_received(code, len);
    }

    /// True if a datagram from `addr` belongs to this connection. Without
    /// `require_port` only the IP is compared, which is how a link request
    /// is matched before the client's UDP port is known.
    pub fn matches_udp(&self, addr: SocketAddr, require_port: bool) -> bool {
        if require_port {
            self.udp_inbound && self.udp_peer == addr
        } else {
            self.udp_peer.ip() == addr.ip()
        }
    }

    /// Records the client's UDP source after a link request.
    pub fn confirm_udp_peer(&mut self, addr: SocketAddr) {
        if addr.port() != 0 {
            self.udp_peer = addr;
        }
        self.udp_inbound = true;
        info!("Player {} inbound UDP up from {}", self.player, self.udp_peer);
    }

    pub fn enable_udp_outbound(&mut self) {
        if !self.udp_outbound {
            self.udp_outbound = true;
            info!("Player {} outbound UDP up", self.player);
        }
    }

    /// Records a reason to drop this player at the next housekeeping pass.
    /// The first reason sticks.
    pub fn kick(&mut self, reason: CloseReason) {
        if self.pending_kick.is_none() {
            debug!("Player {} scheduled for kick: {}", self.player, reason);
            self.pending_kick = Some(reason);
        }
    }

    pub fn take_kick(&mut self) -> Option<CloseReason> {
        self.pending_kick.take()
    }

    /// The single closing transition. Flushes both halves best effort,
    /// fires every close listener once, and leaves the connection inert.
    /// The socket itself is released when the handler is dropped.
    pub fn closing(&mut self, reason: CloseReason) -> bool {
        if !self.guard.begin(reason.clone()) {
            return false;
        }
        self.flush_udp();
        if let Err(e) = self.flush() {
            debug!("Player {} final flush failed: {}", self.player, e);
        }
        self.stats.log_summary(self.player);
        self.guard.notify(self.player);
        true
    }

    /// Debug line for player listings.
    pub fn describe(&self, hostname: Option<&str>) -> String {
        let mut line = format!("[{}]{}", self.player, self.peer.ip());
        if let Some(host) = hostname {
            line.push_str(&format!(" ({host})"));
        }
        if self.udp_inbound && self.udp_outbound {
            line.push_str(" udp+");
        } else if self.udp_inbound {
            line.push_str(" udp");
        }
        line
    }

    pub(crate) fn log_traffic(&self, code: u16, len: usize) {
        debug!("Player {} <- {} ({} bytes)", self.player, code_name(code), len);
    }
}
