//! Outbound message staging and the per-tick send queue.
//!
//! Game code builds a [`BufferedMessage`], packs fields into it and hands
//! it to the [`MessageQueue`] with `send` or `broadcast`. Both consume the
//! message, so it can be dispatched at most once. The queue is flushed at a
//! fixed point in the tick; until then a message for a player who leaves is
//! purged without a byte of it going out.

use crate::dispatch::{DispatchRouter, Outgoing};
use crate::registry::SessionRegistry;
use log::{debug, error};
use shared::framing::{write_header, HEADER_LEN, MAX_PACKET_LEN};
use shared::protocol::code_name;
use shared::{GameEvent, Pack, PlayerIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Buffer growth step.
const BLOCK_SIZE: usize = 256;

/// Messages a single player may be sent per flush pass.
pub const DEFAULT_PER_PASS_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Player(PlayerIndex),
    Broadcast,
    /// Every live session except this one.
    Others(PlayerIndex),
}

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    data: Vec<u8>,
    code: u16,
    recipient: Option<Recipient>,
    event: Option<GameEvent>,
}

impl Pack for BufferedMessage {
    fn put(&mut self, bytes: &[u8]) {
        self.check_data(bytes.len());
        self.data.extend_from_slice(bytes);
    }
}

impl Default for BufferedMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedMessage {
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(BLOCK_SIZE);
        data.resize(HEADER_LEN, 0);
        Self {
            data,
            code: 0,
            recipient: None,
            event: None,
        }
    }

    /// A message whose payload is `event`, remembered so in-process players
    /// receive it without decoding.
    pub fn from_event(event: GameEvent) -> Self {
        let mut message = Self::new();
        let code = event.pack(&mut message);
        message.code = code;
        message.event = Some(event);
        message
    }

    /// Grows capacity in whole blocks when `extra` bytes would not fit.
    fn check_data(&mut self, extra: usize) {
        let needed = self.data.len() + extra;
        if needed > self.data.capacity() {
            let rounded = needed.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            self.data.reserve_exact(rounded - self.data.len());
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn payload_len(&self) -> usize {
        self.data.len() - HEADER_LEN
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn recipient(&self) -> Option<Recipient> {
        self.recipient
    }

    /// Queues the message for one player.
    pub fn send(mut self, queue: &mut MessageQueue, to: PlayerIndex, code: u16) {
        self.code = code;
        self.recipient = Some(Recipient::Player(to));
        queue.push(self);
    }

    /// Queues the message for every live session.
    pub fn broadcast(mut self, queue: &mut MessageQueue, code: u16) {
        self.code = code;
        self.recipient = Some(Recipient::Broadcast);
        queue.push(self);
    }

    fn finalize(&mut self) -> bool {
        if self.data.len() > MAX_PACKET_LEN {
            return false;
        }
        let len = self.payload_len() as u16;
        write_header(&mut self.data, len, self.code);
        true
    }

    pub fn outgoing(&self) -> Outgoing<'_> {
        Outgoing {
            code: self.code,
            frame: &self.data,
            event: self.event.as_ref(),
        }
    }
}

/// Messages waiting for the next flush point.
#[derive(Debug)]
pub struct MessageQueue {
    pending: VecDeque<BufferedMessage>,
    per_pass_limit: usize,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_PER_PASS_LIMIT)
    }

    pub fn with_limit(per_pass_limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            per_pass_limit: per_pass_limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn push(&mut self, mut message: BufferedMessage) {
        if !message.finalize() {
            error!(
                "Dropping oversized {} message ({} bytes)",
                code_name(message.code),
                message.data.len()
            );
            return;
        }
        self.pending.push_back(message);
    }

    pub fn send_event(&mut self, to: PlayerIndex, event: GameEvent) {
        let mut message = BufferedMessage::from_event(event);
        message.recipient = Some(Recipient::Player(to));
        self.push(message);
    }

    pub fn broadcast_event(&mut self, event: GameEvent) {
        let mut message = BufferedMessage::from_event(event);
        message.recipient = Some(Recipient::Broadcast);
        self.push(message);
    }

    /// Queues a client's frame for everyone but its sender.
    pub fn relay(&mut self, from: PlayerIndex, code: u16, payload: &[u8]) {
        let mut message = BufferedMessage::new();
        message.pack_bytes(payload);
        message.code = code;
        message.recipient = Some(Recipient::Others(from));
        self.push(message);
    }

    /// Dispatches queued messages in order. Only messages addressed to one
    /// player count toward that player's `per_pass_limit`; past it they wait
    /// for the next pass along with everything queued after them for that
    /// player. Broadcasts and relays are never held back, except that a copy
    /// for a player with deferred messages queues behind them so no session
    /// sees its messages reordered. Returns the number of messages dispatched.
    pub fn send_pending(&mut self, registry: &mut SessionRegistry, router: &DispatchRouter) -> usize {
        let mut per_player: HashMap<PlayerIndex, usize> = HashMap::new();
        let mut deferred: HashSet<PlayerIndex> = HashSet::new();
        let mut leftovers = VecDeque::new();
        let mut dispatched = 0;

        while let Some(message) = self.pending.pop_front() {
            match message.recipient {
                Some(Recipient::Player(to)) => {
                    let sent = per_player.entry(to).or_default();
                    if *sent >= self.per_pass_limit || deferred.contains(&to) {
                        deferred.insert(to);
                        leftovers.push_back(message);
                        continue;
                    }
                    *sent += 1;
                    router.send_to(registry, to, &message.outgoing());
                }
                Some(Recipient::Broadcast) if deferred.is_empty() => {
                    router.broadcast(registry, &message.outgoing());
                }
                Some(recipient) => {
                    for player in registry.indices() {
                        if recipient == Recipient::Others(player) {
                            continue;
                        }
                        if deferred.contains(&player) {
                            let mut copy = message.clone();
                            copy.recipient = Some(Recipient::Player(player));
                            leftovers.push_back(copy);
                        } else {
                            router.send_to(registry, player, &message.outgoing());
                        }
                    }
                }
                None => continue,
            }
            dispatched += 1;
        }

        if !leftovers.is_empty() {
            debug!("{} messages deferred to the next pass", leftovers.len());
        }
        self.pending = leftovers;
        dispatched
    }

    /// Drops every queued message addressed to `player` unsent.
    pub fn purge_for(&mut self, player: PlayerIndex) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|message| message.recipient != Some(Recipient::Player(player)));
        before - self.pending.len()
    }

    /// Sends everything queued for `player` right away, bypassing the per
    /// pass limit.
    pub fn flush_for(
        &mut self,
        player: PlayerIndex,
        registry: &mut SessionRegistry,
        router: &DispatchRouter,
    ) -> usize {
        let (mine, rest): (VecDeque<_>, VecDeque<_>) = self
            .pending
            .drain(..)
            .partition(|message| message.recipient == Some(Recipient::Player(player)));
        self.pending = rest;
        let count = mine.len();
        for message in mine {
            router.send_to(registry, player, &message.outgoing());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryDatagrams, MemoryStream, MemoryStreamHandle};
    use shared::framing::FrameBuffer;
    use shared::protocol::{MSG_MESSAGE, MSG_SCORE, MSG_TIME_UPDATE};
    use std::net::SocketAddr;
    use std::time::Instant;

    fn registry_with(count: usize) -> (SessionRegistry, Vec<MemoryStreamHandle>) {
        let mut registry = SessionRegistry::new(8);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let handles = (0..count)
            .map(|_| {
                let (stream, handle) = MemoryStream::pair();
                registry
                    .add_connection(Box::new(stream), MemoryDatagrams::new(), peer, Instant::now())
                    .unwrap();
                handle
            })
            .collect();
        (registry, handles)
    }

    fn codes_written(handle: &MemoryStreamHandle) -> Vec<u16> {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&handle.written());
        std::iter::from_fn(|| buffer.next_frame().unwrap())
            .map(|frame| frame.code)
            .collect()
    }

    #[test]
    fn test_growth_in_whole_blocks() {
        let mut message = BufferedMessage::new();
        assert_eq!(message.capacity(), BLOCK_SIZE);
        message.pack_bytes(&[0u8; 300]);
        assert_eq!(message.payload_len(), 300);
        assert_eq!(message.capacity() % BLOCK_SIZE, 0);
        assert!(message.capacity() >= 304);
    }

    #[test]
    fn test_send_frames_payload() {
        let (mut registry, handles) = registry_with(1);
        let mut queue = MessageQueue::new();
        let mut message = BufferedMessage::new();
        message.pack_u8(1).pack_u16(2);
        message.send(&mut queue, 0, MSG_SCORE);

        assert_eq!(queue.send_pending(&mut registry, &DispatchRouter::new()), 1);
        assert_eq!(handles[0].written(), vec![0, 3, 0x73, 0x63, 1, 0, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_oversized_message_is_dropped() {
        let mut queue = MessageQueue::new();
        let mut message = BufferedMessage::new();
        message.pack_bytes(&vec![0u8; MAX_PACKET_LEN]);
        message.broadcast(&mut queue, MSG_MESSAGE);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_per_pass_limit_defers_without_reordering() {
        let (mut registry, handles) = registry_with(2);
        let router = DispatchRouter::new();
        let mut queue = MessageQueue::new();
        for _ in 0..4 {
            BufferedMessage::new().send(&mut queue, 0, MSG_SCORE);
        }
        BufferedMessage::new().broadcast(&mut queue, MSG_TIME_UPDATE);

        assert_eq!(queue.send_pending(&mut registry, &router), 4);
        assert_eq!(codes_written(&handles[0]), vec![MSG_SCORE; 3]);
        assert_eq!(codes_written(&handles[1]), vec![MSG_TIME_UPDATE]);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.send_pending(&mut registry, &router), 2);
        assert_eq!(
            codes_written(&handles[0]),
            vec![MSG_SCORE, MSG_SCORE, MSG_SCORE, MSG_SCORE, MSG_TIME_UPDATE]
        );
        assert_eq!(codes_written(&handles[1]), vec![MSG_TIME_UPDATE]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_broadcasts_are_not_capped() {
        let (mut registry, handles) = registry_with(2);
        let mut queue = MessageQueue::new();
        for _ in 0..10 {
            BufferedMessage::new().broadcast(&mut queue, MSG_TIME_UPDATE);
        }
        BufferedMessage::new().send(&mut queue, 1, MSG_SCORE);

        assert_eq!(queue.send_pending(&mut registry, &DispatchRouter::new()), 11);
        assert!(queue.is_empty());
        assert_eq!(codes_written(&handles[0]), vec![MSG_TIME_UPDATE; 10]);
        let mut expected = vec![MSG_TIME_UPDATE; 10];
        expected.push(MSG_SCORE);
        assert_eq!(codes_written(&handles[1]), expected);
    }

    #[test]
    fn test_purge_discards_only_that_players_messages() {
        let (mut registry, handles) = registry_with(2);
        let mut queue = MessageQueue::new();
        BufferedMessage::new().send(&mut queue, 1, MSG_SCORE);
        BufferedMessage::new().send(&mut queue, 0, MSG_SCORE);
        BufferedMessage::new().broadcast(&mut queue, MSG_TIME_UPDATE);

        assert_eq!(queue.purge_for(1), 1);
        queue.send_pending(&mut registry, &DispatchRouter::new());
        assert_eq!(codes_written(&handles[0]), vec![MSG_SCORE, MSG_TIME_UPDATE]);
        assert_eq!(codes_written(&handles[1]), vec![MSG_TIME_UPDATE]);
    }

    #[test]
    fn test_flush_for_bypasses_limit() {
        let (mut registry, handles) = registry_with(2);
        let mut queue = MessageQueue::new();
        for _ in 0..5 {
            BufferedMessage::new().send(&mut queue, 1, MSG_SCORE);
        }
        BufferedMessage::new().send(&mut queue, 0, MSG_SCORE);

        assert_eq!(queue.flush_for(1, &mut registry, &DispatchRouter::new()), 5);
        assert_eq!(codes_written(&handles[1]).len(), 5);
        assert!(handles[0].written().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_event_messages_keep_their_event() {
        let mut queue = MessageQueue::new();
        queue.broadcast_event(GameEvent::TimeUpdate { seconds: 5 });
        let message = queue.pending.front().unwrap();
        assert_eq!(message.code(), MSG_TIME_UPDATE);
        assert_eq!(message.recipient(), Some(Recipient::Broadcast));
        let outgoing = message.outgoing();
        assert_eq!(outgoing.payload(), &[0, 0, 0, 5]);
        assert_eq!(outgoing.event, Some(&GameEvent::TimeUpdate { seconds: 5 }));
    }
}
