//! Demultiplexing of datagrams arriving on the shared UDP socket.

use crate::registry::SessionRegistry;
use log::{debug, info, warn};
use shared::framing::{encode_frame, peek_header, split_datagram, OwnedFrame, HEADER_LEN};
use shared::protocol::{
    code_name, is_udp_acceptable, MSG_UDP_LINK_ESTABLISHED, MSG_UDP_LINK_REQUEST,
    PING_CODE_REPLY, PING_CODE_REQUEST, SERVER_VERSION,
};
use shared::{FrameError, Pack, PlayerIndex};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// A server ping from anyone; answer with [`ping_reply`].
    Ping,
    /// A link request matched a session, whose UDP source is now confirmed.
    /// Answer with [`link_request_reply`] so the client learns the path
    /// works.
    LinkRequest { player: PlayerIndex },
    /// Frames from a session with confirmed inbound UDP.
    Frames {
        player: PlayerIndex,
        frames: Vec<OwnedFrame>,
    },
    Discarded,
}

/// Classifies one datagram and updates the matching session's UDP state.
///
/// Confirmed sessions are matched by address and port. A link request is
/// accepted from any source whose IP matches the session it names, since
/// the client's UDP port is not known until that request arrives. The
/// request is honoured even when the session has not finished entering the
/// game.
pub fn demux_datagram(
    registry: &mut SessionRegistry,
    data: &[u8],
    source: SocketAddr,
    now: Instant,
) -> DatagramOutcome {
    if let Some(header) = peek_header(data) {
        if data.len() == HEADER_LEN + 2 && header.len == 2 && header.code == PING_CODE_REQUEST {
            return DatagramOutcome::Ping;
        }
    }

    if let Some(player) = registry.find_by_address_port(source, true) {
        let Some(session) = registry.get_mut(player) else {
            return DatagramOutcome::Discarded;
        };
        session.touch(now);
        let Some(conn) = session.connection_mut() else {
            return DatagramOutcome::Discarded;
        };

        let mut frames = Vec::new();
        for frame in split_datagram(data) {
            if !is_udp_acceptable(frame.code) {
                warn!(
                    "Player {} sent {} over UDP, discarding",
                    player,
                    code_name(frame.code)
                );
                continue;
            }
            conn.note_udp_received(frame.code, frame.consumed);
            if frame.code == MSG_UDP_LINK_ESTABLISHED {
                conn.enable_udp_outbound();
            }
            frames.push(frame.to_owned_frame());
        }
        return DatagramOutcome::Frames { player, frames };
    }

    if let Some(header) = peek_header(data) {
        if header.code == MSG_UDP_LINK_REQUEST && header.len == 1 && data.len() > HEADER_LEN {
            let index = data[HEADER_LEN];
            if let Some(conn) = registry.connection_mut(index) {
                if !conn.is_closed() && !conn.udp_inbound() && conn.matches_udp(source, false) {
                    conn.confirm_udp_peer(source);
                    info!("Player {} linked UDP from {}", index, source);
                    return DatagramOutcome::LinkRequest { player: index };
                }
            }
        }
    }

    debug!("Discarding {} byte datagram from {}", data.len(), source);
    DatagramOutcome::Discarded
}

/// Frame a confirmed client receives over UDP in answer to its link request.
pub fn link_request_reply(player: PlayerIndex) -> Result<Vec<u8>, FrameError> {
    encode_frame(MSG_UDP_LINK_REQUEST, &[player])
}

/// Answer to a ping: version, current and maximum player counts.
pub fn ping_reply(players: usize, max_players: usize) -> Result<Vec<u8>, FrameError> {
    let mut payload = Vec::new();
    payload
        .pack_bytes(SERVER_VERSION)
        .pack_u8(players.min(u8::MAX as usize) as u8)
        .pack_u8(max_players.min(u8::MAX as usize) as u8);
    encode_frame(PING_CODE_REPLY, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryDatagrams, MemoryStream};
    use shared::protocol::{MSG_MESSAGE, MSG_PLAYER_UPDATE};

    fn tcp_peer() -> SocketAddr {
        "172.16.0.4:50000".parse().unwrap()
    }

    fn udp_source() -> SocketAddr {
        "172.16.0.4:50001".parse().unwrap()
    }

    fn registry_with_player() -> (SessionRegistry, PlayerIndex) {
        let mut registry = SessionRegistry::new(4);
        let (stream, _) = MemoryStream::pair();
        let player = registry
            .add_connection(Box::new(stream), MemoryDatagrams::new(), tcp_peer(), Instant::now())
            .unwrap();
        (registry, player)
    }

    fn link_request(index: PlayerIndex) -> Vec<u8> {
        encode_frame(MSG_UDP_LINK_REQUEST, &[index]).unwrap()
    }

    #[test]
    fn test_ping_request_recognized_from_anyone() {
        let mut registry = SessionRegistry::new(4);
        let ping = encode_frame(PING_CODE_REQUEST, &[0, 0]).unwrap();
        assert_eq!(
            demux_datagram(&mut registry, &ping, udp_source(), Instant::now()),
            DatagramOutcome::Ping
        );
    }

    #[test]
    fn test_link_request_confirms_source_port() {
        let (mut registry, player) = registry_with_player();
        let outcome = demux_datagram(&mut registry, &link_request(player), udp_source(), Instant::now());
        assert_eq!(outcome, DatagramOutcome::LinkRequest { player });

        let conn = registry.connection_mut(player).unwrap();
        assert!(conn.udp_inbound());
        assert_eq!(conn.udp_peer(), udp_source());
    }

    #[test]
    fn test_link_request_from_other_host_is_discarded() {
        let (mut registry, player) = registry_with_player();
        let stranger: SocketAddr = "172.16.0.9:50001".parse().unwrap();
        assert_eq!(
            demux_datagram(&mut registry, &link_request(player), stranger, Instant::now()),
            DatagramOutcome::Discarded
        );
        assert!(!registry.connection_mut(player).unwrap().udp_inbound());
    }

    #[test]
    fn test_link_request_for_unknown_slot_is_discarded() {
        let (mut registry, _) = registry_with_player();
        assert_eq!(
            demux_datagram(&mut registry, &link_request(7), udp_source(), Instant::now()),
            DatagramOutcome::Discarded
        );
    }

    #[test]
    fn test_confirmed_traffic_is_split_and_filtered() {
        let (mut registry, player) = registry_with_player();
        demux_datagram(&mut registry, &link_request(player), udp_source(), Instant::now());

        let mut datagram = encode_frame(MSG_PLAYER_UPDATE, &[player; 15]).unwrap();
        datagram.extend(encode_frame(MSG_MESSAGE, b"\x00\x00spoof\x00").unwrap());
        datagram.extend(encode_frame(MSG_UDP_LINK_ESTABLISHED, &[]).unwrap());

        match demux_datagram(&mut registry, &datagram, udp_source(), Instant::now()) {
            DatagramOutcome::Frames { player: from, frames } => {
                assert_eq!(from, player);
                let codes: Vec<u16> = frames.iter().map(|f| f.code).collect();
                assert_eq!(codes, vec![MSG_PLAYER_UPDATE, MSG_UDP_LINK_ESTABLISHED]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.connection_mut(player).unwrap().udp_outbound());
    }

    #[test]
    fn test_unconfirmed_traffic_is_discarded() {
        let (mut registry, _) = registry_with_player();
        let datagram = encode_frame(MSG_PLAYER_UPDATE, &[0; 15]).unwrap();
        assert_eq!(
            demux_datagram(&mut registry, &datagram, udp_source(), Instant::now()),
            DatagramOutcome::Discarded
        );
    }

    #[test]
    fn test_ping_reply_layout() {
        let reply = ping_reply(3, 32).unwrap();
        assert_eq!(&reply[4..12], SERVER_VERSION);
        assert_eq!(&reply[12..], &[3, 32]);
    }
}
