//! A headless player connection to a game server.
//!
//! The TCP stream carries the greeting, entry and everything reliable. Once
//! entered, [`ServerLink::establish_udp`] offers the server a datagram path:
//! the link request is resent until the server echoes it back over UDP, and
//! only then is `UDPLinkEstablished` confirmed over TCP. Player updates go by
//! UDP from that point on.

use crate::error::LinkError;
use log::{debug, info, warn};
use shared::framing::split_datagram;
use shared::protocol::{
    CALLSIGN_LEN, HELLO_LEN, MSG_ENTER, MSG_EXIT, MSG_LAG_PING, MSG_MESSAGE,
    MSG_UDP_LINK_ESTABLISHED, MSG_UDP_LINK_REQUEST, NO_PLAYER, SERVER_VERSION,
};
use shared::{encode_frame, FrameBuffer, GameEvent, Pack, PlayerIndex, PlayerState, MAX_PACKET_LEN};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_LINK_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_LINK_RETRY: Duration = Duration::from_millis(250);

pub struct ServerLink {
    stream: TcpStream,
    udp: UdpSocket,
    server: SocketAddr,
    player: PlayerIndex,
    frames: FrameBuffer,
    udp_linked: bool,
    inbound: VecDeque<GameEvent>,
}

impl ServerLink {
    /// Connects, reads the greeting and opens the local UDP socket.
    pub async fn connect(server: SocketAddr) -> Result<Self, LinkError> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(server))
            .await
            .map_err(|_| LinkError::Timeout("connect"))??;
        stream.set_nodelay(true)?;

        let mut hello = [0u8; HELLO_LEN];
        timeout(CONNECT_TIMEOUT, stream.read_exact(&mut hello))
            .await
            .map_err(|_| LinkError::Timeout("greeting"))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => LinkError::Closed,
                _ => LinkError::Io(e),
            })?;
        let version = &hello[..SERVER_VERSION.len()];
        if version != SERVER_VERSION {
            return Err(LinkError::BadVersion(
                String::from_utf8_lossy(version).into_owned(),
            ));
        }
        let player = hello[HELLO_LEN - 1];
        if player == NO_PLAYER {
            return Err(LinkError::ServerFull);
        }

        let local_ip = stream.local_addr()?.ip();
        let udp = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        info!("Connected to {} as player {}", server, player);

        Ok(Self {
            stream,
            udp,
            server,
            player,
            frames: FrameBuffer::new(),
            udp_linked: false,
            inbound: VecDeque::new(),
        })
    }

    pub fn player(&self) -> PlayerIndex {
        self.player
    }

    pub fn has_udp(&self) -> bool {
        self.udp_linked
    }

    async fn send_tcp(&mut self, code: u16, payload: &[u8]) -> Result<(), LinkError> {
        let frame = encode_frame(code, payload)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Joins the game. Events that arrive before the answer are kept for
    /// [`ServerLink::next_event`].
    pub async fn enter(&mut self, callsign: &str, player_type: u16, team: u16) -> Result<(), LinkError> {
        let mut payload = Vec::new();
        payload
            .pack_u16(player_type)
            .pack_u16(team)
            .pack_fixed_str(callsign, CALLSIGN_LEN);
        self.send_tcp(MSG_ENTER, &payload).await?;

        let mut held = Vec::new();
        loop {
            while let Some(event) = self.inbound.pop_front() {
                match event {
                    GameEvent::Accept { index } => {
                        debug!("Entered as player {}", index);
                        for event in held.into_iter().rev() {
                            self.inbound.push_front(event);
                        }
                        return Ok(());
                    }
                    GameEvent::Reject { code, reason } => {
                        return Err(LinkError::Rejected { code, reason });
                    }
                    other => held.push(other),
                }
            }
            self.fill().await?;
        }
    }

    /// Offers the server a UDP path and waits for it to answer.
    pub async fn establish_udp(&mut self) -> Result<(), LinkError> {
        let request = encode_frame(MSG_UDP_LINK_REQUEST, &[self.player])?;
        let deadline = Instant::now() + UDP_LINK_TIMEOUT;
        while !self.udp_linked {
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout("UDP link"));
            }
            self.udp.send_to(&request, self.server).await?;
            if let Ok(filled) = timeout(UDP_LINK_RETRY, self.fill()).await {
                filled?;
            }
        }
        self.send_tcp(MSG_UDP_LINK_ESTABLISHED, &[]).await?;
        info!("UDP link to {} established", self.server);
        Ok(())
    }

    /// Sends chat to a player, a team target or everyone.
    pub async fn send_chat(&mut self, target: PlayerIndex, text: &str) -> Result<(), LinkError> {
        let mut payload = vec![target, 0];
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        self.send_tcp(MSG_MESSAGE, &payload).await
    }

    pub async fn send_update(&mut self, timestamp: f64, state: &PlayerState) -> Result<(), LinkError> {
        let mut payload = Vec::new();
        payload.pack_u8(self.player).pack_f64(timestamp);
        let code = state.pack(&mut payload);
        if self.udp_linked {
            let frame = encode_frame(code, &payload)?;
            self.udp.send_to(&frame, self.server).await?;
            Ok(())
        } else {
            self.send_tcp(code, &payload).await
        }
    }

    pub async fn exit(mut self) -> Result<(), LinkError> {
        self.send_tcp(MSG_EXIT, &[]).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Waits for the next event from either path. Lag pings are answered
    /// before they are handed out.
    pub async fn next_event(&mut self) -> Result<GameEvent, LinkError> {
        loop {
            if let Some(event) = self.inbound.pop_front() {
                if let GameEvent::LagPing { sequence } = event {
                    self.send_tcp(MSG_LAG_PING, &sequence.to_be_bytes()).await?;
                }
                return Ok(event);
            }
            self.fill().await?;
        }
    }

    /// Reads from whichever socket is ready first and queues what it held.
    async fn fill(&mut self) -> Result<(), LinkError> {
        let mut chunk = [0u8; 4096];
        let mut datagram = [0u8; MAX_PACKET_LEN];
        tokio::select! {
            read = self.stream.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    return Err(LinkError::Closed);
                }
                self.frames.extend(&chunk[..n]);
                while let Some(frame) = self.frames.next_frame()? {
                    let event = GameEvent::decode(frame.code, &frame.payload)?;
                    self.inbound.push_back(event);
                }
            }
            received = self.udp.recv_from(&mut datagram) => {
                let (n, source) = received?;
                self.accept_datagram(&datagram[..n], source);
            }
        }
        Ok(())
    }

    fn accept_datagram(&mut self, data: &[u8], source: SocketAddr) {
        if source.ip() != self.server.ip() {
            debug!("Ignoring datagram from {}", source);
            return;
        }
        for frame in split_datagram(data) {
            match GameEvent::decode(frame.code, frame.payload) {
                Ok(GameEvent::UdpLinkRequest { index }) if index == self.player => {
                    self.udp_linked = true;
                }
                Ok(event) => self.inbound.push_back(event),
                Err(e) => warn!("Dropping datagram frame from {}: {}", source, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{MSG_ACCEPT, MSG_ADD_PLAYER, MSG_REJECT, REJECT_BAD_CALLSIGN};
    use shared::OwnedFrame;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    /// One-connection server that greets with `hello_index` and hands the
    /// stream to `script`.
    async fn fake_server<F, Fut>(version: &'static [u8; 8], hello_index: u8, script: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hello = version.to_vec();
            hello.push(hello_index);
            stream.write_all(&hello).await.unwrap();
            script(stream).await;
        });
        addr
    }

    async fn read_frame(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> OwnedFrame {
        loop {
            if let Some(frame) = buffer.next_frame().unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 256];
            let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
            assert!(n > 0);
            buffer.extend(&chunk[..n]);
        }
    }

    fn added_frame(id: u8) -> Vec<u8> {
        let mut payload = Vec::new();
        GameEvent::PlayerAdded {
            id,
            player_type: 0,
            team: 1,
            wins: 0,
            losses: 0,
            team_kills: 0,
            callsign: "other".into(),
        }
        .pack(&mut payload);
        encode_frame(MSG_ADD_PLAYER, &payload).unwrap()
    }

    #[tokio::test]
    async fn test_enter_keeps_early_events() {
        let addr = fake_server(SERVER_VERSION, 3, |mut stream| async move {
            let mut buffer = FrameBuffer::new();
            let enter = read_frame(&mut stream, &mut buffer).await;
            assert_eq!(enter.code, MSG_ENTER);
            assert_eq!(enter.payload.len(), 4 + CALLSIGN_LEN);

            let mut reply = added_frame(1);
            reply.extend(encode_frame(MSG_ACCEPT, &[3]).unwrap());
            reply.extend(added_frame(2));
            stream.write_all(&reply).await.unwrap();

            let chat = read_frame(&mut stream, &mut buffer).await;
            assert_eq!(chat.code, MSG_MESSAGE);
            assert_eq!(chat.payload, b"\xfe\x00hi\x00");
        })
        .await;

        let mut link = ServerLink::connect(addr).await.unwrap();
        assert_eq!(link.player(), 3);
        assert!(!link.has_udp());
        link.enter("tester", 0, 1).await.unwrap();

        let first = link.next_event().await.unwrap();
        let second = link.next_event().await.unwrap();
        assert!(matches!(first, GameEvent::PlayerAdded { id: 1, .. }));
        assert!(matches!(second, GameEvent::PlayerAdded { id: 2, .. }));
        link.send_chat(254, "hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_enter_rejected() {
        let addr = fake_server(SERVER_VERSION, 0, |mut stream| async move {
            let mut buffer = FrameBuffer::new();
            read_frame(&mut stream, &mut buffer).await;
            let mut payload = REJECT_BAD_CALLSIGN.to_be_bytes().to_vec();
            payload.extend_from_slice(b"bad callsign");
            stream
                .write_all(&encode_frame(MSG_REJECT, &payload).unwrap())
                .await
                .unwrap();
        })
        .await;

        let mut link = ServerLink::connect(addr).await.unwrap();
        match link.enter("", 0, 1).await {
            Err(LinkError::Rejected { code, reason }) => {
                assert_eq!(code, REJECT_BAD_CALLSIGN);
                assert_eq!(reason, "bad callsign");
            }
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_full_server() {
        let addr = fake_server(SERVER_VERSION, NO_PLAYER, |_| async {}).await;
        assert!(matches!(
            ServerLink::connect(addr).await,
            Err(LinkError::ServerFull)
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let addr = fake_server(b"BZFS0026", 0, |_| async {}).await;
        match ServerLink::connect(addr).await {
            Err(LinkError::BadVersion(version)) => assert_eq!(version, "BZFS0026"),
            _ => panic!("expected a version mismatch"),
        }
    }

    #[tokio::test]
    async fn test_lag_ping_is_echoed() {
        let addr = fake_server(SERVER_VERSION, 0, |mut stream| async move {
            stream
                .write_all(&encode_frame(MSG_LAG_PING, &[0x12, 0x34]).unwrap())
                .await
                .unwrap();
            let mut buffer = FrameBuffer::new();
            let echo = read_frame(&mut stream, &mut buffer).await;
            assert_eq!(echo.code, MSG_LAG_PING);
            assert_eq!(echo.payload, vec![0x12, 0x34]);
        })
        .await;

        let mut link = ServerLink::connect(addr).await.unwrap();
        let event = timeout(WAIT, link.next_event()).await.unwrap().unwrap();
        assert_eq!(event, GameEvent::LagPing { sequence: 0x1234 });
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let addr = fake_server(SERVER_VERSION, 0, |stream| async move { drop(stream) }).await;
        let mut link = ServerLink::connect(addr).await.unwrap();
        assert!(matches!(
            timeout(WAIT, link.next_event()).await.unwrap(),
            Err(LinkError::Closed)
        ));
    }
}
