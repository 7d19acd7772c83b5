//! List server network layer: accepts clients and answers one request per
//! connection.

use crate::config::ListServerConfig;
use crate::directory::{AddOutcome, Directory, Entry, EntryId};
use crate::error::{DirectoryError, ListServerError, RequestError};
use crate::http::response_header;
use crate::request::{find_message_end, AddRequest, Command, Request, MAX_REQUEST_LEN};
use crate::stats::{Stats, StatsSnapshot};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::time::{interval, timeout, MissedTickBehavior};

/// State shared by the accept loop and every client task.
pub struct Shared {
    pub config: ListServerConfig,
    pub directory: RwLock<Directory>,
    pub stats: Stats,
}

#[derive(Debug)]
pub enum ControlMessage {
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ListServerHandle {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ListServerHandle {
    pub fn shutdown(&self) {
        if self.tx.send(ControlMessage::Shutdown).is_err() {
            debug!("List server already stopped");
        }
    }
}

pub struct ListServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    clients: Arc<Semaphore>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl ListServer {
    pub async fn bind(config: ListServerConfig) -> Result<Self, ListServerError> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        info!("List server listening on {}", listener.local_addr()?);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            clients: Arc::new(Semaphore::new(config.max_clients)),
            shared: Arc::new(Shared {
                directory: RwLock::new(Directory::new(config.expiration)),
                stats: Stats::new(),
                config,
            }),
            control_tx,
            control_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ListServerHandle {
        ListServerHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Seeds the directory from the configured bootstrap files. Returns how
    /// many servers were listed. Unreadable files are skipped.
    pub async fn bootstrap(&self) -> usize {
        let mut listed = 0;
        for path in &self.shared.config.bootstrap {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => listed += self.bootstrap_from(&contents).await,
                Err(e) => warn!("Cannot read bootstrap file {}: {}", path.display(), e),
            }
        }
        listed
    }

    async fn bootstrap_from(&self, contents: &str) -> usize {
        let mut directory = self.shared.directory.write().await;
        let mut listed = 0;
        for line in contents.lines() {
            let Some(request) = AddRequest::from_args(line.trim_end()) else {
                continue;
            };
            let host = request
                .name
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string();
            match directory.add(request, host, false, Instant::now()) {
                Ok(_) => listed += 1,
                Err(e) => debug!("Skipping bootstrap line {:?}: {}", line, e),
            }
        }
        listed
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let permit = match Arc::clone(&self.clients).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Too many clients, dropping {}", peer);
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = serve_client(stream, peer, shared).await {
                debug!("Client {} dropped: {}", peer, e);
            }
            drop(permit);
        });
    }

    fn log_stats(&self, last: &mut StatsSnapshot) {
        let now = self.shared.stats.snapshot();
        info!("Requests this interval: {}", now.since(last));
        info!("Requests in total: {}", now);
        *last = now;
    }

    /// Main list server loop
    pub async fn run(&mut self) -> Result<(), ListServerError> {
        let mut check_interval = interval(self.shared.config.check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stats_period = self
            .shared
            .config
            .stats_interval
            .unwrap_or(Duration::from_secs(3600));
        let mut stats_interval = interval(stats_period);
        stats_interval.tick().await;
        let mut last_stats = self.shared.stats.snapshot();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                },

                message = self.control_rx.recv() => {
                    match message {
                        Some(ControlMessage::Shutdown) | None => break,
                    }
                },

                _ = check_interval.tick() => {
                    let mut directory = self.shared.directory.write().await;
                    let freed = directory.check_list(Instant::now());
                    if freed > 0 {
                        debug!("Freed {} servers, {} listed", freed, directory.len());
                    }
                },

                _ = stats_interval.tick(), if self.shared.config.stats_interval.is_some() => {
                    self.log_stats(&mut last_stats);
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C");
                    break;
                }
            }
        }

        info!("List server shutting down");
        Ok(())
    }
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), ListServerError> {
    let text = match read_request(&mut stream, &shared).await {
        Ok(Some(text)) => text,
        Ok(None) => return Ok(()),
        Err(e) => {
            if matches!(e, ListServerError::Request(_)) {
                shared.stats.record_bad();
            }
            return Err(e);
        }
    };
    let request = match Request::parse(&text) {
        Ok(request) => request,
        Err(e) => {
            match &e {
                RequestError::Malformed(command) => shared.stats.record(*command, true),
                _ => shared.stats.record_bad(),
            }
            return Err(e.into());
        }
    };
    debug!("{} from {}", request.command(), peer);

    match request {
        Request::Add(add) => {
            let status = add_server(add, peer, &shared).await;
            shared.stats.record(Command::Add, status != 0);
            send(&mut stream, &[status], &shared).await
        }
        Request::Remove { name } => {
            let result = shared.directory.write().await.remove(&name);
            let status = status_of(result, peer);
            shared.stats.record(Command::Remove, status != 0);
            send(&mut stream, &[status], &shared).await
        }
        Request::SetNum { name, counts } => {
            let result = shared
                .directory
                .write()
                .await
                .set_num(&name, &counts, Instant::now());
            let status = status_of(result, peer);
            shared.stats.record(Command::SetNum, status != 0);
            send(&mut stream, &[status], &shared).await
        }
        Request::List => {
            shared.stats.record(Command::List, false);
            send_listing(&mut stream, &shared).await
        }
        Request::Get { path } => {
            debug!("GET {} from {}", path, peer);
            shared.stats.record(Command::Get, false);
            let last_change = shared.directory.read().await.last_change();
            let header = response_header(SystemTime::now(), last_change);
            send(&mut stream, header.as_bytes(), &shared).await?;
            send_listing(&mut stream, &shared).await
        }
    }
}

fn status_of(result: Result<(), DirectoryError>, peer: SocketAddr) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            debug!("Request from {} refused: {}", peer, e);
            1
        }
    }
}

/// Reads until a blank line. `None` when the client hangs up first.
async fn read_request(
    stream: &mut TcpStream,
    shared: &Shared,
) -> Result<Option<String>, ListServerError> {
    let mut buf = [0u8; MAX_REQUEST_LEN];
    let mut filled = 0;
    loop {
        let n = timeout(shared.config.disconnect_timeout, stream.read(&mut buf[filled..]))
            .await
            .map_err(|_| ListServerError::Timeout)??;
        if n == 0 {
            return Ok(None);
        }
        shared.stats.add_read(n);
        filled += n;
        if let Some(end) = find_message_end(&buf[..filled]) {
            let text = std::str::from_utf8(&buf[..end]).map_err(|_| RequestError::NotText)?;
            return Ok(Some(text.to_string()));
        }
        if filled == buf.len() {
            return Err(RequestError::TooLong(MAX_REQUEST_LEN).into());
        }
    }
}

async fn send(stream: &mut TcpStream, bytes: &[u8], shared: &Shared) -> Result<(), ListServerError> {
    timeout(shared.config.disconnect_timeout, stream.write_all(bytes))
        .await
        .map_err(|_| ListServerError::Timeout)??;
    shared.stats.add_written(bytes.len());
    Ok(())
}

/// Streams every fresh entry. Entries the cursor has not reached stay
/// referenced, so they cannot be freed mid-listing; whatever is left when
/// the client goes away is released.
async fn send_listing(stream: &mut TcpStream, shared: &Shared) -> Result<(), ListServerError> {
    let ids = shared.directory.write().await.begin_listing();
    let mut cursor = ids.into_iter();
    let mut result = Ok(());
    while let Some(id) = cursor.next() {
        let line = shared.directory.write().await.advance(id);
        if let Some(line) = line {
            if let Err(e) = send(stream, line.as_bytes(), shared).await {
                result = Err(e);
                break;
            }
        }
    }
    let rest: Vec<EntryId> = cursor.collect();
    if !rest.is_empty() {
        shared.directory.write().await.release(&rest);
    }
    result
}

async fn add_server(request: AddRequest, peer: SocketAddr, shared: &Arc<Shared>) -> u8 {
    let outcome = shared.directory.write().await.add(
        request,
        peer.ip().to_string(),
        shared.config.probe,
        Instant::now(),
    );
    match outcome {
        Ok(AddOutcome::Refreshed(_)) | Ok(AddOutcome::Inserted(_)) => 0,
        Ok(AddOutcome::NeedsProbe(entry)) => {
            tokio::spawn(probe(entry, Arc::clone(shared)));
            0
        }
        Err(e) => {
            debug!("ADD from {} refused: {}", peer, e);
            1
        }
    }
}

/// Lists the server only if it accepts a TCP connection.
async fn probe(entry: Entry, shared: Arc<Shared>) {
    let reached = match entry.port() {
        Some(port) => {
            match timeout(
                shared.config.probe_timeout,
                TcpStream::connect((entry.host(), port)),
            )
            .await
            {
                Ok(Ok(stream)) => stream.peer_addr().ok().map(|addr| addr.ip().to_string()),
                Ok(Err(e)) => {
                    debug!("Probe of {} failed: {}", entry.name, e);
                    None
                }
                Err(_) => {
                    debug!("Probe of {} timed out", entry.name);
                    None
                }
            }
        }
        None => None,
    };
    shared.directory.write().await.finish_probe(entry, reached);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> ListServerConfig {
        ListServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            probe: false,
            stats_interval: None,
            ..ListServerConfig::default()
        }
    }

    async fn start(config: ListServerConfig) -> (SocketAddr, ListServerHandle, JoinHandle<()>) {
        let mut server = ListServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });
        (addr, handle, task)
    }

    async fn request(addr: SocketAddr, text: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(text.as_bytes()).await.unwrap();
        let mut reply = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    async fn listing(addr: SocketAddr) -> String {
        String::from_utf8(request(addr, "LIST\n\n").await).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let (addr, handle, task) = start(test_config()).await;

        let status = request(addr, "ADD host:1234 BZFS0221 build1 gameinfo My Server\n\n").await;
        assert_eq!(status, vec![0]);
        let status = request(addr, "ADD host:1234 BZFS0221 build1 gameinfo Renamed\r\n\r\n").await;
        assert_eq!(status, vec![0]);

        assert_eq!(
            listing(addr).await,
            "host:1234 BZFS0221 gameinfo 127.0.0.1 Renamed\r\n"
        );

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_bytes_for_refusals() {
        let (addr, handle, task) = start(test_config()).await;

        assert_eq!(request(addr, "ADD h:1 XYZ0221 b g t\n\n").await, vec![1]);
        assert_eq!(request(addr, "REMOVE h:1\n\n").await, vec![1]);
        assert_eq!(request(addr, "SETNUM h:1 0 0 0 0 0\n\n").await, vec![1]);

        assert_eq!(request(addr, "ADD h:1 BZFS0221 b g t\n\n").await, vec![0]);
        assert_eq!(request(addr, "SETNUM h:1 0 1 0 0 0\n\n").await, vec![0]);
        assert_eq!(request(addr, "REMOVE h:1\n\n").await, vec![0]);
        assert_eq!(listing(addr).await, "");

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_requests_are_dropped() {
        let (addr, handle, task) = start(test_config()).await;

        assert!(request(addr, "HELLO there\n\n").await.is_empty());
        assert!(request(addr, "SETNUM h:1 a b\n\n").await.is_empty());

        let flood = "A".repeat(MAX_REQUEST_LEN + 10);
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(flood.as_bytes()).await;
        let mut reply = Vec::new();
        let read = timeout(WAIT, stream.read_to_end(&mut reply)).await.unwrap();
        assert!(read.is_err() || reply.is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_renders_http() {
        let (addr, handle, task) = start(test_config()).await;
        request(addr, "ADD tanks:5155 BZFS0221 b info Arena\n\n").await;

        let reply = String::from_utf8(request(addr, "GET / HTTP/1.0\r\n\r\n").await).unwrap();
        let (header, body) = reply.split_once("\r\n\r\n").unwrap();
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Type: text/plain"));
        assert_eq!(body, "tanks:5155 BZFS0221 info 127.0.0.1 Arena\r\n");

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_lists_reachable_server() {
        let game = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let game_port = game.local_addr().unwrap().port();
        tokio::spawn(async move { while game.accept().await.is_ok() {} });

        let config = ListServerConfig {
            probe: true,
            ..test_config()
        };
        let (addr, handle, task) = start(config).await;

        let add = format!("ADD 127.0.0.1:{} BZFS0221 b info Probed\n\n", game_port);
        assert_eq!(request(addr, &add).await, vec![0]);

        let expected = format!("127.0.0.1:{} BZFS0221 info 127.0.0.1 Probed\r\n", game_port);
        let deadline = Instant::now() + WAIT;
        loop {
            if listing(addr).await == expected {
                break;
            }
            assert!(Instant::now() < deadline, "probed server never listed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_lines() {
        let server = ListServer::bind(test_config()).await.unwrap();
        let listed = server
            .bootstrap_from("a:1 BZFS0221 b info First\n\nbroken\nb:2 BZFS0221 b info Second one\n")
            .await;
        assert_eq!(listed, 2);
        let shared = server.shared();
        let directory = shared.directory.read().await;
        assert!(directory.find("a:1").is_some());
        assert_eq!(
            directory.get(directory.find("b:2").unwrap()).unwrap().title,
            "Second one"
        );
    }
}
