//! Announcing the server to list servers.
//!
//! At most one request is pending at a time. A newer request replaces it,
//! except that SETNUM never replaces a pending ADD since ADD carries the
//! player counts anyway. Each cycle opens one short connection per list
//! server, writes the request and reads back a single status byte.

use crate::error::ServerError;
use log::{debug, info, warn};
use shared::gameinfo::{GameInfo, TEAM_COUNT};
use shared::protocol::SERVER_VERSION;
use shared::ListServerUrl;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How often the ADD is repeated so the entry never expires.
pub const READVERTISE_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Cap on the REMOVE round at shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

pub const BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), "-tanknet");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListRequest {
    Add,
    Remove,
    SetNum,
}

impl ListRequest {
    fn replaces(self, pending: ListRequest) -> bool {
        !(self == ListRequest::SetNum && pending == ListRequest::Add)
    }
}

/// What the server tells list servers about itself.
#[derive(Debug, Clone)]
pub struct PublicInfo {
    /// `host:port` clients should connect to; also the entry's key.
    pub address: String,
    pub title: String,
    pub game: GameInfo,
}

pub fn format_request(request: ListRequest, info: &PublicInfo) -> String {
    match request {
        ListRequest::Add => {
            let title: String = info
                .title
                .chars()
                .map(|c| if c.is_control() { ' ' } else { c })
                .collect();
            format!(
                "ADD {} {} {} {} {}\n\n",
                info.address,
                String::from_utf8_lossy(SERVER_VERSION),
                BUILD,
                info.game.to_hex(),
                title
            )
        }
        ListRequest::Remove => format!("REMOVE {}\n\n", info.address),
        ListRequest::SetNum => {
            let counts: Vec<String> = info.game.team_counts.iter().map(u16::to_string).collect();
            format!("SETNUM {} {}\n\n", info.address, counts.join(" "))
        }
    }
}

/// One request/status exchange with a list server.
pub async fn send_request(
    server: &ListServerUrl,
    text: &str,
    limit: Duration,
) -> Result<u8, ServerError> {
    let exchange = async {
        let mut stream = TcpStream::connect((server.host.as_str(), server.port)).await?;
        stream.write_all(text.as_bytes()).await?;
        let mut status = [0u8; 1];
        stream.read_exact(&mut status).await?;
        Ok::<u8, ServerError>(status[0])
    };
    timeout(limit, exchange)
        .await
        .map_err(|_| ServerError::ListServerTimeout(server.to_string()))?
}

async fn announce(servers: &[ListServerUrl], text: &str) {
    let command = text.split_whitespace().next().unwrap_or("");
    for server in servers {
        match send_request(server, text, REQUEST_TIMEOUT).await {
            Ok(0) => debug!("List server {} accepted {}", server, command),
            Ok(status) => warn!("List server {} refused {} (status {})", server, command, status),
            Err(e) => warn!("List server {} unreachable: {}", server, e),
        }
    }
}

pub struct Publicizer {
    servers: Vec<ListServerUrl>,
    info: PublicInfo,
    pending: Option<ListRequest>,
    in_flight: Option<JoinHandle<()>>,
    last_add: Option<Instant>,
}

impl Publicizer {
    /// Unparseable URLs are logged and skipped.
    pub fn new(urls: &[String], info: PublicInfo) -> Self {
        let servers = urls
            .iter()
            .filter_map(|url| {
                let server = ListServerUrl::parse(url);
                if server.is_none() {
                    warn!("Skipping list server: {}", ServerError::InvalidListServerUrl(url.clone()));
                }
                server
            })
            .collect::<Vec<_>>();
        if !servers.is_empty() {
            info!("Publicizing {} to {} list server(s)", info.address, servers.len());
        }
        Self {
            servers,
            info,
            pending: None,
            in_flight: None,
            last_add: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.servers.is_empty()
    }

    pub fn pending(&self) -> Option<ListRequest> {
        self.pending
    }

    pub fn queue(&mut self, request: ListRequest) {
        if !self.is_active() {
            return;
        }
        match self.pending {
            Some(pending) if !request.replaces(pending) => {}
            _ => self.pending = Some(request),
        }
    }

    /// Records new team counts and schedules a SETNUM when they changed.
    pub fn update_counts(&mut self, counts: [u16; TEAM_COUNT]) {
        if self.info.game.team_counts != counts {
            self.info.game.team_counts = counts;
            self.queue(ListRequest::SetNum);
        }
    }

    /// Schedules the periodic ADD and starts the pending request once the
    /// previous cycle has finished.
    pub fn tick(&mut self, now: Instant) {
        if !self.is_active() {
            return;
        }
        let due = self
            .last_add
            .map_or(true, |last| now.saturating_duration_since(last) >= READVERTISE_INTERVAL);
        if due {
            self.last_add = Some(now);
            self.queue(ListRequest::Add);
        }
        if self.in_flight.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(request) = self.pending.take() else {
            return;
        };
        let text = format_request(request, &self.info);
        let servers = self.servers.clone();
        self.in_flight = Some(tokio::spawn(async move {
            announce(&servers, &text).await;
        }));
    }

    /// Withdraws the server from every list, giving up after a few seconds.
    pub async fn shutdown(&mut self) {
        if !self.is_active() {
            return;
        }
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        self.pending = None;
        let text = format_request(ListRequest::Remove, &self.info);
        if timeout(SHUTDOWN_TIMEOUT, announce(&self.servers, &text))
            .await
            .is_err()
        {
            warn!("List servers did not confirm removal in time");
        }
    }
}
